use crate::bots::BotFilter;
use crate::config::{ImprintConfig, StorageMode};
use crate::gate::{self, GateError, Guard};
use crate::logging::append_impression_event;
use crate::queue::{QueueError, QueueSink};
use crate::request::RequestContext;
use crate::statement::{Impressionable, ImpressionStatement, StatementBuilder, StatementOverrides};
use crate::store::{DurableStore, RecordedImpression, StoreError};
use crate::uniqueness::{self, UniquenessSpec};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("impression gate failed: {source}")]
    Gate {
        #[source]
        source: GateError,
    },
    #[error("durable store rejected impression: {source}")]
    Store {
        #[source]
        source: StoreError,
    },
    #[error("queue sink rejected impression: {source}")]
    Queue {
        #[source]
        source: QueueError,
    },
    #[error("queue sink is unavailable and the direct path has no fallback")]
    QueueUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Bot traffic or a failed if/unless condition.
    Gated,
    /// The action is not in the caller's `actions` restriction.
    ActionNotTracked,
    /// A matching prior recording exists under the uniqueness spec.
    Duplicate,
}

#[derive(Debug)]
pub enum RecordOutcome {
    Recorded(RecordedImpression),
    Queued,
    Skipped(SkipReason),
}

/// Per-call configuration surface.
#[derive(Default)]
pub struct RecordOptions<'a> {
    /// Direct path only: record solely when the request's action is in
    /// this set. Empty means every action records.
    pub actions: Vec<String>,
    /// Empty means no uniqueness enforced; every call records.
    pub unique: UniquenessSpec,
    pub only_if: Option<Guard<'a>>,
    pub unless: Option<Guard<'a>>,
    pub overrides: StatementOverrides,
}

pub enum SinkChoice<'a> {
    Store(&'a dyn DurableStore),
    Queue(&'a dyn QueueSink),
}

/// Chooses between the durable store and the queue sink. The mode is
/// fixed once per process; the queue liveness probe runs on every call
/// and is never cached.
pub struct WriteRouter {
    mode: StorageMode,
    store: Box<dyn DurableStore>,
    queue: Option<Box<dyn QueueSink>>,
}

impl WriteRouter {
    pub fn new(
        mode: StorageMode,
        store: Box<dyn DurableStore>,
        queue: Option<Box<dyn QueueSink>>,
    ) -> Self {
        Self { mode, store, queue }
    }

    pub fn store(&self) -> &dyn DurableStore {
        self.store.as_ref()
    }

    /// Direct path routing: queue mode with a dead sink is an error,
    /// this path defines no fallback.
    pub fn direct_sink(&self) -> Result<SinkChoice<'_>, RecordError> {
        match self.mode {
            StorageMode::Direct => Ok(SinkChoice::Store(self.store.as_ref())),
            StorageMode::Queue => match self.live_queue() {
                Some(queue) => Ok(SinkChoice::Queue(queue)),
                None => Err(RecordError::QueueUnavailable),
            },
        }
    }

    /// Associative path routing: a dead queue falls back to the
    /// per-instance store path. The flag reports a taken fallback.
    pub fn associative_sink(&self) -> (SinkChoice<'_>, bool) {
        match self.mode {
            StorageMode::Direct => (SinkChoice::Store(self.store.as_ref()), false),
            StorageMode::Queue => match self.live_queue() {
                Some(queue) => (SinkChoice::Queue(queue), false),
                None => (SinkChoice::Store(self.store.as_ref()), true),
            },
        }
    }

    fn live_queue(&self) -> Option<&dyn QueueSink> {
        self.queue.as_deref().filter(|queue| queue.is_live())
    }
}

/// Orchestrates one recording: gate, build statement, uniqueness check
/// on direct-store paths, then route to the configured sink. No state
/// survives an invocation and nothing here retries; store and queue
/// failures propagate to the caller.
pub struct ImpressionRecorder {
    config: ImprintConfig,
    bots: BotFilter,
    router: WriteRouter,
}

impl ImpressionRecorder {
    pub fn new(
        config: ImprintConfig,
        store: Box<dyn DurableStore>,
        queue: Option<Box<dyn QueueSink>>,
    ) -> Self {
        let bots = BotFilter::new(config.bot_signatures.clone());
        let router = WriteRouter::new(config.storage, store, queue);
        Self {
            config,
            bots,
            router,
        }
    }

    /// Direct path: subject inferred from the route, uniqueness checked
    /// against the global impression table.
    pub fn record(
        &self,
        ctx: &RequestContext,
        options: &RecordOptions<'_>,
    ) -> Result<RecordOutcome, RecordError> {
        if !self.gate(ctx, options)? {
            return Ok(RecordOutcome::Skipped(SkipReason::Gated));
        }
        if !options.actions.is_empty() && !options.actions.iter().any(|action| action == &ctx.action)
        {
            return Ok(RecordOutcome::Skipped(SkipReason::ActionNotTracked));
        }

        let builder = StatementBuilder::new(&self.config.redacted_params);
        let statement = builder.direct(ctx, &options.overrides);

        match self.router.direct_sink()? {
            SinkChoice::Store(store) => {
                if !uniqueness::is_unique(&statement, &options.unique, store)
                    .map_err(|source| RecordError::Store { source })?
                {
                    self.log_duplicate(&statement);
                    return Ok(RecordOutcome::Skipped(SkipReason::Duplicate));
                }
                self.insert(store, statement)
            }
            SinkChoice::Queue(queue) => self.enqueue(queue, statement),
        }
    }

    /// Associative path: the caller supplies the subject, uniqueness is
    /// scoped to that subject's own recordings.
    pub fn record_subject(
        &self,
        ctx: &RequestContext,
        subject: &dyn Impressionable,
        options: &RecordOptions<'_>,
    ) -> Result<RecordOutcome, RecordError> {
        if !self.gate(ctx, options)? {
            return Ok(RecordOutcome::Skipped(SkipReason::Gated));
        }

        let subject_ref = subject.subject_ref();
        let builder = StatementBuilder::new(&self.config.redacted_params);
        let statement = builder.associative(ctx, subject_ref.clone(), &options.overrides);

        let (sink, fell_back) = self.router.associative_sink();
        if fell_back {
            self.log_event(
                "queue_fallback",
                &[(
                    "requestFingerprint",
                    Value::String(statement.request_fingerprint.clone()),
                )],
            );
        }

        match sink {
            SinkChoice::Store(store) => {
                if !uniqueness::is_unique_for_subject(
                    &statement,
                    &options.unique,
                    &subject_ref,
                    store,
                )
                .map_err(|source| RecordError::Store { source })?
                {
                    self.log_duplicate(&statement);
                    return Ok(RecordOutcome::Skipped(SkipReason::Duplicate));
                }
                self.insert(store, statement)
            }
            SinkChoice::Queue(queue) => self.enqueue(queue, statement),
        }
    }

    fn gate(&self, ctx: &RequestContext, options: &RecordOptions<'_>) -> Result<bool, RecordError> {
        let proceed = gate::should_proceed(&self.bots, ctx, options.only_if, options.unless)
            .map_err(|source| RecordError::Gate { source })?;
        if !proceed {
            self.log_event(
                "impression_skipped",
                &[
                    ("reason", Value::String("gated".to_string())),
                    ("context", Value::String(ctx.actor_context())),
                ],
            );
        }
        Ok(proceed)
    }

    fn insert(
        &self,
        store: &dyn DurableStore,
        statement: ImpressionStatement,
    ) -> Result<RecordOutcome, RecordError> {
        let recorded = store
            .insert(&statement)
            .map_err(|source| RecordError::Store { source })?;
        self.log_event(
            "impression_recorded",
            &[
                ("id", Value::from(recorded.id)),
                (
                    "requestFingerprint",
                    Value::String(recorded.statement.request_fingerprint.clone()),
                ),
            ],
        );
        Ok(RecordOutcome::Recorded(recorded))
    }

    fn enqueue(
        &self,
        queue: &dyn QueueSink,
        statement: ImpressionStatement,
    ) -> Result<RecordOutcome, RecordError> {
        queue
            .push(&statement)
            .map_err(|source| RecordError::Queue { source })?;
        self.log_event(
            "impression_queued",
            &[(
                "requestFingerprint",
                Value::String(statement.request_fingerprint.clone()),
            )],
        );
        Ok(RecordOutcome::Queued)
    }

    fn log_duplicate(&self, statement: &ImpressionStatement) {
        self.log_event(
            "impression_deduplicated",
            &[(
                "requestFingerprint",
                Value::String(statement.request_fingerprint.clone()),
            )],
        );
    }

    fn log_event(&self, event: &str, fields: &[(&str, Value)]) {
        let Some(path) = self.config.log_file.as_ref() else {
            return;
        };
        let _ = append_impression_event(path, event, fields);
    }
}
