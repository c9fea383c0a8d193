use crate::statement::{ImpressionStatement, SubjectRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid queue payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("queue sink is not live at {path}")]
    NotLive { path: String },
}

/// Wire form of a statement: same shape as the persisted layout, with
/// the subject reference flattened into nullable fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedImpression {
    #[serde(default)]
    pub subject_type: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    pub actor_context: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub request_fingerprint: String,
    pub session_fingerprint: String,
    pub source_address: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub enqueued_at: i64,
}

impl QueuedImpression {
    pub fn from_statement(statement: &ImpressionStatement, enqueued_at: i64) -> Self {
        Self {
            subject_type: statement
                .subject
                .as_ref()
                .map(|subject| subject.subject_type.clone()),
            subject_id: statement
                .subject
                .as_ref()
                .map(|subject| subject.subject_id.clone()),
            actor_context: statement.actor_context.clone(),
            actor_id: statement.actor_id.clone(),
            request_fingerprint: statement.request_fingerprint.clone(),
            session_fingerprint: statement.session_fingerprint.clone(),
            source_address: statement.source_address.clone(),
            referrer: statement.referrer.clone(),
            message: statement.message.clone(),
            params: statement.params.clone(),
            enqueued_at,
        }
    }

    /// Rebuilds the statement for a drain consumer that persists into
    /// the durable store. A partially-present subject reference
    /// collapses to no subject.
    pub fn into_statement(self) -> ImpressionStatement {
        let subject = match (self.subject_type, self.subject_id) {
            (Some(subject_type), Some(subject_id)) => Some(SubjectRef {
                subject_type,
                subject_id,
            }),
            _ => None,
        };
        ImpressionStatement {
            subject,
            actor_context: self.actor_context,
            actor_id: self.actor_id,
            request_fingerprint: self.request_fingerprint,
            session_fingerprint: self.session_fingerprint,
            source_address: self.source_address,
            referrer: self.referrer,
            message: self.message,
            params: self.params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    pub incoming: PathBuf,
    pub processing: PathBuf,
}

impl QueuePaths {
    pub fn from_state_root(state_root: &Path) -> Self {
        Self {
            incoming: state_root.join("queue/incoming"),
            processing: state_root.join("queue/processing"),
        }
    }
}

/// Fire-and-forget buffering sink. The liveness probe is re-checked on
/// every push, never cached. Uniqueness is never evaluated against
/// queued-but-undrained entries.
pub trait QueueSink {
    fn is_live(&self) -> bool;
    fn push(&self, statement: &ImpressionStatement) -> Result<(), QueueError>;
}

pub struct FileQueueSink {
    paths: QueuePaths,
}

static PUSH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileQueueSink {
    pub fn new(paths: QueuePaths) -> Self {
        Self { paths }
    }

    pub fn bootstrap(&self) -> Result<(), QueueError> {
        for dir in [&self.paths.incoming, &self.paths.processing] {
            fs::create_dir_all(dir).map_err(|source| io_err(dir, source))?;
        }
        Ok(())
    }

    pub fn paths(&self) -> &QueuePaths {
        &self.paths
    }
}

impl QueueSink for FileQueueSink {
    fn is_live(&self) -> bool {
        fs::metadata(&self.paths.incoming)
            .map(|metadata| metadata.is_dir() && !metadata.permissions().readonly())
            .unwrap_or(false)
    }

    fn push(&self, statement: &ImpressionStatement) -> Result<(), QueueError> {
        if !self.is_live() {
            return Err(QueueError::NotLive {
                path: self.paths.incoming.display().to_string(),
            });
        }

        let enqueued_at = chrono::Utc::now().timestamp();
        let payload = QueuedImpression::from_statement(statement, enqueued_at);
        let path = self
            .paths
            .incoming
            .join(queued_filename(&payload.request_fingerprint, enqueued_at));
        let body =
            serde_json::to_string_pretty(&payload).map_err(|source| parse_err(&path, source))?;
        fs::write(&path, body).map_err(|source| io_err(&path, source))
    }
}

fn queued_filename(request_fingerprint: &str, enqueued_at: i64) -> String {
    let prefix: String = request_fingerprint.chars().take(16).collect();
    let counter = PUSH_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    format!(
        "{}_{enqueued_at}_{counter}.json",
        sanitize_filename_component(&prefix)
    )
}

fn sanitize_filename_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "impression".to_string()
    } else {
        sanitized
    }
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parse_err(path: &Path, source: serde_json::Error) -> QueueError {
    QueueError::Parse {
        path: path.display().to_string(),
        source,
    }
}

/// An entry claimed out of `incoming/` by rename; the file sits in
/// `processing/` until the consumer completes or requeues it.
#[derive(Debug, Clone)]
pub struct ClaimedImpression {
    pub processing_path: PathBuf,
    pub payload: QueuedImpression,
}

fn sorted_incoming_paths(incoming_dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(incoming_dir).map_err(|source| io_err(incoming_dir, source))? {
        let entry = entry.map_err(|source| io_err(incoming_dir, source))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        let metadata = entry.metadata().map_err(|source| io_err(&path, source))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });

    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

/// Claims the oldest queued impression for draining. FIFO by file
/// mtime, name as tiebreak; claim is a rename into `processing/`, so
/// concurrent consumers cannot claim the same entry twice.
pub fn claim_oldest(paths: &QueuePaths) -> Result<Option<ClaimedImpression>, QueueError> {
    for incoming_path in sorted_incoming_paths(&paths.incoming)? {
        let Some(file_name) = incoming_path.file_name() else {
            continue;
        };
        let processing_path = paths.processing.join(file_name);

        match fs::rename(&incoming_path, &processing_path) {
            Ok(_) => {
                let raw = fs::read_to_string(&processing_path)
                    .map_err(|source| io_err(&processing_path, source))?;
                let payload: QueuedImpression = serde_json::from_str(&raw)
                    .map_err(|source| parse_err(&processing_path, source))?;
                return Ok(Some(ClaimedImpression {
                    processing_path,
                    payload,
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&incoming_path, err)),
        }
    }

    Ok(None)
}

/// Removes a drained entry once the consumer has persisted it.
pub fn complete(claimed: &ClaimedImpression) -> Result<(), QueueError> {
    fs::remove_file(&claimed.processing_path)
        .map_err(|source| io_err(&claimed.processing_path, source))
}

static REQUEUE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Moves a failed entry back into `incoming/` under a fresh name so a
/// later drain pass retries it.
pub fn requeue_failure(
    paths: &QueuePaths,
    claimed: &ClaimedImpression,
) -> Result<PathBuf, QueueError> {
    let stem = claimed
        .processing_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.trim().is_empty())
        .unwrap_or("impression");
    let counter = REQUEUE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let incoming = paths.incoming.join(format!("{stem}_requeue_{counter}.json"));
    fs::rename(&claimed.processing_path, &incoming)
        .map_err(|source| io_err(&claimed.processing_path, source))?;
    Ok(incoming)
}
