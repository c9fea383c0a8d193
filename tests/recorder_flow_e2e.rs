use imprint::config::{load_config, ImprintConfig, StorageMode};
use imprint::queue::{claim_oldest, FileQueueSink, QueuePaths};
use imprint::recorder::{ImpressionRecorder, RecordError, RecordOptions, RecordOutcome, SkipReason};
use imprint::request::{generate_request_fingerprint, RequestContext};
use imprint::statement::{Impressionable, SubjectRef};
use imprint::store::{DurableStore, SqliteStore};
use imprint::uniqueness::UniqueField;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

struct Article {
    id: i64,
}

impl Impressionable for Article {
    fn subject_ref(&self) -> SubjectRef {
        SubjectRef {
            subject_type: "Article".to_string(),
            subject_id: self.id.to_string(),
        }
    }
}

fn open_store(root: &Path) -> SqliteStore {
    let store = SqliteStore::open(&root.join("impressions.db")).expect("open store");
    store.ensure_schema().expect("ensure schema");
    store
}

fn ctx(session: &str, request_fingerprint: &str) -> RequestContext {
    RequestContext {
        controller: "articles".to_string(),
        action: "show".to_string(),
        resource_id: Some("42".to_string()),
        actor_id: None,
        user_agent: Some("Mozilla/5.0".to_string()),
        source_address: "203.0.113.9".to_string(),
        referrer: None,
        session_fingerprint: session.to_string(),
        request_fingerprint: request_fingerprint.to_string(),
        params: BTreeMap::new(),
    }
}

fn direct_recorder(root: &Path) -> ImpressionRecorder {
    ImpressionRecorder::new(
        ImprintConfig::default(),
        Box::new(open_store(root)),
        None,
    )
}

#[test]
fn default_spec_records_every_call_and_shares_the_request_fingerprint() {
    let dir = tempdir().expect("tempdir");
    let recorder = direct_recorder(dir.path());
    let store = open_store(dir.path());

    // one inbound request: the fingerprint is generated once and shared
    let fingerprint = generate_request_fingerprint().expect("fingerprint");
    let request = ctx("sess-1", &fingerprint);
    let options = RecordOptions::default();

    let first = recorder.record(&request, &options).expect("first call");
    let second = recorder.record(&request, &options).expect("second call");
    assert!(matches!(first, RecordOutcome::Recorded(_)));
    assert!(matches!(second, RecordOutcome::Recorded(_)));

    let rows = store
        .find_matching(&[("request_fingerprint", Some(fingerprint.clone()))])
        .expect("find");
    assert_eq!(rows.len(), 2, "no dedup unless the caller opts in");
    assert_ne!(rows[0].id, rows[1].id);
}

#[test]
fn session_unique_spec_keeps_one_row_per_session() {
    let dir = tempdir().expect("tempdir");
    let recorder = direct_recorder(dir.path());
    let store = open_store(dir.path());

    let options = RecordOptions {
        unique: vec![UniqueField::SessionFingerprint],
        ..RecordOptions::default()
    };

    let first = recorder
        .record(&ctx("sess-1", "req-1"), &options)
        .expect("first");
    let second = recorder
        .record(&ctx("sess-1", "req-2"), &options)
        .expect("second");
    assert!(matches!(first, RecordOutcome::Recorded(_)));
    assert!(matches!(
        second,
        RecordOutcome::Skipped(SkipReason::Duplicate)
    ));
    assert_eq!(store.count().expect("count"), 1);
}

#[test]
fn bot_traffic_never_records() {
    let dir = tempdir().expect("tempdir");
    let recorder = direct_recorder(dir.path());
    let store = open_store(dir.path());

    let mut request = ctx("sess-1", "req-1");
    request.user_agent = Some("Googlebot/2.1 (+http://www.google.com/bot.html)".to_string());

    let outcome = recorder
        .record(&request, &RecordOptions::default())
        .expect("record");
    assert!(matches!(outcome, RecordOutcome::Skipped(SkipReason::Gated)));
    assert_eq!(store.count().expect("count"), 0);
}

#[test]
fn actions_restriction_applies_to_the_direct_path() {
    let dir = tempdir().expect("tempdir");
    let recorder = direct_recorder(dir.path());
    let store = open_store(dir.path());

    let options = RecordOptions {
        actions: vec!["index".to_string()],
        ..RecordOptions::default()
    };
    let outcome = recorder
        .record(&ctx("sess-1", "req-1"), &options)
        .expect("record");
    assert!(matches!(
        outcome,
        RecordOutcome::Skipped(SkipReason::ActionNotTracked)
    ));

    // the associative path ignores the restriction
    let article = Article { id: 42 };
    let outcome = recorder
        .record_subject(&ctx("sess-1", "req-1"), &article, &options)
        .expect("record subject");
    assert!(matches!(outcome, RecordOutcome::Recorded(_)));
    assert_eq!(store.count().expect("count"), 1);
}

#[test]
fn guard_failure_propagates_as_a_gate_error() {
    let dir = tempdir().expect("tempdir");
    let recorder = direct_recorder(dir.path());

    let failing =
        |_: &RequestContext| -> Result<bool, String> { Err("predicate raised".to_string()) };
    let options = RecordOptions {
        only_if: Some(&failing),
        ..RecordOptions::default()
    };
    let err = recorder
        .record(&ctx("sess-1", "req-1"), &options)
        .expect_err("guard failure");
    assert!(matches!(err, RecordError::Gate { .. }));
}

#[test]
fn queue_mode_routes_direct_calls_to_the_sink() {
    let dir = tempdir().expect("tempdir");
    let sink = FileQueueSink::new(QueuePaths::from_state_root(dir.path()));
    sink.bootstrap().expect("bootstrap");
    let paths = sink.paths().clone();

    let config = ImprintConfig {
        storage: StorageMode::Queue,
        ..ImprintConfig::default()
    };
    let recorder =
        ImpressionRecorder::new(config, Box::new(open_store(dir.path())), Some(Box::new(sink)));
    let store = open_store(dir.path());

    let outcome = recorder
        .record(&ctx("sess-1", "req-1"), &RecordOptions::default())
        .expect("record");
    assert!(matches!(outcome, RecordOutcome::Queued));
    assert_eq!(store.count().expect("count"), 0);

    let claimed = claim_oldest(&paths).expect("claim").expect("entry");
    assert_eq!(claimed.payload.request_fingerprint, "req-1");
    assert_eq!(claimed.payload.subject_type.as_deref(), Some("Article"));
}

#[test]
fn dead_queue_fails_the_direct_path_without_fallback() {
    let dir = tempdir().expect("tempdir");
    // never bootstrapped: the probe stays dead
    let sink = FileQueueSink::new(QueuePaths::from_state_root(&dir.path().join("missing")));

    let config = ImprintConfig {
        storage: StorageMode::Queue,
        ..ImprintConfig::default()
    };
    let recorder =
        ImpressionRecorder::new(config, Box::new(open_store(dir.path())), Some(Box::new(sink)));

    let err = recorder
        .record(&ctx("sess-1", "req-1"), &RecordOptions::default())
        .expect_err("no fallback");
    assert!(matches!(err, RecordError::QueueUnavailable));
}

#[test]
fn dead_queue_falls_back_to_the_store_on_the_associative_path() {
    let dir = tempdir().expect("tempdir");
    let sink = FileQueueSink::new(QueuePaths::from_state_root(&dir.path().join("missing")));

    let config = ImprintConfig {
        storage: StorageMode::Queue,
        log_file: Some(dir.path().join("logs/impressions.log")),
        ..ImprintConfig::default()
    };
    let log_file = config.log_file.clone().expect("log path");
    let recorder =
        ImpressionRecorder::new(config, Box::new(open_store(dir.path())), Some(Box::new(sink)));
    let store = open_store(dir.path());

    let article = Article { id: 42 };
    let outcome = recorder
        .record_subject(&ctx("sess-1", "req-1"), &article, &RecordOptions::default())
        .expect("record subject");
    assert!(matches!(outcome, RecordOutcome::Recorded(_)), "not lost");
    assert_eq!(store.count().expect("count"), 1);

    let log = fs::read_to_string(&log_file).expect("read log");
    assert!(log.lines().any(|line| line.contains("queue_fallback")));
    assert!(log.lines().any(|line| line.contains("impression_recorded")));
}

#[test]
fn associative_dedup_is_scoped_to_the_subject() {
    let dir = tempdir().expect("tempdir");
    let recorder = direct_recorder(dir.path());
    let store = open_store(dir.path());

    let options = RecordOptions {
        unique: vec![UniqueField::SessionFingerprint],
        ..RecordOptions::default()
    };

    let first_article = Article { id: 42 };
    let other_article = Article { id: 99 };
    let request = ctx("sess-1", "req-1");

    let first = recorder
        .record_subject(&request, &first_article, &options)
        .expect("first");
    let duplicate = recorder
        .record_subject(&request, &first_article, &options)
        .expect("duplicate");
    let other = recorder
        .record_subject(&request, &other_article, &options)
        .expect("other subject");

    assert!(matches!(first, RecordOutcome::Recorded(_)));
    assert!(matches!(
        duplicate,
        RecordOutcome::Skipped(SkipReason::Duplicate)
    ));
    assert!(matches!(other, RecordOutcome::Recorded(_)));
    assert_eq!(store.count().expect("count"), 2);
}

#[test]
fn config_loads_from_yaml_and_drives_the_recorder() {
    let dir = tempdir().expect("tempdir");
    let config_path = dir.path().join("imprint.yaml");
    fs::write(
        &config_path,
        "storage: direct\nredacted_params:\n  - password\n  - token\nbot_signatures:\n  - internal-probe\n",
    )
    .expect("write config");

    let config = load_config(&config_path).expect("load config");
    assert_eq!(config.storage, StorageMode::Direct);

    let recorder = ImpressionRecorder::new(config, Box::new(open_store(dir.path())), None);
    let store = open_store(dir.path());

    // the configured extra signature gates recording
    let mut request = ctx("sess-1", "req-1");
    request.user_agent = Some("internal-probe/2.0".to_string());
    let outcome = recorder
        .record(&request, &RecordOptions::default())
        .expect("record");
    assert!(matches!(outcome, RecordOutcome::Skipped(SkipReason::Gated)));

    // redaction flows from config into the persisted statement
    let mut request = ctx("sess-1", "req-2");
    request
        .params
        .insert("token".to_string(), "abc".to_string());
    request.params.insert("tab".to_string(), "all".to_string());
    recorder
        .record(&request, &RecordOptions::default())
        .expect("record");

    let rows = store
        .find_matching(&[("request_fingerprint", Some("req-2".to_string()))])
        .expect("find");
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].statement.params.contains_key("token"));
    assert_eq!(rows[0].statement.params.get("tab"), Some(&"all".to_string()));
}
