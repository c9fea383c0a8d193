use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Appends one JSON event line to the impression log. Callers treat
/// this as best-effort; a failed append never fails the record call.
pub fn append_impression_event(
    path: &Path,
    event: &str,
    fields: &[(&str, Value)],
) -> Result<(), std::io::Error> {
    let mut payload = Map::new();
    payload.insert(
        "timestamp".to_string(),
        Value::from(chrono::Utc::now().timestamp()),
    );
    payload.insert("event".to_string(), Value::String(event.to_string()));
    for (key, value) in fields {
        payload.insert((*key).to_string(), value.clone());
    }

    let line = serde_json::to_string(&payload)
        .map_err(|source| std::io::Error::other(source.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}
