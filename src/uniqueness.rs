use crate::statement::{ImpressionStatement, SubjectRef};
use crate::store::{DurableStore, StoreError};
use serde::{Deserialize, Serialize};

/// A statement field that may participate in a uniqueness spec.
/// `Params` is a sentinel: parameter maps are not used as a
/// storage-level filter, they are compared in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueField {
    SubjectType,
    SubjectId,
    ActorContext,
    ActorId,
    RequestFingerprint,
    SessionFingerprint,
    SourceAddress,
    Referrer,
    Params,
}

impl UniqueField {
    pub fn column(self) -> &'static str {
        match self {
            UniqueField::SubjectType => "subject_type",
            UniqueField::SubjectId => "subject_id",
            UniqueField::ActorContext => "actor_context",
            UniqueField::ActorId => "actor_id",
            UniqueField::RequestFingerprint => "request_fingerprint",
            UniqueField::SessionFingerprint => "session_fingerprint",
            UniqueField::SourceAddress => "source_address",
            UniqueField::Referrer => "referrer",
            UniqueField::Params => "params",
        }
    }
}

/// Ordered set of fields defining "the same impression". Empty means
/// every statement is unique and is always recorded.
pub type UniquenessSpec = Vec<UniqueField>;

fn field_value(statement: &ImpressionStatement, field: UniqueField) -> Option<String> {
    match field {
        UniqueField::SubjectType => statement
            .subject
            .as_ref()
            .map(|subject| subject.subject_type.clone()),
        UniqueField::SubjectId => statement
            .subject
            .as_ref()
            .map(|subject| subject.subject_id.clone()),
        UniqueField::ActorContext => Some(statement.actor_context.clone()),
        UniqueField::ActorId => statement.actor_id.clone(),
        UniqueField::RequestFingerprint => Some(statement.request_fingerprint.clone()),
        UniqueField::SessionFingerprint => Some(statement.session_fingerprint.clone()),
        UniqueField::SourceAddress => Some(statement.source_address.clone()),
        UniqueField::Referrer => statement.referrer.clone(),
        UniqueField::Params => None,
    }
}

/// Projects the statement onto the spec's fields, excluding `Params`.
/// The result is the exact-match conjunction handed to the store.
pub fn field_filter(
    statement: &ImpressionStatement,
    spec: &[UniqueField],
) -> Vec<(&'static str, Option<String>)> {
    spec.iter()
        .filter(|field| **field != UniqueField::Params)
        .map(|field| (field.column(), field_value(statement, *field)))
        .collect()
}

/// Global uniqueness decision against the durable store.
///
/// Dedup is best-effort: two concurrent requests can both observe "no
/// match" here and both insert. There is no lock or unique index
/// guarding the check-then-insert window.
pub fn is_unique(
    statement: &ImpressionStatement,
    spec: &[UniqueField],
    store: &dyn DurableStore,
) -> Result<bool, StoreError> {
    if spec.is_empty() {
        return Ok(true);
    }

    let candidates = store.find_matching(&field_filter(statement, spec))?;
    if candidates.is_empty() {
        return Ok(true);
    }
    if !spec.contains(&UniqueField::Params) {
        return Ok(false);
    }

    // Params are compared in-process, bounded to the candidates that
    // already match every indexable field.
    Ok(candidates
        .iter()
        .all(|recorded| recorded.statement.params != statement.params))
}

/// Subject-scoped uniqueness: the lookup only sees the subject's own
/// recordings. This is the stricter path used by associative recording.
/// With the `Params` sentinel in the spec, exact map equality joins the
/// filter directly: the stored params column is canonical JSON (sorted
/// keys), so equal maps encode to equal strings, and the scan stays
/// bounded to one subject's rows.
pub fn is_unique_for_subject(
    statement: &ImpressionStatement,
    spec: &[UniqueField],
    subject: &SubjectRef,
    store: &dyn DurableStore,
) -> Result<bool, StoreError> {
    if spec.is_empty() {
        return Ok(true);
    }
    let mut filter = field_filter(statement, spec);
    if spec.contains(&UniqueField::Params) {
        let encoded = serde_json::to_string(&statement.params)
            .map_err(|source| StoreError::ParamsEncode { source })?;
        filter.push(("params", Some(encoded)));
    }
    let exists = store.exists_for_subject(subject, &filter)?;
    Ok(!exists)
}
