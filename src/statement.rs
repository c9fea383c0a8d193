use crate::request::RequestContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routing keys never persisted as part of `params`.
pub const ROUTING_PARAM_KEYS: &[&str] = &["controller", "action", "id"];

/// Polymorphic subject identity. A statement either carries a full
/// `SubjectRef` or none at all (page-level tracking); partial identity
/// is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRef {
    pub subject_type: String,
    pub subject_id: String,
}

/// Marker capability for types impressions can be recorded against.
/// Passing a subject that lacks this trait is a compile error, not a
/// runtime probe.
pub trait Impressionable {
    fn subject_ref(&self) -> SubjectRef;
}

/// Canonical description of one candidate impression. A value, not an
/// entity: built fresh per call and only persisted once it clears the
/// gate and the uniqueness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpressionStatement {
    pub subject: Option<SubjectRef>,
    pub actor_context: String,
    pub actor_id: Option<String>,
    pub request_fingerprint: String,
    pub session_fingerprint: String,
    pub source_address: String,
    pub referrer: Option<String>,
    pub message: Option<String>,
    pub params: BTreeMap<String, String>,
}

/// Per-call field overrides. Reverse-merge semantics: a supplied value
/// always wins over the computed default; unset fields fall back to the
/// request context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementOverrides {
    pub actor_context: Option<String>,
    pub actor_id: Option<String>,
    pub request_fingerprint: Option<String>,
    pub session_fingerprint: Option<String>,
    pub source_address: Option<String>,
    pub referrer: Option<String>,
    pub message: Option<String>,
    pub params: Option<BTreeMap<String, String>>,
}

/// Strips routing keys, then drops every key matched by the denylist.
/// Denylist matching is case-insensitive substring, so `token` also
/// covers `auth_token`.
pub fn redact_params(
    params: &BTreeMap<String, String>,
    denylist: &[String],
) -> BTreeMap<String, String> {
    params
        .iter()
        .filter(|(key, _)| !ROUTING_PARAM_KEYS.contains(&key.as_str()))
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            !denylist
                .iter()
                .any(|entry| key.contains(&entry.to_ascii_lowercase()))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Singularized, camelized subject type inferred from a controller
/// name on the direct path: `articles` -> `Article`, `blog_posts` ->
/// `BlogPost`.
pub fn inferred_subject_type(controller: &str) -> String {
    let segments: Vec<&str> = controller
        .split('_')
        .filter(|segment| !segment.is_empty())
        .collect();
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        if index + 1 == segments.len() {
            out.push_str(&capitalize(&singularize(segment)));
        } else {
            out.push_str(&capitalize(segment));
        }
    }
    out
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if let Some(stem) = word.strip_suffix("ses") {
        return format!("{stem}s");
    }
    if word.ends_with("ss") {
        return word.to_string();
    }
    word.strip_suffix('s').unwrap_or(word).to_string()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Assembles statements from the ambient request context plus per-call
/// overrides. Pure transformation; no side effects.
pub struct StatementBuilder<'a> {
    redacted_params: &'a [String],
}

impl<'a> StatementBuilder<'a> {
    pub fn new(redacted_params: &'a [String]) -> Self {
        Self { redacted_params }
    }

    /// Associative shape: the caller supplies the subject explicitly.
    pub fn associative(
        &self,
        ctx: &RequestContext,
        subject: SubjectRef,
        overrides: &StatementOverrides,
    ) -> ImpressionStatement {
        self.base(ctx, Some(subject), overrides)
    }

    /// Direct shape: subject inferred from the route. Without a route
    /// identifier the statement is page-level and carries no subject.
    pub fn direct(&self, ctx: &RequestContext, overrides: &StatementOverrides) -> ImpressionStatement {
        let subject = ctx.resource_id.as_ref().map(|id| SubjectRef {
            subject_type: inferred_subject_type(&ctx.controller),
            subject_id: id.clone(),
        });
        self.base(ctx, subject, overrides)
    }

    fn base(
        &self,
        ctx: &RequestContext,
        subject: Option<SubjectRef>,
        overrides: &StatementOverrides,
    ) -> ImpressionStatement {
        let raw_params = overrides.params.as_ref().unwrap_or(&ctx.params);
        ImpressionStatement {
            subject,
            actor_context: overrides
                .actor_context
                .clone()
                .unwrap_or_else(|| ctx.actor_context()),
            actor_id: overrides.actor_id.clone().or_else(|| ctx.actor_id.clone()),
            request_fingerprint: overrides
                .request_fingerprint
                .clone()
                .unwrap_or_else(|| ctx.request_fingerprint.clone()),
            session_fingerprint: overrides
                .session_fingerprint
                .clone()
                .unwrap_or_else(|| ctx.session_fingerprint.clone()),
            source_address: overrides
                .source_address
                .clone()
                .unwrap_or_else(|| ctx.source_address.clone()),
            referrer: overrides.referrer.clone().or_else(|| ctx.referrer.clone()),
            message: overrides.message.clone(),
            params: redact_params(raw_params, self.redacted_params),
        }
    }
}
