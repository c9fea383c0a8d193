use crate::bots::BotFilter;
use crate::request::RequestContext;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("guard predicate failed: {0}")]
    Guard(String),
}

/// Caller-supplied guard predicate bound to the invocation context.
/// Evaluation failures propagate; predicate correctness is the caller's
/// responsibility.
pub type Guard<'a> = &'a dyn Fn(&RequestContext) -> Result<bool, String>;

/// `NOT bot AND if-condition AND NOT unless-condition`. Absent
/// conditions are non-blocking.
pub fn should_proceed(
    bots: &BotFilter,
    ctx: &RequestContext,
    only_if: Option<Guard<'_>>,
    unless: Option<Guard<'_>>,
) -> Result<bool, GateError> {
    if bots.is_bot(ctx.user_agent.as_deref()) {
        return Ok(false);
    }
    if let Some(guard) = only_if {
        if !guard(ctx).map_err(GateError::Guard)? {
            return Ok(false);
        }
    }
    if let Some(guard) = unless {
        if guard(ctx).map_err(GateError::Guard)? {
            return Ok(false);
        }
    }
    Ok(true)
}
