use crate::model::*;

use super::EngineError;

/// Parse a pair of wire timestamps into a validated span.
pub fn parse_span(start: &str, end: &str) -> Result<Span, EngineError> {
    let s = parse_timestamp(start).ok_or_else(|| {
        EngineError::Invalid(format!("bad start_time {start:?}: expected YYYY-MM-DDTHH:MM:SS"))
    })?;
    let e = parse_timestamp(end).ok_or_else(|| {
        EngineError::Invalid(format!("bad end_time {end:?}: expected YYYY-MM-DDTHH:MM:SS"))
    })?;
    if e <= s {
        return Err(EngineError::Invalid(format!(
            "end_time {end} must be after start_time {start}"
        )));
    }
    let span = Span::new(s, e);
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Invalid("meeting must end after it starts".into()));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid("name must not be empty".into()));
    }
    if name.len() > crate::limits::MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// Fail if `span` overlaps any confirmed meeting of this user.
/// Tentative meetings never block a proposal.
pub(crate) fn check_no_conflict(user: &UserState, span: &Span) -> Result<(), EngineError> {
    match user.overlapping(span).find(|slot| slot.scheduled) {
        Some(slot) => Err(EngineError::Conflict {
            user_id: user.id,
            meeting_id: slot.meeting_id,
        }),
        None => Ok(()),
    }
}

/// Run [`check_no_conflict`] for every participant; the first obstacle wins.
pub(crate) fn check_participants<'a>(
    users: impl IntoIterator<Item = &'a UserState>,
    span: &Span,
) -> Result<(), EngineError> {
    for user in users {
        check_no_conflict(user, span)?;
    }
    Ok(())
}
