use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Shape checks for a block span. Order matters: an inverted span is a
/// caller mistake (`Validation`), not a limit problem.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Validation("span start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Shape checks for a query window: same as a block span, plus the
/// scan-width cap.
pub(crate) fn validate_window(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Validation("range start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    use crate::limits::*;
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// `booking_ref` rides exactly with `reason == Booking`.
pub(crate) fn validate_reason_ref(
    reason: BlockReason,
    booking_ref: &Option<Ulid>,
) -> Result<(), EngineError> {
    match (reason, booking_ref) {
        (BlockReason::Booking, Some(_)) => Ok(()),
        (BlockReason::Booking, None) => {
            Err(EngineError::Validation("booking blocks require a booking_ref"))
        }
        (_, Some(_)) => Err(EngineError::Validation(
            "booking_ref is only valid on booking blocks",
        )),
        (_, None) => Ok(()),
    }
}

/// Every block conflicting with `span`, in start order. `exclude` lets an
/// update check against all *other* blocks on the calendar.
pub(crate) fn find_conflicts(cal: &Calendar, span: &Span, exclude: Option<Ulid>) -> Vec<ConflictRef> {
    cal.overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .map(|b| ConflictRef { id: b.id, span: b.span })
        .collect()
}

pub(crate) fn check_no_conflict(
    cal: &Calendar,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(cal, span, exclude);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(conflicts))
    }
}

/// The boolean form: true iff nothing on the calendar touches `span`.
pub(crate) fn is_free(cal: &Calendar, span: &Span) -> bool {
    cal.overlapping(span).next().is_none()
}
