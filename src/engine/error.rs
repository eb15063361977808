use ulid::Ulid;

use crate::model::ConflictRef;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input. Correct the request; retrying verbatim fails identically.
    Validation(&'static str),
    /// The proposed span overlaps existing blocks. Carries every conflicting block.
    Conflict(Vec<ConflictRef>),
    NotFound(Ulid),
    /// Target block belongs to a booking; only releasing the booking removes it.
    BookingOwned(Ulid),
    LimitExceeded(&'static str),
    /// Durable-log failure. The only retryable variant.
    WalError(String),
}

impl EngineError {
    /// Domain errors are final; infrastructure errors may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(refs) => {
                write!(f, "conflict with {} existing block(s):", refs.len())?;
                for c in refs {
                    write!(f, " {} [{}, {})", c.id, c.span.start, c.span.end)?;
                }
                Ok(())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::BookingOwned(id) => {
                write!(f, "block {id} is owned by its booking; release the booking instead")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
