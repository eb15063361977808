use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Boundary between the external booking subsystem and the calendar.
///
/// The pairing invariant lives here: a confirmed booking has exactly its
/// calendar block, and a calendar never shows a booking block without a
/// live booking. Confirmation either installs the block or fails with no
/// block; cancellation releases whatever the booking owns and is safe to
/// repeat.
#[derive(Debug)]
pub enum BridgeError {
    /// Domain rejection carried through unchanged; the confirmation must
    /// not proceed and retrying the same input fails identically.
    Rejected(EngineError),
    /// Infrastructure failure, retryable with backoff. Storage detail
    /// stops here instead of leaking to the booking flow.
    Storage(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Rejected(e) => write!(f, "booking rejected: {e}"),
            BridgeError::Storage(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {}

fn translate(e: EngineError) -> BridgeError {
    if e.is_retryable() {
        BridgeError::Storage(e.to_string())
    } else {
        BridgeError::Rejected(e)
    }
}

impl Engine {
    /// Booking confirmed upstream: install its block. Any error means
    /// the confirmation must be rolled back — on return there is either
    /// a block or no trace of the attempt.
    pub async fn on_booking_confirmed(
        &self,
        booking_id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Block, BridgeError> {
        match self.block_for_booking(resource_id, booking_id, span).await {
            Ok(block) => Ok(block),
            Err(e) => {
                tracing::info!(booking = %booking_id, resource = %resource_id, error = %e,
                    "booking confirmation rejected");
                Err(translate(e))
            }
        }
    }

    /// Booking cancelled upstream: release its blocks. Unknown bookings
    /// release zero blocks and succeed.
    pub async fn on_booking_cancelled(&self, booking_id: Ulid) -> Result<usize, BridgeError> {
        self.release_for_booking(booking_id).await.map_err(translate)
    }
}
