use crate::BoxFuture;
use crate::error::CourierError;

/// Result of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This call created the record.
    Inserted,
    /// A record with the same id was already committed.
    AlreadyPresent,
}

impl std::fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOutcome::Inserted => f.write_str("inserted"),
            WriteOutcome::AlreadyPresent => f.write_str("already_present"),
        }
    }
}

/// Durable record of processed message ids.
///
/// At most one record per id ever exists: when two callers race with the same
/// id, exactly one observes `Inserted` and the other `AlreadyPresent`. The
/// uniqueness is the store's job, callers never deduplicate.
///
/// Shared by all concurrent handlers, so implementations must be safe for
/// concurrent use.
pub trait ProcessedStore: Send + Sync {
    /// Liveness probe. Used at startup to fail fast.
    fn ping(&self) -> BoxFuture<'_, Result<(), CourierError>>;

    /// Prepare the schema. Called once after a successful `ping`.
    fn init(&self) -> BoxFuture<'_, Result<(), CourierError>> {
        Box::pin(async { Ok(()) })
    }

    /// Record `id` as processed unless it already is.
    ///
    /// Connectivity loss surfaces as `ErrorKind::Io`; constraint violations
    /// other than the uniqueness conflict as `ErrorKind::Constraint`.
    fn record_if_absent<'a>(
        &'a self,
        id: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<WriteOutcome, CourierError>>;
}
