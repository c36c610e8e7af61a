use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::BoxFuture;
use crate::error::CourierError;
use crate::message::Message;
use crate::store::{ProcessedStore, WriteOutcome};

/// What a handler invocation achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The store write is durable. Anything that fails after the write still
    /// reports `Committed`.
    Committed(WriteOutcome),
    /// Nothing durable happened and a later redelivery may succeed.
    RetryableFailure(CourierError),
    /// The message can never succeed, or the infrastructure is broken.
    /// `CourierError::class` tells which.
    FatalFailure(CourierError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Committed(_) => "committed",
            Outcome::RetryableFailure(_) => "retryable_failure",
            Outcome::FatalFailure(_) => "fatal_failure",
        }
    }
}

/// Everything a handler may touch besides the message.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn ProcessedStore>,
    /// Shared cancellation context. Handlers may check it at their own I/O
    /// boundaries but are allowed to finish a write already started.
    pub token: CancellationToken,
}

impl HandlerContext {
    pub fn new(store: Arc<dyn ProcessedStore>, token: CancellationToken) -> Self {
        Self { store, token }
    }
}

/// Turns one message into a durable side effect.
///
/// Invoked concurrently for different messages, and possibly more than once
/// for the same id (broker redelivery). Idempotence comes from
/// `ProcessedStore::record_if_absent`, not from handler-side bookkeeping.
/// The message must not be retained beyond the call.
pub trait Handler: Send + Sync {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Outcome>;
}
