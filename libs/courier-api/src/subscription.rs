use crate::BoxFuture;
use crate::error::CourierError;
use crate::message::Delivery;

/// Pull-based message feed.
///
/// The consumer drives a single receive loop over it. Acknowledgment goes
/// through the `Acker` carried by each `Delivery`; there is no explicit nack,
/// a delivery that is never acknowledged is redelivered by the broker.
pub trait Subscription: Send {
    /// Human readable name for logs (e.g. `projects/p/subscriptions/s`).
    fn name(&self) -> &str;

    /// Wait for the next delivery. `Ok(None)` means the feed is exhausted.
    ///
    /// Must be cancellation-safe: dropping the future never loses a delivery
    /// that the implementation already holds.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Delivery>, CourierError>>;

    /// Release deliveries fetched from the broker but never handed out by
    /// `recv`. Called once after the receive loop stops.
    fn close(&mut self) -> BoxFuture<'_, Result<(), CourierError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Startup probe exposed by broker adapters that can check their access
/// rights before the receive loop starts.
pub trait SubscriptionProbe: Send + Sync {
    /// Returns the permissions the caller actually holds, out of the requested ones.
    fn test_permissions<'a>(
        &'a self,
        permissions: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<String>, CourierError>>;
}
