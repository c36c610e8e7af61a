//! Startup probes. Any failure here is fatal: the process must not enter the
//! receive loop.

use courier_api::{CourierError, ProcessedStore, SubscriptionProbe};

use crate::error::EngineError;

/// Ping the store, then let it prepare its schema.
pub async fn check_store(store: &dyn ProcessedStore) -> Result<(), EngineError> {
    store
        .ping()
        .await
        .map_err(|e| EngineError::infrastructure("store ping", e))?;
    tracing::info!("successfully connected to store");

    store
        .init()
        .await
        .map_err(|e| EngineError::infrastructure("store init", e))?;
    Ok(())
}

/// Verify the subscription grants every permission in `required`.
pub async fn check_subscription(
    probe: &dyn SubscriptionProbe,
    required: &[&str],
) -> Result<(), EngineError> {
    let granted = probe
        .test_permissions(required)
        .await
        .map_err(|e| EngineError::infrastructure("subscription permissions", e))?;

    for permission in &granted {
        tracing::info!(permission = %permission, "allowed");
    }

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|r| !granted.iter().any(|g| g == r))
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::infrastructure(
            "subscription permissions",
            CourierError::auth(format!("missing permissions: {}", missing.join(", "))),
        ));
    }
    Ok(())
}
