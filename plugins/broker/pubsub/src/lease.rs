use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::client::PubSubClient;

/// Upper bound on ack ids in one `modifyAckDeadline` request.
const MAX_IDS_PER_REQUEST: usize = 2500;

/// Ack ids pulled by this consumer and not yet acked or given up.
#[derive(Default)]
pub(crate) struct Leases {
    ids: Mutex<HashSet<String>>,
}

impl Leases {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn hold(&self, ack_id: &str) {
        self.lock().insert(ack_id.to_string());
    }

    pub(crate) fn release(&self, ack_id: &str) {
        self.lock().remove(ack_id);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }
}

/// Keep every held lease alive, renewing it every `interval`, until the task
/// is aborted. A failed renewal is logged and retried on the next tick; the
/// broker redelivers whatever expires in between.
pub(crate) async fn renew(client: PubSubClient, leases: Arc<Leases>) {
    let deadline_secs = client.ack_deadline_secs();
    let mut ticker = tokio::time::interval(client.lease_renew_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let ack_ids = leases.snapshot();
        for chunk in ack_ids.chunks(MAX_IDS_PER_REQUEST) {
            match client.modify_ack_deadline(chunk, deadline_secs).await {
                Ok(()) => tracing::debug!(count = chunk.len(), deadline_secs, "leases extended"),
                Err(e) => tracing::warn!(count = chunk.len(), error = %e, "lease extension failed"),
            }
        }
    }
}
