use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine;
use tokio_util::task::AbortOnDropHandle;

use courier_api::{
    Acker, BoxFuture, CourierError, Delivery, INVALID_ENCODING_ATTR, Message, Subscription,
};

use crate::client::{PubSubClient, ReceivedMessage};
use crate::lease::{self, Leases};

/// Receive stream over one Pub/Sub subscription.
///
/// Pulled batches are buffered and handed out one delivery per `recv`. The
/// feed never ends on its own.
///
/// Every pulled message holds a lease that a background task keeps renewing
/// while it waits in the buffer or sits with a handler. Acking or dropping the
/// delivery ends the lease; a dropped delivery is redelivered once its last
/// deadline expires. Renewal stops when the subscription is dropped, not on
/// `close`, so handlers still draining keep their messages.
pub struct PubSubSubscription {
    client: PubSubClient,
    buffer: VecDeque<ReceivedMessage>,
    leases: Arc<Leases>,
    renewer: Option<AbortOnDropHandle<()>>,
}

impl PubSubSubscription {
    pub(crate) fn new(client: PubSubClient) -> Self {
        Self {
            client,
            buffer: VecDeque::new(),
            leases: Arc::new(Leases::default()),
            renewer: None,
        }
    }

    fn hold_leases(&mut self, batch: &[ReceivedMessage]) {
        for received in batch {
            self.leases.hold(&received.ack_id);
        }
        if self.renewer.is_none() {
            let task = tokio::spawn(lease::renew(self.client.clone(), self.leases.clone()));
            self.renewer = Some(AbortOnDropHandle::new(task));
        }
    }

    fn delivery(&self, received: ReceivedMessage) -> Delivery {
        let ReceivedMessage {
            ack_id,
            message,
            delivery_attempt,
        } = received;

        let mut attributes = message.attributes;
        let payload = match base64::engine::general_purpose::STANDARD.decode(&message.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(id = %message.message_id, error = %e, "message data is not valid base64");
                attributes.insert(INVALID_ENCODING_ATTR.to_string(), "base64".to_string());
                message.data.into_bytes()
            }
        };

        let acker = PubSubAcker {
            client: self.client.clone(),
            leases: self.leases.clone(),
            ack_id,
        };
        Delivery::new(
            Message {
                id: message.message_id,
                payload,
                delivery_attempt,
                attributes,
                publish_time: message.publish_time,
            },
            Box::new(acker),
        )
    }
}

impl Subscription for PubSubSubscription {
    fn name(&self) -> &str {
        self.client.subscription_path()
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Delivery>, CourierError>> {
        Box::pin(async move {
            loop {
                if let Some(received) = self.buffer.pop_front() {
                    return Ok(Some(self.delivery(received)));
                }
                let batch = self.client.pull().await?;
                if batch.is_empty() {
                    tokio::time::sleep(self.client.empty_pull_pause()).await;
                    continue;
                }
                tracing::debug!(count = batch.len(), "pulled messages");
                self.hold_leases(&batch);
                self.buffer.extend(batch);
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), CourierError>> {
        Box::pin(async move {
            let ack_ids: Vec<String> = self.buffer.drain(..).map(|m| m.ack_id).collect();
            if ack_ids.is_empty() {
                return Ok(());
            }
            for ack_id in &ack_ids {
                self.leases.release(ack_id);
            }
            tracing::info!(count = ack_ids.len(), "returning buffered messages to the subscription");
            self.client.modify_ack_deadline(&ack_ids, 0).await
        })
    }
}

struct PubSubAcker {
    client: PubSubClient,
    leases: Arc<Leases>,
    ack_id: String,
}

impl Acker for PubSubAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), CourierError>> {
        // The lease is released when `self` drops, after the ack completed.
        Box::pin(async move {
            self.client
                .acknowledge(std::slice::from_ref(&self.ack_id))
                .await
        })
    }
}

impl Drop for PubSubAcker {
    fn drop(&mut self) {
        self.leases.release(&self.ack_id);
    }
}
