use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use courier_api::{Acker, BoxFuture, CourierError, Delivery, Message, Subscription};

// ═══════════════════════════════════════════════════════════════
//  Shared broker state
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct State {
    queue: VecDeque<Message>,
    /// Handed out, neither acknowledged nor released yet.
    outstanding: usize,
    closed: bool,
    acked: Vec<String>,
    ack_counts: HashMap<String, usize>,
    delivery_counts: HashMap<String, usize>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    fail_acks: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// In-process broker with at-least-once semantics.
///
/// A delivery whose acker is dropped without `ack` goes back to the end of the
/// queue and is handed out again with `delivery_attempt + 1`. Once `close` is
/// called the feed ends as soon as the queue is empty and nothing is
/// outstanding.
#[derive(Clone)]
pub struct MemoryBroker {
    name: String,
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn publish(&self, id: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.publish_message(Message::new(id, payload));
    }

    pub fn publish_message(&self, message: Message) {
        {
            let mut state = self.shared.lock();
            state.queue.push_back(message);
        }
        self.shared.notify.notify_waiters();
    }

    /// No more publishes; the feed ends once every delivery is settled.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Make every subsequent `ack` fail with an `Io` error. A failed ack
    /// leaves the delivery unacknowledged, so it is redelivered.
    pub fn fail_acks(&self, fail: bool) {
        self.shared.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> MemorySubscription {
        MemorySubscription {
            name: self.name.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn ack_count(&self, id: &str) -> usize {
        self.shared.lock().ack_counts.get(id).copied().unwrap_or(0)
    }

    pub fn delivery_count(&self, id: &str) -> usize {
        self.shared.lock().delivery_counts.get(id).copied().unwrap_or(0)
    }

    /// Acknowledged ids in acknowledgment order.
    pub fn acked(&self) -> Vec<String> {
        self.shared.lock().acked.clone()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemorySubscription
// ═══════════════════════════════════════════════════════════════

pub struct MemorySubscription {
    name: String,
    shared: Arc<Shared>,
}

impl Subscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Delivery>, CourierError>> {
        Box::pin(async move {
            loop {
                // Register interest before inspecting the state so that a
                // notify between the check and the await is not lost.
                let mut notified = pin!(self.shared.notify.notified());
                notified.as_mut().enable();

                {
                    let mut state = self.shared.lock();
                    if let Some(mut message) = state.queue.pop_front() {
                        message.delivery_attempt += 1;
                        state.outstanding += 1;
                        *state.delivery_counts.entry(message.id.clone()).or_default() += 1;
                        let acker = MemoryAcker {
                            shared: self.shared.clone(),
                            message: Some(message.clone()),
                        };
                        return Ok(Some(Delivery::new(message, Box::new(acker))));
                    }
                    if state.closed && state.outstanding == 0 {
                        return Ok(None);
                    }
                }

                notified.await;
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryAcker
// ═══════════════════════════════════════════════════════════════

struct MemoryAcker {
    shared: Arc<Shared>,
    /// `Some` until the delivery is settled, either by ack or by drop.
    message: Option<Message>,
}

impl Acker for MemoryAcker {
    fn ack(mut self: Box<Self>) -> BoxFuture<'static, Result<(), CourierError>> {
        Box::pin(async move {
            if self.shared.fail_acks.load(Ordering::SeqCst) {
                // dropping `self` requeues the message
                return Err(CourierError::io("memory broker rejected ack"));
            }
            let Some(message) = self.message.take() else {
                return Ok(());
            };
            {
                let mut state = self.shared.lock();
                state.outstanding -= 1;
                *state.ack_counts.entry(message.id.clone()).or_default() += 1;
                state.acked.push(message.id);
            }
            self.shared.notify.notify_waiters();
            Ok(())
        })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let Some(message) = self.message.take() else {
            return;
        };
        tracing::debug!(id = %message.id, attempt = message.delivery_attempt, "delivery released, requeued");
        {
            let mut state = self.shared.lock();
            state.outstanding -= 1;
            state.queue.push_back(message);
        }
        self.shared.notify.notify_waiters();
    }
}
