use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use courier_api::{
    Acker, CourierError, Delivery, Handler, HandlerContext, Message, Outcome, ProcessedStore,
    Subscription, WriteOutcome,
};

use crate::config::CoordinatorConfig;
use crate::error::EngineError;
use crate::session::{ConsumptionSession, Counters, PoisonRecord, SessionReport};

// ═══════════════════════════════════════════════════════════════
//  Coordinator
// ═══════════════════════════════════════════════════════════════

/// Drives one subscription: a pull loop feeds a bounded channel, a fixed pool
/// of workers dispatches each delivery to the handler and settles it.
///
/// A delivery is acknowledged only after the handler reported `Committed`
/// (its store write is durable), or when it is a poison message.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn ProcessedStore>,
    handler: Arc<dyn Handler>,
    session: Arc<ConsumptionSession>,
    started: AtomicBool,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn ProcessedStore>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let session = Arc::new(ConsumptionSession::new(config.poison_log_capacity));
        Ok(Self {
            config,
            store,
            handler,
            session,
            started: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> Arc<ConsumptionSession> {
        self.session.clone()
    }

    /// Consume until the feed is exhausted, `token` is cancelled or a fatal
    /// infrastructure error occurs, then drain in-flight handlers.
    ///
    /// Returns the session report after a graceful drain, or the first fatal
    /// error observed.
    pub async fn run(
        &self,
        token: CancellationToken,
        mut subscription: Box<dyn Subscription>,
    ) -> Result<SessionReport, EngineError> {
        // One session per coordinator, claimed before anything is spawned.
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRan);
        }

        // Child token: an infrastructure failure stops this session without
        // cancelling the caller's token.
        let session_token = token.child_token();

        let dispatcher = Arc::new(Dispatcher {
            handler: self.handler.clone(),
            ctx: HandlerContext::new(self.store.clone(), session_token.clone()),
            session: self.session.clone(),
            token: session_token.clone(),
            max_delivery_attempts: self.config.max_delivery_attempts,
        });

        let (tx, rx) = mpsc::channel::<Delivery>(self.config.queue_depth());
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            workers.spawn(worker_loop(worker, dispatcher.clone(), rx.clone()));
        }

        tracing::info!(
            subscription = %subscription.name(),
            workers = self.config.workers,
            queue_depth = self.config.queue_depth(),
            "started listening to subscription"
        );

        self.pull_loop(subscription.as_mut(), &tx, &session_token).await;

        self.session.begin_drain();
        tracing::info!(in_flight = self.session.in_flight(), "draining");

        if let Err(e) = subscription.close().await {
            tracing::warn!(error = %e, "subscription close failed");
        }
        // Feed exhausted: workers empty the channel, then see it closed.
        // Cancelled: workers stop taking new deliveries right away.
        drop(tx);

        self.drain(&mut workers, &session_token).await;

        // Whatever is still queued was never dispatched.
        let mut rx = rx.lock().await;
        while let Ok(delivery) = rx.try_recv() {
            release(&self.session, delivery, "queued at shutdown");
        }
        drop(rx);

        self.session.stop();
        let report = self.session.report();
        tracing::info!(
            delivered = report.delivered,
            committed = report.committed,
            duplicates = report.duplicates,
            withheld = report.withheld,
            poisoned = report.poisoned,
            released = report.released,
            ack_failures = report.ack_failures,
            "done listening to subscription"
        );

        match self.session.terminal_error() {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn pull_loop(
        &self,
        subscription: &mut dyn Subscription,
        tx: &mpsc::Sender<Delivery>,
        token: &CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = subscription.recv() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tracing::info!(subscription = %subscription.name(), "subscription exhausted");
                    break;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "pull failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.pull_backoff()) => continue,
                    }
                }
                Err(e) => {
                    self.session.fail(EngineError::Subscription(e));
                    token.cancel();
                    break;
                }
            };

            Counters::inc(&self.session.counters.delivered);
            tracing::debug!(
                id = %delivery.message.id,
                attempt = delivery.message.delivery_attempt,
                "delivery received"
            );

            // Wait for pool capacity without holding the delivery hostage.
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = tx.reserve() => permit.ok(),
            };
            match permit {
                Some(permit) => permit.send(delivery),
                None => {
                    release(&self.session, delivery, "pool closed");
                    break;
                }
            }
        }
    }

    async fn drain(&self, workers: &mut JoinSet<()>, token: &CancellationToken) {
        let join_all = async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        let msg = panic_message(e.into_panic());
                        self.session.fail(EngineError::WorkerPanicked(msg));
                        token.cancel();
                    }
                }
            }
        };

        let Some(limit) = self.config.drain_timeout() else {
            join_all.await;
            return;
        };

        if tokio::time::timeout(limit, join_all).await.is_err() {
            let in_flight = self.session.in_flight();
            tracing::error!(in_flight, timeout_ms = limit.as_millis() as u64, "drain timed out, aborting handlers");
            self.session.fail(EngineError::DrainTimeout { in_flight });
            token.cancel();
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Worker pool
// ═══════════════════════════════════════════════════════════════

async fn worker_loop(
    worker: usize,
    dispatcher: Arc<Dispatcher>,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = dispatcher.token.cancelled() => None,
                delivery = rx.recv() => delivery,
            }
        };
        let Some(delivery) = next else {
            break;
        };
        dispatcher.dispatch(delivery).await;
    }
    tracing::debug!(worker, "worker stopped");
}

struct Dispatcher {
    handler: Arc<dyn Handler>,
    ctx: HandlerContext,
    session: Arc<ConsumptionSession>,
    token: CancellationToken,
    max_delivery_attempts: Option<u32>,
}

impl Dispatcher {
    async fn dispatch(&self, delivery: Delivery) {
        let _in_flight = self.session.enter();
        let (message, acker) = delivery.into_parts();
        let id = message.id.clone();
        let attempt = message.delivery_attempt;

        let outcome = self.invoke(message).await;
        tracing::debug!(id = %id, attempt, outcome = outcome.label(), "handler finished");

        match outcome {
            Outcome::Committed(write) => {
                match write {
                    WriteOutcome::Inserted => Counters::inc(&self.session.counters.committed),
                    WriteOutcome::AlreadyPresent => Counters::inc(&self.session.counters.duplicates),
                }
                tracing::info!(id = %id, attempt, outcome = %write, "message committed");
                self.acknowledge(&id, acker).await;
            }
            Outcome::RetryableFailure(err) => {
                if self.attempts_exhausted(attempt) {
                    let err = err.with_context(format!("gave up after {attempt} attempts"));
                    self.poison(id, attempt, err, acker).await;
                } else {
                    Counters::inc(&self.session.counters.withheld);
                    tracing::warn!(id = %id, attempt, error = %err, "retryable failure, acknowledgment withheld");
                    drop(acker);
                }
            }
            Outcome::FatalFailure(err) if err.is_infrastructure() => {
                Counters::inc(&self.session.counters.withheld);
                tracing::error!(id = %id, attempt, error = %err, "infrastructure failure, stopping consumption");
                drop(acker);
                self.session
                    .fail(EngineError::infrastructure(format!("handling message {id}"), err));
                self.token.cancel();
            }
            Outcome::FatalFailure(err) => self.poison(id, attempt, err, acker).await,
        }
    }

    /// Run the handler as its own task so a panic stays contained. The task
    /// is aborted if the worker itself is aborted.
    async fn invoke(&self, message: Message) -> Outcome {
        let handler = self.handler.clone();
        let ctx = self.ctx.clone();
        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            handler.handle(&message, &ctx).await
        }));

        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Outcome::FatalFailure(CourierError::logic(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Outcome::RetryableFailure(CourierError::io(format!("handler task: {e}"))),
        }
    }

    fn attempts_exhausted(&self, attempt: u32) -> bool {
        match self.max_delivery_attempts {
            Some(max) => attempt > 0 && attempt >= max,
            None => false,
        }
    }

    async fn poison(&self, id: String, attempt: u32, err: CourierError, acker: Box<dyn Acker>) {
        tracing::error!(
            id = %id,
            attempt,
            error = %err,
            class = %err.class(),
            "poison message, acknowledging without processing"
        );
        self.acknowledge(&id, acker).await;
        self.session.record_poison(PoisonRecord {
            id,
            delivery_attempt: attempt,
            error: err,
        });
    }

    async fn acknowledge(&self, id: &str, acker: Box<dyn Acker>) {
        if let Err(e) = acker.ack().await {
            Counters::inc(&self.session.counters.ack_failures);
            tracing::warn!(id = %id, error = %e, "ack failed, broker will redeliver");
        }
    }
}

fn release(session: &ConsumptionSession, delivery: Delivery, reason: &str) {
    Counters::inc(&session.counters.released);
    tracing::debug!(id = %delivery.message.id, reason, "delivery released without acknowledgment");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
