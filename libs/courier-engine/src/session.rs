use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use courier_api::CourierError;

use crate::error::EngineError;

/// Lifecycle of a consumption session. Transitions only move forward:
/// `Running → Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// New deliveries are accepted.
    Running,
    /// No new deliveries; in-flight handlers are finishing.
    Draining,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Running => f.write_str("running"),
            SessionState::Draining => f.write_str("draining"),
            SessionState::Stopped => f.write_str("stopped"),
        }
    }
}

/// A message that was acknowledged without being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonRecord {
    pub id: String,
    pub delivery_attempt: u32,
    pub error: CourierError,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub delivered: AtomicU64,
    pub committed: AtomicU64,
    pub duplicates: AtomicU64,
    pub withheld: AtomicU64,
    pub poisoned: AtomicU64,
    pub released: AtomicU64,
    pub ack_failures: AtomicU64,
}

impl Counters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runtime state of one `Coordinator::run`, owned by the coordinator and
/// shared read-only with observers.
pub struct ConsumptionSession {
    state: watch::Sender<SessionState>,
    in_flight: AtomicUsize,
    terminal: Mutex<Option<EngineError>>,
    pub(crate) counters: Counters,
    poison: Mutex<VecDeque<PoisonRecord>>,
    poison_capacity: usize,
}

/// Counters and poison log of a finished (or running) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub state: SessionState,
    pub delivered: u64,
    pub committed: u64,
    pub duplicates: u64,
    pub withheld: u64,
    pub poisoned: u64,
    pub released: u64,
    pub ack_failures: u64,
    pub poison: Vec<PoisonRecord>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConsumptionSession {
    pub fn new(poison_capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Running);
        Self {
            state,
            in_flight: AtomicUsize::new(0),
            terminal: Mutex::new(None),
            counters: Counters::default(),
            poison: Mutex::new(VecDeque::new()),
            poison_capacity,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// `Running → Draining`. Returns false if the session was not running.
    pub(crate) fn begin_drain(&self) -> bool {
        self.advance(SessionState::Draining)
    }

    /// Move to `Stopped`.
    pub(crate) fn stop(&self) -> bool {
        self.advance(SessionState::Stopped)
    }

    fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current < next {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Count a handler invocation as in flight until the guard drops.
    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { session: self }
    }

    /// Record the terminal error. The first one wins; later errors are only
    /// logged. Returns true if this call set it.
    pub(crate) fn fail(&self, error: EngineError) -> bool {
        let mut slot = lock(&self.terminal);
        if slot.is_some() {
            tracing::warn!(error = %error, "further fatal error suppressed, terminal error already set");
            return false;
        }
        tracing::error!(error = %error, "terminal error recorded");
        *slot = Some(error);
        true
    }

    pub fn terminal_error(&self) -> Option<EngineError> {
        lock(&self.terminal).clone()
    }

    pub(crate) fn record_poison(&self, record: PoisonRecord) {
        Counters::inc(&self.counters.poisoned);
        if self.poison_capacity == 0 {
            return;
        }
        let mut log = lock(&self.poison);
        if log.len() >= self.poison_capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    pub fn report(&self) -> SessionReport {
        let c = &self.counters;
        SessionReport {
            state: self.state(),
            delivered: c.delivered.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            withheld: c.withheld.load(Ordering::Relaxed),
            poisoned: c.poisoned.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            ack_failures: c.ack_failures.load(Ordering::Relaxed),
            poison: lock(&self.poison).iter().cloned().collect(),
        }
    }
}

pub(crate) struct InFlightGuard<'a> {
    session: &'a ConsumptionSession,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
