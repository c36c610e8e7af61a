//! OS termination signals → the shared cancellation token.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listen for SIGINT/SIGTERM (ctrl-c elsewhere). The first signal cancels
/// `token`; later ones are logged and otherwise ignored.
///
/// Must be called from within a tokio runtime.
pub fn spawn_listener(token: CancellationToken) -> std::io::Result<JoinHandle<usize>> {
    let mut signals = Signals::register()?;
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            if tx.send(name).await.is_err() {
                break;
            }
        }
    });
    Ok(tokio::spawn(relay(token, rx)))
}

/// Cancel `token` on the first notification. Returns how many notifications
/// were seen once the source closes.
pub(crate) async fn relay(token: CancellationToken, mut rx: mpsc::Receiver<&'static str>) -> usize {
    let Some(first) = rx.recv().await else {
        return 0;
    };
    if token.is_cancelled() {
        tracing::info!(signal = first, "got signal, already stopping");
    } else {
        tracing::info!(signal = first, "got signal, draining");
        token.cancel();
    }

    let mut seen = 1;
    while let Some(name) = rx.recv().await {
        seen += 1;
        tracing::warn!(signal = name, "got signal, drain already in progress");
    }
    seen
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(e) => {
                tracing::error!(error = %e, "ctrl-c listener failed");
                std::future::pending().await
            }
        }
    }
}
