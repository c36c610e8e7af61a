use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use courier_engine::{ConsumptionSession, SessionState};

use crate::error::WorkerError;

#[derive(Clone)]
struct AppState {
    name: Arc<str>,
    session: Arc<ConsumptionSession>,
}

pub async fn bind(port: u16) -> Result<TcpListener, WorkerError> {
    TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| WorkerError::Http(format!("bind :{port}: {e}")))
}

fn router(name: &str, session: Arc<ConsumptionSession>) -> Router {
    Router::new()
        .route("/", get(handle_hello))
        .route("/healthz", get(handle_health))
        .with_state(AppState {
            name: Arc::from(name),
            session,
        })
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    name: String,
    session: Arc<ConsumptionSession>,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    axum::serve(listener, router(&name, session))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| WorkerError::Http(format!("axum serve: {e}")))
}

async fn handle_hello(State(state): State<AppState>) -> String {
    format!("Hello {}!\n", state.name)
}

// --- GET /healthz: 200 while consuming, 503 once draining ---

async fn handle_health(State(state): State<AppState>) -> (StatusCode, String) {
    match state.session.state() {
        SessionState::Running => (StatusCode::OK, "ok".into()),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::{Semaphore, mpsc};

    use courier_api::{BoxFuture, Handler, HandlerContext, Message, Outcome, WriteOutcome};
    use courier_broker_memory::MemoryBroker;
    use courier_engine::{Coordinator, CoordinatorConfig};
    use courier_store_memory::MemoryStore;

    async fn start(name: &str) -> (String, CancellationToken, tokio::task::JoinHandle<()>) {
        start_with(name, Arc::new(ConsumptionSession::new(16))).await
    }

    async fn start_with(
        name: &str,
        session: Arc<ConsumptionSession>,
    ) -> (String, CancellationToken, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let token = CancellationToken::new();
        let handle = {
            let (name, token) = (name.to_string(), token.clone());
            tokio::spawn(async move { serve(listener, name, session, token).await.unwrap() })
        };
        (base, token, handle)
    }

    #[tokio::test]
    async fn greets_with_configured_name() {
        let (base, token, handle) = start("Courier").await;

        let body = reqwest::get(format!("{base}/")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "Hello Courier!\n");

        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        token.cancel();
        handle.await.unwrap();
    }

    /// Holds every message until the gate opens.
    struct Held {
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedSender<String>,
    }

    impl Handler for Held {
        fn handle<'a>(&'a self, message: &'a Message, _ctx: &'a HandlerContext) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                let _ = self.started.send(message.id.clone());
                let _permit = self.gate.acquire().await.unwrap();
                Outcome::Committed(WriteOutcome::Inserted)
            })
        }
    }

    #[tokio::test]
    async fn health_reports_draining_with_503() {
        let broker = MemoryBroker::new("orders");
        broker.publish("m-1", "x");

        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let handler = Held {
            gate: gate.clone(),
            started: started_tx,
        };
        let coordinator = Arc::new(
            Coordinator::new(
                CoordinatorConfig {
                    workers: 1,
                    ..Default::default()
                },
                Arc::new(MemoryStore::new()),
                Arc::new(handler),
            )
            .unwrap(),
        );
        let (base, http_token, http) = start_with("Courier", coordinator.session()).await;

        let consume = CancellationToken::new();
        let run = {
            let (coordinator, consume) = (coordinator.clone(), consume.clone());
            let sub = broker.subscribe();
            tokio::spawn(async move { coordinator.run(consume, Box::new(sub)).await })
        };
        tokio::time::timeout(Duration::from_secs(5), started.recv())
            .await
            .expect("timeout")
            .unwrap();

        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        // cancelled with a handler still in flight
        consume.cancel();
        let mut state = coordinator.session().subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SessionState::Draining),
        )
        .await
        .expect("timeout")
        .unwrap();

        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 503);
        assert_eq!(resp.text().await.unwrap(), "draining");

        gate.add_permits(1);
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        assert_eq!(report.committed, 1);

        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 503);
        assert_eq!(resp.text().await.unwrap(), "stopped");

        http_token.cancel();
        http.await.unwrap();
    }
}
