use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_broker_pubsub::{CONSUME_PERMISSION, PubSubClient};
use courier_engine::{Coordinator, RecordHandler, preflight, signal};
use courier_store_postgres::PgStore;

use crate::config::{ServeArgs, WorkerConfig};
use crate::error::WorkerError;
use crate::http;

pub async fn run(args: ServeArgs) -> Result<(), WorkerError> {
    tracing::info!("courier-worker starting");

    // --- Config ---
    let config = WorkerConfig::resolve(&args.common)?;
    tracing::debug!(?config, "resolved config");

    // --- Store: connect and prepare before anything is consumed ---
    let store = Arc::new(PgStore::new(&config.store)?);
    preflight::check_store(store.as_ref()).await?;

    // --- Subscription: must be allowed to consume ---
    let client = PubSubClient::new(&config.pubsub)?;
    preflight::check_subscription(&client, &[CONSUME_PERMISSION]).await?;

    let handler = Arc::new(RecordHandler::new(config.handler.clone()));
    let coordinator = Coordinator::new(config.coordinator.clone(), store.clone(), handler)?;

    // --- Single cancellation context for the whole process ---
    let token = CancellationToken::new();

    let listener = http::bind(args.port).await?;
    let http_handle = tokio::spawn(http::serve(
        listener,
        args.name.clone(),
        coordinator.session(),
        token.clone(),
    ));
    tracing::info!(port = args.port, "health endpoint listening");

    let signals = signal::spawn_listener(token.clone())?;

    let result = coordinator
        .run(token.clone(), Box::new(client.subscribe()))
        .await;

    // The session may have ended on its own (fatal error); stop the rest too.
    token.cancel();
    signals.abort();
    match http_handle.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "health endpoint failed"),
        Err(e) => tracing::warn!(error = %e, "health endpoint task failed"),
        Ok(Ok(())) => {}
    }
    store.close().await;

    let report = result?;
    tracing::info!(
        committed = report.committed,
        duplicates = report.duplicates,
        poisoned = report.poisoned,
        "shutdown complete"
    );
    Ok(())
}
