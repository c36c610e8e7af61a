use courier_broker_pubsub::{CONSUME_PERMISSION, PubSubClient};
use courier_engine::preflight;
use courier_store_postgres::PgStore;

use crate::config::{ProbeArgs, WorkerConfig};
use crate::error::WorkerError;

/// The `serve` startup checks without consuming anything.
pub async fn run(args: ProbeArgs) -> Result<(), WorkerError> {
    let config = WorkerConfig::resolve(&args.common)?;

    let store = PgStore::new(&config.store)?;
    let checked = preflight::check_store(&store).await;
    store.close().await;
    checked?;
    println!("store: ok (table {})", store.table());

    let client = PubSubClient::new(&config.pubsub)?;
    preflight::check_subscription(&client, &[CONSUME_PERMISSION]).await?;
    println!("subscription: ok ({} allowed on {})", CONSUME_PERMISSION, client.subscription_path());
    Ok(())
}
