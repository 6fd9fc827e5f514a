use std::sync::Arc;
use std::time::Duration;

use courier::broker::kafka::KafkaPublisher;
use courier::config::AppConfig;
use courier::signals;
use courier::store::postgres::PgStore;
use courier::telemetry;
use courier::Relay;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error running relay application: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), tower::BoxError> {
    dotenvy::dotenv().ok();

    let cfg = AppConfig::load()?;
    telemetry::init(&cfg.log);

    let store = Arc::new(PgStore::connect(&cfg.postgres).await?);
    let publisher = Arc::new(KafkaPublisher::connect(&cfg.kafka)?);

    let handle = Relay::new(store, publisher)
        .with_batch_size(cfg.relay.batch_size)
        .with_interval(Duration::from_millis(cfg.relay.interval_ms))
        .with_grace(Duration::from_secs(cfg.relay.grace_secs))
        .run();
    tracing::info!("relay service started");

    signals::shutdown_signal().await;

    tracing::info!("relay service is shutting down");
    handle.stop().await;
    tracing::info!("relay service is stopped");

    Ok(())
}
