use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier::broker::kafka::KafkaPublisher;
use courier::catalog::{self, ProductService, TOPIC_PRODUCT_CREATED};
use courier::config::AppConfig;
use courier::consumer::{ConsumerService, HandlerRegistry};
use courier::http::{self, AppState};
use courier::signals;
use courier::store::postgres::PgStore;
use courier::telemetry;
use courier::Relay;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error running standalone application: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), tower::BoxError> {
    dotenvy::dotenv().ok();

    let cfg = AppConfig::load()?;
    telemetry::init(&cfg.log);

    let store = Arc::new(PgStore::connect(&cfg.postgres).await?);
    let publisher = Arc::new(KafkaPublisher::connect(&cfg.kafka)?);

    let mut registry = HandlerRegistry::new();
    registry.register(TOPIC_PRODUCT_CREATED, catalog::product_created_handler())?;
    let consumer = ConsumerService::connect(&cfg.kafka, registry)?;

    let shutdown = CancellationToken::new();

    let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));
    tracing::info!("event service started");

    let state = AppState {
        products: Arc::new(ProductService::new(Arc::clone(&store))),
        store: Arc::clone(&store),
    };
    let http_task = tokio::spawn(http::serve(cfg.http.clone(), state, shutdown.clone()));
    tracing::info!("http service started");

    let relay_handle = Relay::new(Arc::clone(&store), publisher)
        .with_batch_size(cfg.relay.batch_size)
        .with_interval(Duration::from_millis(cfg.relay.interval_ms))
        .with_grace(Duration::from_secs(cfg.relay.grace_secs))
        .run();
    tracing::info!("relay service started");

    signals::shutdown_signal().await;
    tracing::info!("standalone application is shutting down");

    shutdown.cancel();
    relay_handle.stop().await;

    let drain = async {
        if let Ok(Err(err)) = http_task.await {
            tracing::error!(error = %err, "error shutting down http service");
        }
        if let Ok(Err(err)) = consumer_task.await {
            tracing::error!(error = %err, "error shutting down event service");
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("shutdown drain exceeded timeout");
    }

    tracing::info!("standalone application is stopped");

    Ok(())
}
