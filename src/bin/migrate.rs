use courier::config::AppConfig;
use courier::store::postgres::PgStore;
use courier::telemetry;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error running migrate application: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), tower::BoxError> {
    dotenvy::dotenv().ok();

    let cfg = AppConfig::load()?;
    telemetry::init(&cfg.log);

    let store = PgStore::connect(&cfg.postgres).await?;

    tracing::info!("starting database migration");
    sqlx::migrate!("./migrations").run(store.pool()).await?;
    tracing::info!("database migration completed successfully");

    Ok(())
}
