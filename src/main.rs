use std::sync::Arc;

use webhook_trap::{
    api, broadcast::EventBroadcaster, config::AppConfig, reaper, store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_trap=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env().map_err(|err| anyhow::anyhow!(err))?;

    let broadcaster = Arc::new(EventBroadcaster::new());
    let store = store::connect(&config, Arc::clone(&broadcaster)).await;
    reaper::spawn(Arc::clone(&store), config.reaper_interval);

    let app = api::router(api::AppState {
        store: Arc::clone(&store),
        broadcaster,
        base_url: config.base_url.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, backend = %store.mode(), "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
