use anyhow::Context;

use casesync_api::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => casesync_observability::init_pretty(),
        _ => casesync_observability::init(),
    }

    let config = ServerConfig::from_env()?;
    let services = casesync_api::app::services::build_services(&config).await?;
    let app = casesync_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
