use tracing_subscriber::EnvFilter;

use sitelink::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sitelink=info,tower_http=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!(
        working_dir = %config.working_dir.display(),
        platform = %config.agent_service_url,
        "Starting sitelink {}",
        env!("CARGO_PKG_VERSION")
    );

    api::serve(config).await
}
