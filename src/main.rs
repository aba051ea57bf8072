use std::sync::Arc;
use std::time::Duration;

use chat_download_api::api::download_routes;
use chat_download_api::config::ServiceConfig;
use chat_download_api::jobs::JobManager;
use chat_download_api::source::{ChatSource, RemoteChatSource};

/// How long shutdown waits for running downloads to record their final status.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    let source_url = config.chat_source_url.clone().unwrap_or_else(|| {
        eprintln!("Error: CHAT_SOURCE_URL not set");
        eprintln!("  export CHAT_SOURCE_URL=http://localhost:9000");
        std::process::exit(1);
    });
    let source: Arc<dyn ChatSource> = Arc::new(RemoteChatSource::new(source_url));

    tokio::fs::create_dir_all(&config.download_dir).await?;

    eprintln!("Chat Downloader API v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}:{}", config.host, config.port);
    eprintln!("   Chat source: {}", config.chat_source_url.as_deref().unwrap_or("-"));
    eprintln!("   Downloads: {}", config.download_dir.display());
    eprintln!(
        "   Limits: {} concurrent, {} messages, {}s timeout (default {}s)",
        config.max_concurrent_downloads,
        config.max_messages_limit,
        config.max_timeout.as_secs(),
        config.default_timeout.as_secs(),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let manager = Arc::new(JobManager::new(config, source));
    let app = download_routes(Arc::clone(&manager));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Download API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    manager.stop_all(SHUTDOWN_GRACE).await;
    tracing::info!("Download API stopped");

    Ok(())
}
