use anyhow::Context;
use quire_live::config::{LiveConfig, LogFormat};
use quire_live::server::{serve, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = LiveConfig::from_env();
    init_tracing(&config);

    let state = AppState::from_config(&config).await.context("failed to initialize live server")?;
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind live listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting live server");

    serve(listener, state, shutdown_signal()).await
}

fn init_tracing(config: &LiveConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
