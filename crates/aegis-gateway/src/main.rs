use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod http;
mod ws;

#[derive(Parser)]
#[command(name = "aegis-gateway", about = "Aegis agent runtime gateway")]
struct Args {
    /// Path to aegis.toml (defaults to ./aegis.toml, AEGIS_* env overrides apply).
    #[arg(long)]
    config: Option<String>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aegis_gateway=info,aegis_session=info,aegis_vm=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = aegis_core::AegisConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let state = Arc::new(app::AppState::new(config)?);
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", state.config.gateway.bind, state.config.gateway.port)
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("aegis gateway listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping sandboxes");
    state.registry.shutdown_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
