use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelmux_core::Engine;
use modelmux_provider::ClientCache;
use modelmux_router::{api_router, proxy_router, RouterState};
use modelmux_storage::Store;

#[derive(Debug, Parser)]
#[command(name = "modelmux", version, about = "Weighted multi-provider LLM gateway")]
struct Cli {
    /// Database DSN; any SeaORM-supported backend, SQLite by default.
    #[arg(long, env = "MODELMUX_DSN", default_value = "sqlite://modelmux.db?mode=rwc")]
    dsn: String,

    /// Bind host.
    #[arg(long, env = "MODELMUX_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Bind port.
    #[arg(long, env = "MODELMUX_PORT", default_value_t = 7070)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Cli::parse();

    let store = Store::connect(&args.dsn).await.context("connect storage")?;
    store.sync().await.context("schema sync")?;

    let engine = Engine::new(Arc::new(ClientCache::new()), store);
    let state = RouterState { engine };

    let app = axum::Router::new()
        .merge(proxy_router(state.clone()))
        .merge(api_router(state));

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serve")?;
    Ok(())
}
