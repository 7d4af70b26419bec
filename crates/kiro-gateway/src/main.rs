use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kiro_auth::{CredentialManager, RefreshAdapter};
use kiro_core::config::{GatewayConfig, EXIT_CONFIG_INVALID, EXIT_NO_CREDENTIAL};
use tracing::{error, info};

use kiro_gateway::app;

/// Anthropic/OpenAI-compatible gateway in front of the Kiro chat backend.
#[derive(Parser)]
#[command(name = "kiro-gateway", version)]
struct Cli {
    /// Bind address (overrides BIND).
    #[arg(long)]
    bind: Option<String>,
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiro_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("config load failed: {e}");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(EXIT_CONFIG_INVALID);
    }

    // Proxy env must be in place before any HTTP client is constructed.
    if let Some(proxy) = config.vpn_proxy_url.clone().filter(|p| !p.is_empty()) {
        kiro_core::proxy::apply_proxy_env(&proxy);
    }

    let (store, credential) = match kiro_auth::discover_credential(&config) {
        Ok(Some(found)) => found,
        Ok(None) => {
            error!("no usable credential: set REFRESH_TOKEN, KIRO_CREDS_FILE, or KIRO_CLI_DB_FILE");
            std::process::exit(EXIT_NO_CREDENTIAL);
        }
        Err(e) => {
            error!("credential discovery failed: {e}");
            std::process::exit(EXIT_NO_CREDENTIAL);
        }
    };
    info!(
        source = ?credential.source,
        provider = ?credential.provider(),
        "credential loaded"
    );

    let adapter = RefreshAdapter::new(reqwest::Client::new());
    let credentials = Arc::new(CredentialManager::new(credential, store, adapter));

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState::new(config, credentials));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("kiro gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
