//! parley-server: the Parley relay daemon.
//!
//! Single OS process running a Tokio async runtime. Clients connect over
//! TCP (port 1666 by default); the daemon relays packets between them
//! without access to end-to-end encrypted payloads.

use tracing::info;

use parley_server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = load_config()?;

    // 2. Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("parley={}", config.log_level).parse()?),
        )
        .init();

    info!("Parley relay starting");

    // 3. Bind and serve
    let server = RelayServer::bind(&config).await?;
    info!(addr = %server.local_addr()?, "relay ready");

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    info!("relay stopped");
    Ok(())
}

/// Read `PARLEY_CONFIG` if set, otherwise use defaults.
fn load_config() -> anyhow::Result<ServerConfig> {
    match std::env::var("PARLEY_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(ServerConfig::from_toml(&text)?)
        }
        Err(_) => Ok(ServerConfig::default()),
    }
}
