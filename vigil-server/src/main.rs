use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

mod api;
mod config;
mod errors;
mod ledger;

pub use config::ServerConfig;
pub use errors::{ServerError, ServerResult};
pub use ledger::CommandLedger;

#[tokio::main]
async fn main() -> ServerResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = ServerConfig::from_file(config_path)
        .or_else(|_| ServerConfig::from_file("/etc/vigil/server.toml"))
        .or_else(|_| ServerConfig::from_env())
        .map_err(ServerError::ConfigError)?;

    let filter = format!("vigil_server={},tower_http=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Vigil server starting");
    info!("Configuration loaded: {:?}", config);

    let ledger = Arc::new(CommandLedger::open(&config.http.db_path)?);
    let artifact_sha256 = artifact_checksum(&config);

    let state = api::AppState {
        ledger,
        config: Arc::new(config.clone()),
        artifact_sha256,
    };

    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr).await?;
    info!("Listening on {}", config.http.bind_addr);

    axum::serve(listener, api::router(state))
        .await
        .map_err(|e| ServerError::InternalError(e.to_string()))
}

/// Hash the configured agent artifact so the version endpoint can advertise
/// it. Recomputed only at startup; redeploying a new build means restarting.
fn artifact_checksum(config: &ServerConfig) -> Option<String> {
    let path = config.agent_dist.artifact_path.as_ref()?;
    match std::fs::read(path) {
        Ok(bytes) => {
            let digest = Sha256::digest(&bytes);
            Some(
                digest
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>(),
            )
        }
        Err(e) => {
            warn!("Agent artifact {:?} unreadable, serving without checksum: {}", path, e);
            None
        }
    }
}
