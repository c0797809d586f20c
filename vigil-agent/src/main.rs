use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod collector;
mod config;
mod errors;
mod executor;
mod registry;
mod transport;
mod updater;

pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};
pub use executor::Executor;
pub use registry::CommandRegistry;
pub use transport::ServerClient;
pub use updater::Updater;

use collector::{Collector, AGENT_VERSION};
use updater::UpdateOutcome;

/// Backoff after this many consecutive failed pushes.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

struct VigilAgent {
    config: Arc<AgentConfig>,
    client: Arc<ServerClient>,
    executor: Arc<Executor>,
    updater: Arc<Updater>,
    restart_rx: mpsc::Receiver<()>,
}

impl VigilAgent {
    fn new(config: AgentConfig) -> AgentResult<Self> {
        info!("Initializing Vigil agent");

        let config = Arc::new(config);
        let client = Arc::new(ServerClient::new(
            &config.server.url,
            &config.server.api_key,
        )?);
        let registry = Arc::new(CommandRegistry::current()?);
        let updater = Arc::new(Updater::new(
            client.clone(),
            config.update.install_dir.clone(),
            AGENT_VERSION,
        )?);

        let (restart_tx, restart_rx) = mpsc::channel(1);
        let executor = Arc::new(Executor::new(
            config.clone(),
            registry,
            client.clone(),
            updater.clone(),
            restart_tx,
        ));

        Ok(Self {
            config,
            client,
            executor,
            updater,
            restart_rx,
        })
    }

    /// The agent's spine: collect -> push -> execute delivered commands ->
    /// sleep. Commands from one batch run sequentially unless a handler
    /// detaches itself.
    async fn run(&mut self) -> AgentResult<()> {
        let interval = Duration::from_secs(self.config.server.push_interval_secs);
        let mut collector = Collector::new();
        let mut consecutive_failures = 0u32;
        let mut update_counter = 0u64;

        loop {
            update_counter += 1;
            if self.config.update.auto_update && update_counter >= self.config.update.check_cycles {
                update_counter = 0;
                match self.updater.check_and_apply().await {
                    Ok(UpdateOutcome::Applied { version }) => {
                        info!("Auto-update to v{} applied. Restarting...", version);
                        return restart_in_place();
                    }
                    Ok(UpdateOutcome::UpToDate) => {}
                    Err(e) => warn!("Update check failed: {}", e),
                }
            }

            let report = collector.collect(&self.config.server.hostname);
            match self.client.push_status(&report).await {
                Ok(response) => {
                    consecutive_failures = 0;
                    for command in &response.commands {
                        self.executor.execute(command).await;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!("Failed to push status: {}", e);
                }
            }

            let delay = if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                warn!(
                    "Failed {}x consecutively, backing off...",
                    consecutive_failures
                );
                consecutive_failures = 0;
                interval * 5
            } else {
                interval
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.restart_rx.recv() => {
                    info!("Update applied; exiting so the supervisor relaunches the new build");
                    return Ok(());
                }
            }
        }
    }
}

/// Replace the running image with the freshly installed one: re-exec in
/// place, so no stale code keeps running after a successful file swap.
#[cfg(unix)]
fn restart_in_place() -> AgentResult<()> {
    use std::os::unix::process::CommandExt;
    let exe = std::env::current_exe()?;
    let err = std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .exec();
    // exec only returns on failure.
    Err(AgentError::UpdateError(format!("re-exec failed: {}", err)))
}

/// Windows cannot exec over a locked image; exit cleanly and rely on the
/// service supervisor to relaunch the swapped-in build.
#[cfg(not(unix))]
fn restart_in_place() -> AgentResult<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = AgentConfig::from_file(config_path)
        .or_else(|_| AgentConfig::from_file("/etc/vigil/agent.toml"))
        .or_else(|_| AgentConfig::from_env())
        .map_err(AgentError::ConfigError)?;

    let filter = format!("vigil_agent={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Vigil agent v{} starting", AGENT_VERSION);
    info!(
        "Hostname: {} | Server: {} | Interval: {}s",
        config.server.hostname, config.server.url, config.server.push_interval_secs
    );
    info!("Configuration loaded: {:?}", config);

    let mut agent = VigilAgent::new(config)?;

    // Initial update check before the loop starts; a stale build should not
    // run a full poll cycle.
    if agent.config.update.auto_update {
        match agent.updater.check_and_apply().await {
            Ok(UpdateOutcome::Applied { version }) => {
                info!("Update to v{} applied during startup. Restarting...", version);
                return restart_in_place();
            }
            Ok(UpdateOutcome::UpToDate) => {}
            Err(e) => warn!("Startup update check failed: {}", e),
        }
    }

    agent.run().await
}
