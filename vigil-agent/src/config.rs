use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub url: String,
    pub api_key: String,
    pub hostname: String,
    pub push_interval_secs: u64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("hostname", &self.hostname)
            .field("push_interval_secs", &self.push_interval_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateConfig {
    /// Disable to pin the agent at its current build.
    pub auto_update: bool,
    /// Poll cycles between update checks (60 cycles at 15s = 15min).
    pub check_cycles: u64,
    /// Where the agent artifact lives. Defaults to the running executable's
    /// directory when unset.
    pub install_dir: Option<PathBuf>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_update: true,
            check_cycles: 60,
            install_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub command_timeout_secs: u64,
    pub stress_duration_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 15,
            stress_duration_secs: 75,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        let hostname = match std::env::var("VIGIL_HOSTNAME") {
            Ok(h) => h,
            Err(_) => hostname().map_err(|e| format!("Failed to get hostname: {}", e))?,
        };
        Ok(Self {
            server: ServerConfig {
                url: std::env::var("VIGIL_SERVER")
                    .unwrap_or_else(|_| "http://localhost:5000".to_string()),
                api_key: std::env::var("VIGIL_API_KEY")
                    .map_err(|_| "VIGIL_API_KEY not set".to_string())?,
                hostname,
                push_interval_secs: std::env::var("VIGIL_INTERVAL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
            },
            update: UpdateConfig {
                auto_update: std::env::var("VIGIL_AUTO_UPDATE")
                    .map(|v| v.to_lowercase() == "true")
                    .unwrap_or(true),
                ..UpdateConfig::default()
            },
            executor: ExecutorConfig::default(),
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "plain".to_string(),
            },
        })
    }
}

fn hostname() -> Result<String, std::io::Error> {
    std::process::Command::new("hostname")
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
