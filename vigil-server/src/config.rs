use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub agent_dist: AgentDistConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub api_key: String,
    pub db_path: PathBuf,
}

impl std::fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_key", &"[REDACTED]")
            .field("db_path", &self.db_path)
            .finish()
    }
}

/// Description of the agent build this controller hands out to the fleet.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AgentDistConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
    #[serde(default)]
    pub requirements_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl ServerConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            http: HttpConfig {
                bind_addr: std::env::var("VIGIL_BIND")
                    .unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
                api_key: std::env::var("VIGIL_API_KEY")
                    .map_err(|_| "VIGIL_API_KEY not set".to_string())?,
                db_path: PathBuf::from(
                    std::env::var("VIGIL_DB").unwrap_or_else(|_| "vigil.db".to_string()),
                ),
            },
            agent_dist: AgentDistConfig {
                version: std::env::var("VIGIL_AGENT_VERSION").ok(),
                artifact_path: std::env::var("VIGIL_AGENT_ARTIFACT").ok().map(PathBuf::from),
                requirements_path: std::env::var("VIGIL_AGENT_REQUIREMENTS")
                    .ok()
                    .map(PathBuf::from),
            },
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}
