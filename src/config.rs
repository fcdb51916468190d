//! Configuration loading and validation.
//!
//! All options are process-wide constants resolved once at startup and read
//! without locks afterwards.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default stale-task threshold: 15 minutes.
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 900_000;

/// Default watchdog scan interval: 2 minutes.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 120_000;

/// Default per-(agent, channel) wake-up cooldown: 5 seconds.
pub const DEFAULT_TRIGGER_COOLDOWN_MS: i64 = 5_000;

/// Default list limits: messages / task logs / tasks.
pub const DEFAULT_MESSAGE_LIMIT: i64 = 50;
pub const DEFAULT_LOG_LIMIT: i64 = 100;
pub const DEFAULT_TASK_LIMIT: i64 = 200;

/// One agent in the company roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub emoji: String,
    /// Org layer, e.g. "exec" or "ic".
    #[serde(default)]
    pub layer: String,
    #[serde(default)]
    pub role: String,
}

/// Agentco configuration.
#[derive(Debug, Clone)]
pub struct CompanyConfig {
    /// State directory root (`$HOME/.openclaw` by default).
    pub state_dir: PathBuf,

    /// HTTP bind address for the RPC/dashboard surface.
    pub http_bind: SocketAddr,

    /// External agent gateway RPC endpoint.
    pub gateway_url: String,

    /// The default (CEO) agent id.
    pub default_agent_id: String,

    /// Known agents. The trigger engine only wakes ids on this roster.
    pub agents: Vec<AgentProfile>,

    /// Watchdog stale threshold in milliseconds.
    pub stale_threshold_ms: i64,

    /// Watchdog scan interval in milliseconds.
    pub check_interval_ms: u64,

    /// Trigger-engine cooldown window in milliseconds.
    pub trigger_cooldown_ms: i64,

    /// Path for the append-only gateway call log.
    pub llm_call_log_file: PathBuf,
}

/// `company.toml` on-disk shape.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    company: CompanySection,
    #[serde(default)]
    agents: Vec<AgentProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct CompanySection {
    http_bind: Option<String>,
    gateway_url: Option<String>,
    default_agent_id: Option<String>,
    stale_threshold_ms: Option<i64>,
    check_interval_ms: Option<u64>,
    trigger_cooldown_ms: Option<i64>,
}

impl CompanyConfig {
    /// Load configuration from the environment and the optional
    /// `company.toml` inside the state directory.
    pub fn load() -> Result<Self> {
        let state_dir = Self::resolve_state_dir();
        Self::load_from_state_dir(state_dir)
    }

    /// Load configuration rooted at an explicit state directory.
    pub fn load_from_state_dir(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir).with_context(|| {
            format!("failed to create state directory: {}", state_dir.display())
        })?;

        let file = Self::read_config_file(&state_dir.join("company.toml"))?;

        let http_bind = file
            .company
            .http_bind
            .as_deref()
            .unwrap_or("127.0.0.1:18790")
            .parse::<SocketAddr>()
            .map_err(|error| ConfigError::Invalid(format!("http_bind: {error}")))?;

        let default_agent_id = file
            .company
            .default_agent_id
            .unwrap_or_else(|| "main".to_string());

        let mut agents = file.agents;
        if agents.is_empty() {
            agents.push(AgentProfile {
                id: default_agent_id.clone(),
                name: "CEO".to_string(),
                emoji: "🧭".to_string(),
                layer: "exec".to_string(),
                role: "chief executive".to_string(),
            });
        }

        let gateway_url = std::env::var("OPENCLAW_GATEWAY_URL")
            .ok()
            .or(file.company.gateway_url)
            .unwrap_or_else(|| "http://127.0.0.1:18789/rpc".to_string());

        let llm_call_log_file = std::env::var("OPENCLAW_LLM_CALL_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("logs").join("llm-calls.jsonl"));

        let config = Self {
            state_dir,
            http_bind,
            gateway_url,
            default_agent_id,
            agents,
            stale_threshold_ms: file
                .company
                .stale_threshold_ms
                .unwrap_or(DEFAULT_STALE_THRESHOLD_MS),
            check_interval_ms: file
                .company
                .check_interval_ms
                .unwrap_or(DEFAULT_CHECK_INTERVAL_MS),
            trigger_cooldown_ms: file
                .company
                .trigger_cooldown_ms
                .unwrap_or(DEFAULT_TRIGGER_COOLDOWN_MS),
            llm_call_log_file,
        };

        config.ensure_layout()?;
        Ok(config)
    }

    /// `$HOME/.openclaw`, suffixed by `OPENCLAW_PROFILE` when set
    /// (`OPENCLAW_PROFILE=dev` → `$HOME/.openclaw-dev`).
    fn resolve_state_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match std::env::var("OPENCLAW_PROFILE") {
            Ok(profile) if !profile.is_empty() => home.join(format!(".openclaw-{profile}")),
            _ => home.join(".openclaw"),
        }
    }

    fn read_config_file(path: &Path) -> Result<ConfigFile> {
        if !path.exists() {
            return Ok(ConfigFile::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;

        let file: ConfigFile = toml::from_str(&raw)
            .map_err(|error| ConfigError::Invalid(format!("{}: {error}", path.display())))?;
        Ok(file)
    }

    /// Create the on-disk layout the stores and views expect.
    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.company_dir(),
            self.company_dir().join("kb"),
            self.workspace_dir(),
            self.workspaces_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Whether the given id is a known agent.
    pub fn is_agent(&self, id: &str) -> bool {
        self.agents.iter().any(|agent| agent.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    pub fn company_dir(&self) -> PathBuf {
        self.state_dir.join("company")
    }

    /// The default (CEO) agent's workspace.
    pub fn workspace_dir(&self) -> PathBuf {
        self.state_dir.join("workspace")
    }

    /// Per-agent workspaces root.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn channels_db_path(&self) -> PathBuf {
        self.company_dir().join("channels.db")
    }

    pub fn tasks_db_path(&self) -> PathBuf {
        self.company_dir().join("tasks.db")
    }
}
