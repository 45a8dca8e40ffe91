//! Configuration loading from bridge.toml.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rpc::{CallOptions, Endpoint, RetryPolicy, ServerConfig};
use runtime::{DispatchLimits, SessionConfig, WindowPolicy};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Prepended to every conversation.
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub history: HistorySection,

    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Any OpenAI-compatible endpoint: OpenAI, Ollama, llama.cpp.
    #[default]
    OpenAi,
    Anthropic,
}

impl Provider {
    /// Environment variable consulted when no key is configured.
    pub fn key_variable(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

/// Reasoning backend configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub provider: Provider,

    #[serde(default = "default_model")]
    pub model: String,

    /// Overrides the provider's default endpoint.
    pub base_url: Option<String>,

    pub api_key: Option<String>,

    /// Only the OpenAI-compatible provider uses this.
    pub temperature: Option<f32>,

    pub max_tokens: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

fn default_model() -> String {
    "llama3.1".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    #[serde(default = "default_turn_budget")]
    pub turn_budget: u32,

    #[serde(default = "default_true")]
    pub allow_multi_call: bool,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_dispatch_deadline")]
    pub dispatch_deadline_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            turn_budget: default_turn_budget(),
            allow_multi_call: true,
            max_in_flight: default_max_in_flight(),
            dispatch_deadline_secs: default_dispatch_deadline(),
        }
    }
}

fn default_turn_budget() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    4
}

fn default_dispatch_deadline() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistorySection {
    pub max_messages: Option<usize>,
    pub max_tokens: Option<usize>,
    #[serde(default = "default_tail")]
    pub tail_messages: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_messages: None,
            max_tokens: None,
            tail_messages: default_tail(),
        }
    }
}

fn default_tail() -> usize {
    4
}

/// One `[[servers]]` entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub name: String,

    /// HTTP binding.
    pub url: Option<String>,

    /// Stream binding over a child process's stdio.
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
}

fn default_timeout() -> u64 {
    15
}

fn default_attempts() -> u32 {
    3
}

impl ServerEntry {
    fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let endpoint = match (&self.url, &self.command) {
            (Some(url), None) => Endpoint::Http { url: url.clone() },
            (None, Some(command)) => Endpoint::Command {
                command: command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            },
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': set either url or command, not both",
                    self.name
                )));
            }
            (None, None) => {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': one of url or command is required",
                    self.name
                )));
            }
        };
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "server '{}': timeout_secs must be at least 1",
                self.name
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "server '{}': max_attempts must be at least 1",
                self.name
            )));
        }
        Ok(ServerConfig {
            name: self.name.clone(),
            endpoint,
            options: CallOptions {
                timeout: Duration::from_secs(self.timeout_secs),
                retry: RetryPolicy {
                    max_attempts: self.max_attempts,
                    ..RetryPolicy::default()
                },
            },
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.turn_budget == 0 {
            return Err(ConfigError::Invalid("session.turn_budget must be at least 1".into()));
        }
        if self.session.max_in_flight == 0 {
            return Err(ConfigError::Invalid("session.max_in_flight must be at least 1".into()));
        }
        if self.session.dispatch_deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.dispatch_deadline_secs must be at least 1".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' is configured twice",
                    server.name
                )));
            }
            server.to_server_config()?;
        }
        Ok(())
    }

    /// Session settings, with `turn_budget` overriding the configured budget.
    pub fn session_config(&self, turn_budget: Option<u32>) -> SessionConfig {
        SessionConfig {
            turn_budget: turn_budget.unwrap_or(self.session.turn_budget),
            allow_multi_call: self.session.allow_multi_call,
            dispatch: DispatchLimits {
                max_in_flight: self.session.max_in_flight,
                phase_deadline: Duration::from_secs(self.session.dispatch_deadline_secs),
            },
            window: WindowPolicy {
                max_messages: self.history.max_messages,
                max_tokens: self.history.max_tokens,
                tail_messages: self.history.tail_messages,
            },
        }
    }

    pub fn server_configs(&self) -> Result<Vec<ServerConfig>, ConfigError> {
        self.servers.iter().map(ServerEntry::to_server_config).collect()
    }

    /// The configured key, or the provider's environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.backend
            .api_key
            .clone()
            .or_else(|| std::env::var(self.backend.provider.key_variable()).ok())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
