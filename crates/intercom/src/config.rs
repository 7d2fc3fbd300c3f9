//! Relay configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `INTERCOM__SECTION__KEY` environment variables.

use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::escalation::EscalationSettings;
use crate::message::ParticipantId;
use crate::policy::{KeywordPolicy, MatchMode, default_keywords};
use crate::registry::{Pairing, RoleConflictPolicy};
use crate::router::OperatorReplyPolicy;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "INTERCOM";

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "intercom.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub alerts: AlertsConfig,
    pub registry: RegistryConfig,
    pub escalation: EscalationConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
    /// Pairings known before anyone connects.
    pub pairings: Vec<PairingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Outbound events buffered per connection before sends fail with backpressure.
    pub connection_buffer: usize,
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            connection_buffer: 64,
            ping_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.bind, self.port).parse()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub keywords: Vec<String>,
    pub match_mode: MatchMode,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
            match_mode: MatchMode::default(),
        }
    }
}

impl AlertsConfig {
    pub fn build_policy(&self) -> Result<KeywordPolicy, regex::Error> {
        KeywordPolicy::new(&self.keywords, self.match_mode)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub role_conflict: RoleConflictPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Operator preferred for new channels while connected.
    pub operator_id: Option<String>,
    /// Close channels idle for this many seconds. Unset keeps them open until
    /// an operator closes them.
    pub idle_timeout_secs: Option<u64>,
    pub reply_policy: OperatorReplyPolicy,
}

impl EscalationConfig {
    pub fn settings(&self) -> EscalationSettings {
        EscalationSettings {
            preferred_operator: self.operator_id.as_deref().map(ParticipantId::from),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append audit records as JSON lines to this file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingConfig {
    pub primary: String,
    pub companion: String,
}

impl From<&PairingConfig> for Pairing {
    fn from(value: &PairingConfig) -> Self {
        Pairing::new(value.primary.as_str(), value.companion.as_str())
    }
}

impl RelayConfig {
    /// Load from `path` (required when given) or `intercom.toml` (optional),
    /// with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE)
                .format(FileFormat::Toml)
                .required(false),
        };

        let built = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?;

        let config: RelayConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.connection_buffer == 0 {
            return Err(ConfigError::Message(
                "server.connection_buffer must be at least 1".to_string(),
            ));
        }
        if self.server.ping_interval_secs == 0 {
            return Err(ConfigError::Message(
                "server.ping_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.escalation.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Message(
                "escalation.idle_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        if let Err(e) = self.alerts.build_policy() {
            return Err(ConfigError::Message(format!("alerts.keywords: {e}")));
        }
        for pairing in &self.pairings {
            if pairing.primary.trim().is_empty() || pairing.companion.trim().is_empty() {
                return Err(ConfigError::Message(
                    "pairings entries need both primary and companion".to_string(),
                ));
            }
            if pairing.primary == pairing.companion {
                return Err(ConfigError::Message(format!(
                    "pairing {} cannot pair with itself",
                    pairing.primary
                )));
            }
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("alerts.keywords")
}
