use std::time::Duration;

use base64::Engine;
use libsignal_protocol::IdentityKey;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {var} value: {value}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Client configuration loaded from courier.toml with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Tracing log level. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound on the transport handshake. Default: 20
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// How long an IQ waits for its response. Default: 75
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Keepalive ping interval lower bound. Default: 20
    #[serde(default = "default_keepalive_min_secs")]
    pub keepalive_min_secs: u64,
    /// Keepalive ping interval upper bound. Default: 30
    #[serde(default = "default_keepalive_max_secs")]
    pub keepalive_max_secs: u64,
    /// A ping unanswered for this long kills the connection. Default: 20
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    /// Bounded queue between the reader and the dispatcher. Default: 1024
    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,
    /// Inbound nodes handled at once. Default: 64
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    /// First reconnect delay. Default: 1000
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    /// Reconnect delay ceiling. Default: 60000
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Sent payloads kept for answering retry receipts. Also caps the
    /// message ids tracked for retry counts and ack hashes. Default: 256
    #[serde(default = "default_recent_message_cache_size")]
    pub recent_message_cache_size: usize,
    /// Retry receipts sent per inbound message before giving up. Default: 5
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Retry count a peer must exceed before we rebuild its session. Default: 1
    #[serde(default = "default_session_recreate_min_retry")]
    pub session_recreate_min_retry: u32,
    /// Minimum time between session rebuilds for one device. Default: 3600
    #[serde(default = "default_session_recreate_cooldown_secs")]
    pub session_recreate_cooldown_secs: u64,
    /// Minimum time between requests for the same missing sync key. Default: 86400
    #[serde(default = "default_app_state_key_request_cooldown_secs")]
    pub app_state_key_request_cooldown_secs: u64,
    /// Emit per-mutation events during a full app-state resync. Default: false
    #[serde(default)]
    pub emit_app_state_events_on_full_sync: bool,
    /// Replace a changed remote identity instead of rejecting it. Default: false
    #[serde(default)]
    pub auto_trust_identity: bool,
    /// Upload more one-time pre-keys below this server count. Default: 5
    #[serde(default = "default_pre_key_upload_threshold")]
    pub pre_key_upload_threshold: usize,
    /// One-time pre-keys per upload. Default: 50
    #[serde(default = "default_pre_key_upload_batch")]
    pub pre_key_upload_batch: u32,
    /// Signed pre-key rotation age. Default: 30
    #[serde(default = "default_signed_pre_key_max_age_days")]
    pub signed_pre_key_max_age_days: u32,
    /// Base64 root key that must sign the relay's certificate.
    #[serde(default)]
    pub trusted_root_key: Option<String>,
    /// SQLite database path. In-memory store when absent.
    #[serde(default)]
    pub store_path: Option<String>,
    /// Connect without becoming the active device. Default: false
    #[serde(default)]
    pub passive: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_handshake_timeout_secs() -> u64 {
    20
}
fn default_request_timeout_secs() -> u64 {
    75
}
fn default_keepalive_min_secs() -> u64 {
    20
}
fn default_keepalive_max_secs() -> u64 {
    30
}
fn default_keepalive_timeout_secs() -> u64 {
    20
}
fn default_work_queue_capacity() -> usize {
    1024
}
fn default_max_concurrent_handlers() -> usize {
    64
}
fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}
fn default_recent_message_cache_size() -> usize {
    256
}
fn default_max_retry_count() -> u32 {
    5
}
fn default_session_recreate_min_retry() -> u32 {
    1
}
fn default_session_recreate_cooldown_secs() -> u64 {
    3600
}
fn default_app_state_key_request_cooldown_secs() -> u64 {
    86_400
}
fn default_pre_key_upload_threshold() -> usize {
    5
}
fn default_pre_key_upload_batch() -> u32 {
    50
}
fn default_signed_pre_key_max_age_days() -> u32 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            keepalive_min_secs: default_keepalive_min_secs(),
            keepalive_max_secs: default_keepalive_max_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            work_queue_capacity: default_work_queue_capacity(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            recent_message_cache_size: default_recent_message_cache_size(),
            max_retry_count: default_max_retry_count(),
            session_recreate_min_retry: default_session_recreate_min_retry(),
            session_recreate_cooldown_secs: default_session_recreate_cooldown_secs(),
            app_state_key_request_cooldown_secs: default_app_state_key_request_cooldown_secs(),
            emit_app_state_events_on_full_sync: false,
            auto_trust_identity: false,
            pre_key_upload_threshold: default_pre_key_upload_threshold(),
            pre_key_upload_batch: default_pre_key_upload_batch(),
            signed_pre_key_max_age_days: default_signed_pre_key_max_age_days(),
            trusted_root_key: None,
            store_path: None,
            passive: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(var) {
        *target = val
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value: val })?;
    }
    Ok(())
}

impl ClientConfig {
    /// Load configuration from TOML file with environment variable overrides.
    ///
    /// Reads `courier.toml` from CWD (or path in `COURIER_CONFIG_PATH`),
    /// then overrides individual fields from `COURIER_*` env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("COURIER_CONFIG_PATH").unwrap_or_else(|_| "courier.toml".to_string());
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the config.
    ///
    /// Returns an error if an env var is set but has an invalid format
    /// (e.g., COURIER_MAX_RETRY_COUNT=abc).
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("COURIER_LOG_LEVEL") {
            self.log_level = val;
        }
        parse_env("COURIER_HANDSHAKE_TIMEOUT_SECS", &mut self.handshake_timeout_secs)?;
        parse_env("COURIER_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        parse_env("COURIER_KEEPALIVE_MIN_SECS", &mut self.keepalive_min_secs)?;
        parse_env("COURIER_KEEPALIVE_MAX_SECS", &mut self.keepalive_max_secs)?;
        parse_env("COURIER_KEEPALIVE_TIMEOUT_SECS", &mut self.keepalive_timeout_secs)?;
        parse_env("COURIER_MAX_RETRY_COUNT", &mut self.max_retry_count)?;
        parse_env(
            "COURIER_SESSION_RECREATE_COOLDOWN_SECS",
            &mut self.session_recreate_cooldown_secs,
        )?;
        parse_env("COURIER_AUTO_TRUST_IDENTITY", &mut self.auto_trust_identity)?;
        parse_env("COURIER_PASSIVE", &mut self.passive)?;
        if let Ok(val) = std::env::var("COURIER_TRUSTED_ROOT_KEY") {
            self.trusted_root_key = Some(val);
        }
        if let Ok(val) = std::env::var("COURIER_STORE_PATH") {
            self.store_path = Some(val);
        }
        Ok(())
    }

    /// Reject combinations the connection loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_min_secs == 0 || self.keepalive_min_secs > self.keepalive_max_secs {
            return Err(ConfigError::Invalid(format!(
                "keepalive interval [{}, {}] is empty",
                self.keepalive_min_secs, self.keepalive_max_secs
            )));
        }
        if self.work_queue_capacity == 0 || self.max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid(
                "work queue and handler limits must be positive".into(),
            ));
        }
        if self.recent_message_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "recent_message_cache_size must be positive".into(),
            ));
        }
        if self.reconnect_initial_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect_initial_delay_ms exceeds reconnect_max_delay_ms".into(),
            ));
        }
        self.trusted_root()?;
        Ok(())
    }

    /// The decoded trusted root key, if configured.
    pub fn trusted_root(&self) -> Result<Option<IdentityKey>, ConfigError> {
        let Some(encoded) = &self.trusted_root_key else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ConfigError::Invalid(format!("trusted_root_key: {e}")))?;
        IdentityKey::decode(&bytes)
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("trusted_root_key: {e}")))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn session_recreate_cooldown(&self) -> Duration {
        Duration::from_secs(self.session_recreate_cooldown_secs)
    }

    pub fn app_state_key_request_cooldown(&self) -> Duration {
        Duration::from_secs(self.app_state_key_request_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_loads_from_valid_toml_string() {
        let toml = r#"
            log_level = "debug"
            handshake_timeout_secs = 5
            keepalive_min_secs = 10
            keepalive_max_secs = 15
            max_retry_count = 3
            auto_trust_identity = true
            store_path = "/tmp/courier.db"
        "#;
        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.keepalive_min_secs, 10);
        assert_eq!(config.keepalive_max_secs, 15);
        assert_eq!(config.max_retry_count, 3);
        assert!(config.auto_trust_identity);
        assert_eq!(config.store_path.as_deref(), Some("/tmp/courier.db"));
    }

    #[test]
    #[serial]
    fn test_config_has_correct_defaults_for_omitted_fields() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.handshake_timeout_secs, 20);
        assert_eq!(config.recent_message_cache_size, 256);
        assert_eq!(config.max_retry_count, 5);
        assert_eq!(config.session_recreate_min_retry, 1);
        assert_eq!(config.session_recreate_cooldown(), Duration::from_secs(3600));
        assert_eq!(
            config.app_state_key_request_cooldown(),
            Duration::from_secs(86_400)
        );
        assert!(!config.emit_app_state_events_on_full_sync);
        assert!(!config.auto_trust_identity);
        assert!(config.trusted_root().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_config_applies_env_var_overrides() {
        std::env::set_var("COURIER_MAX_RETRY_COUNT", "9");
        std::env::set_var("COURIER_LOG_LEVEL", "trace");
        let config = ClientConfig::from_toml_str("max_retry_count = 2").unwrap();
        std::env::remove_var("COURIER_MAX_RETRY_COUNT");
        std::env::remove_var("COURIER_LOG_LEVEL");
        assert_eq!(config.max_retry_count, 9);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    #[serial]
    fn test_config_rejects_invalid_env_value() {
        std::env::set_var("COURIER_HANDSHAKE_TIMEOUT_SECS", "soon");
        let result = ClientConfig::from_toml_str("");
        std::env::remove_var("COURIER_HANDSHAKE_TIMEOUT_SECS");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv {
                var: "COURIER_HANDSHAKE_TIMEOUT_SECS",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn test_config_fails_on_malformed_toml() {
        let toml = "this is not valid = [[[toml";
        assert!(matches!(
            ClientConfig::from_toml_str(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_rejects_inverted_keepalive_interval() {
        let toml = r#"
            keepalive_min_secs = 40
            keepalive_max_secs = 30
        "#;
        assert!(matches!(
            ClientConfig::from_toml_str(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_decodes_trusted_root_key() {
        let root = *libsignal_protocol::IdentityKeyPair::generate(&mut rand::rng()).identity_key();
        let encoded = base64::engine::general_purpose::STANDARD.encode(root.serialize());
        let config =
            ClientConfig::from_toml_str(&format!("trusted_root_key = \"{encoded}\"")).unwrap();
        assert_eq!(config.trusted_root().unwrap(), Some(root));

        assert!(ClientConfig::from_toml_str("trusted_root_key = \"!!\"").is_err());
    }
}
