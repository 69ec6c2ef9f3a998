//! Engine configuration.
//!
//! Loaded from a `.toml` or `.json` file, then overridden by environment
//! variables of the form `ANCHOR_SYNC_<SECTION>__<KEY>`, e.g.
//! `ANCHOR_SYNC_CLOUD__MAX_TTL_DAYS=30`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cloud::CloudRequestPolicy;
use crate::error::{AnchorError, AnchorResult};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ANCHOR_SYNC_";

/// Node attachment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// How long anchor creation waits for the session to attach a node
    pub timeout_ms: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

/// Cloud request settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// TTL applied to uploads that do not specify one
    pub default_ttl_days: Option<u32>,
    /// Largest accepted TTL
    pub max_ttl_days: u32,
    /// Requests allowed in flight at once
    pub max_pending_requests: usize,
    /// Refresh the token and resubmit once when the service rejects it
    pub retry_on_unauthorized: bool,
    /// Stop waiting for a cloud outcome after this long
    pub result_timeout_ms: Option<u64>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            default_ttl_days: None,
            max_ttl_days: 365,
            max_pending_requests: 256,
            retry_on_unauthorized: true,
            result_timeout_ms: None,
        }
    }
}

/// Caller relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long the caller has to name a resolved anchor
    pub acknowledgment_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            acknowledgment_timeout_ms: 5_000,
        }
    }
}

/// Credential settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Regenerate tokens this long before they expire
    pub refresh_margin_secs: u64,
    /// Lifetime of signed tokens
    pub lifetime_secs: u64,
    /// Audience claim of signed tokens
    pub audience: String,
    /// Service key file used when no token provider is supplied
    pub key_path: Option<PathBuf>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 60,
            lifetime_secs: 3_600,
            audience: "https://arcorecloudanchor.googleapis.com/".to_string(),
            key_path: None,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSyncConfig {
    /// Node attachment
    pub attachment: AttachmentConfig,
    /// Cloud requests
    pub cloud: CloudConfig,
    /// Caller relay
    pub relay: RelayConfig,
    /// Credentials
    pub token: TokenConfig,
}

impl AnchorSyncConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load_from_file(path: &Path) -> AnchorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AnchorError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| AnchorError::config(format!("Invalid JSON: {e}"))),
            other => Err(AnchorError::config(format!(
                "Unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Parse TOML
    pub fn from_toml_str(content: &str) -> AnchorResult<Self> {
        toml::from_str(content).map_err(|e| AnchorError::config(format!("Invalid TOML: {e}")))
    }

    /// Apply `ANCHOR_SYNC_*` overrides from the process environment
    pub fn merge_with_env(&mut self) -> AnchorResult<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs. Names without the prefix
    /// are ignored.
    pub fn merge_with_vars<I>(&mut self, vars: I) -> AnchorResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = rest.to_lowercase().replace("__", ".");
            self.set_from_string(&key, &value)?;
            tracing::debug!(key = %key, "Config override from environment");
        }
        Ok(())
    }

    /// Set one value by dotted key, e.g. `cloud.max_ttl_days`
    pub fn set_from_string(&mut self, key: &str, value: &str) -> AnchorResult<()> {
        match key {
            "attachment.timeout_ms" => self.attachment.timeout_ms = parse(key, value)?,
            "cloud.default_ttl_days" => self.cloud.default_ttl_days = parse_optional(key, value)?,
            "cloud.max_ttl_days" => self.cloud.max_ttl_days = parse(key, value)?,
            "cloud.max_pending_requests" => self.cloud.max_pending_requests = parse(key, value)?,
            "cloud.retry_on_unauthorized" => self.cloud.retry_on_unauthorized = parse(key, value)?,
            "cloud.result_timeout_ms" => self.cloud.result_timeout_ms = parse_optional(key, value)?,
            "relay.acknowledgment_timeout_ms" => {
                self.relay.acknowledgment_timeout_ms = parse(key, value)?
            }
            "token.refresh_margin_secs" => self.token.refresh_margin_secs = parse(key, value)?,
            "token.lifetime_secs" => self.token.lifetime_secs = parse(key, value)?,
            "token.audience" => self.token.audience = value.to_string(),
            "token.key_path" => {
                self.token.key_path = (!value.is_empty()).then(|| PathBuf::from(value))
            }
            other => return Err(AnchorError::config(format!("Unknown config key '{other}'"))),
        }
        Ok(())
    }

    /// Check ranges and relationships between settings
    pub fn validate(&self) -> AnchorResult<()> {
        if self.attachment.timeout_ms == 0 {
            return Err(AnchorError::config("attachment.timeout_ms must be positive"));
        }
        if self.cloud.max_ttl_days == 0 {
            return Err(AnchorError::config("cloud.max_ttl_days must be positive"));
        }
        if let Some(ttl) = self.cloud.default_ttl_days {
            if ttl == 0 || ttl > self.cloud.max_ttl_days {
                return Err(AnchorError::config(format!(
                    "cloud.default_ttl_days {ttl} outside 1..={}",
                    self.cloud.max_ttl_days
                )));
            }
        }
        if self.cloud.max_pending_requests == 0 {
            return Err(AnchorError::config("cloud.max_pending_requests must be positive"));
        }
        if self.cloud.result_timeout_ms == Some(0) {
            return Err(AnchorError::config("cloud.result_timeout_ms must be positive"));
        }
        if self.relay.acknowledgment_timeout_ms == 0 {
            return Err(AnchorError::config(
                "relay.acknowledgment_timeout_ms must be positive",
            ));
        }
        if self.token.lifetime_secs <= self.token.refresh_margin_secs {
            return Err(AnchorError::config(
                "token.lifetime_secs must exceed token.refresh_margin_secs",
            ));
        }
        Ok(())
    }

    /// Node attachment bound
    pub fn attachment_timeout(&self) -> Duration {
        Duration::from_millis(self.attachment.timeout_ms)
    }

    /// Registration acknowledgment bound
    pub fn acknowledgment_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.acknowledgment_timeout_ms)
    }

    /// Optional cloud outcome bound
    pub fn result_timeout(&self) -> Option<Duration> {
        self.cloud.result_timeout_ms.map(Duration::from_millis)
    }

    /// Token refresh margin
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token.refresh_margin_secs)
    }

    /// Signed token lifetime
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token.lifetime_secs)
    }

    /// Policy for the cloud handler
    pub fn request_policy(&self) -> CloudRequestPolicy {
        CloudRequestPolicy {
            default_ttl_days: self.cloud.default_ttl_days,
            max_ttl_days: self.cloud.max_ttl_days,
            max_pending_requests: self.cloud.max_pending_requests,
            retry_on_unauthorized: self.cloud.retry_on_unauthorized,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> AnchorResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AnchorError::config(format!("Invalid value '{value}' for {key}")))
}

fn parse_optional<T: std::str::FromStr>(key: &str, value: &str) -> AnchorResult<Option<T>> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse(key, value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnchorSyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.attachment_timeout(), Duration::from_secs(2));
        assert_eq!(config.cloud.max_ttl_days, 365);
        assert_eq!(config.result_timeout(), None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AnchorSyncConfig::from_toml_str(
            r#"
            [cloud]
            default_ttl_days = 30
            result_timeout_ms = 10000

            [relay]
            acknowledgment_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.cloud.default_ttl_days, Some(30));
        assert_eq!(config.cloud.max_ttl_days, 365);
        assert_eq!(config.acknowledgment_timeout(), Duration::from_millis(250));
        assert_eq!(config.result_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.attachment, AttachmentConfig::default());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("anchors.toml");
        std::fs::write(&toml_path, "[attachment]\ntimeout_ms = 500\n").unwrap();
        let config = AnchorSyncConfig::load_from_file(&toml_path).unwrap();
        assert_eq!(config.attachment.timeout_ms, 500);

        let json_path = dir.path().join("anchors.json");
        std::fs::write(&json_path, r#"{"cloud":{"max_pending_requests":4}}"#).unwrap();
        let config = AnchorSyncConfig::load_from_file(&json_path).unwrap();
        assert_eq!(config.cloud.max_pending_requests, 4);

        let yaml_path = dir.path().join("anchors.yaml");
        std::fs::write(&yaml_path, "cloud: {}").unwrap();
        let err = AnchorSyncConfig::load_from_file(&yaml_path).unwrap_err();
        assert!(matches!(err, AnchorError::Config { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AnchorSyncConfig::default();
        config
            .merge_with_vars(vec![
                ("ANCHOR_SYNC_CLOUD__MAX_TTL_DAYS".to_string(), "30".to_string()),
                ("ANCHOR_SYNC_CLOUD__RETRY_ON_UNAUTHORIZED".to_string(), "false".to_string()),
                ("ANCHOR_SYNC_TOKEN__KEY_PATH".to_string(), "/tmp/key.json".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.cloud.max_ttl_days, 30);
        assert!(!config.cloud.retry_on_unauthorized);
        assert_eq!(config.token.key_path, Some(PathBuf::from("/tmp/key.json")));

        let err = config
            .merge_with_vars(vec![("ANCHOR_SYNC_CLOUD__MAX_TTL_DAYS".into(), "soon".into())])
            .unwrap_err();
        assert!(err.to_string().contains("cloud.max_ttl_days"));

        let err = config
            .merge_with_vars(vec![("ANCHOR_SYNC_NOPE".into(), "1".into())])
            .unwrap_err();
        assert!(matches!(err, AnchorError::Config { .. }));
    }

    #[test]
    fn test_validation_rejects_inconsistent_ttl() {
        let mut config = AnchorSyncConfig::default();
        config.cloud.max_ttl_days = 10;
        config.cloud.default_ttl_days = Some(30);
        assert!(config.validate().is_err());

        let mut config = AnchorSyncConfig::default();
        config.token.lifetime_secs = 30;
        assert!(config.validate().is_err());
    }
}
