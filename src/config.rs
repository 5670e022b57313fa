//! Configuration management for slms-gate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::ratelimit::{default_rules, PolicyRule, PolicySet};

/// Prefix of environment variables overriding file configuration,
/// e.g. `SLMS_GATE__SERVER__ADDR=0.0.0.0:8080`.
pub const ENV_PREFIX: &str = "SLMS_GATE";

/// Main configuration for the slms-gate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,

    /// Request header carrying the client identity when running behind a
    /// trusted proxy. The peer address is used when unset.
    #[serde(default)]
    pub identity_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            identity_header: None,
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Idle time in seconds after which a client's bucket is forgotten
    #[serde(default = "default_entry_lifetime")]
    pub entry_lifetime_secs: u64,

    /// Interval in seconds between sweeps of idle buckets
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Path to a rules file; replaces `policies` when set
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline policies keyed by name
    #[serde(default = "default_rules")]
    pub policies: BTreeMap<String, PolicyRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            entry_lifetime_secs: default_entry_lifetime(),
            cleanup_interval_secs: default_cleanup_interval(),
            rules_path: None,
            policies: default_rules(),
        }
    }
}

fn default_entry_lifetime() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    900
}

impl RateLimitingConfig {
    pub fn entry_lifetime(&self) -> Duration {
        Duration::from_secs(self.entry_lifetime_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Build the validated policy set, from `rules_path` if configured.
    pub fn policy_set(&self) -> Result<PolicySet> {
        match &self.rules_path {
            Some(path) => PolicySet::from_file(path),
            None => PolicySet::from_rules(&self.policies),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.entry_lifetime_secs == 0 {
            return Err(GateError::Config(
                "rate_limiting.entry_lifetime_secs must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(GateError::Config(
                "rate_limiting.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyOverlay {
    #[serde(default)]
    rate_limiting: PolicySection,
}

#[derive(Debug, Default, Deserialize)]
struct PolicySection {
    #[serde(default)]
    policies: Option<BTreeMap<String, PolicyRule>>,
}

/// The `rate_limiting.policies` map of a config file, read without key
/// normalization.
fn file_policies_from_yaml(yaml: &str) -> Result<Option<BTreeMap<String, PolicyRule>>> {
    let overlay: Option<PolicyOverlay> =
        serde_yaml::from_str(yaml).map_err(|e| GateError::Config(e.to_string()))?;
    Ok(overlay.and_then(|o| o.rate_limiting.policies))
}

impl GateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig =
            serde_yaml::from_str(yaml).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under
    /// `SLMS_GATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, ::config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with(path: Option<&Path>, environment: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        let mut file_policies = None;

        if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                GateError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            builder = builder.add_source(::config::File::from_str(
                &contents,
                ::config::FileFormat::Yaml,
            ));
            file_policies = file_policies_from_yaml(&contents)?;
        }

        let mut config: GateConfig = builder
            .add_source(environment.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        // `config` lowercases map keys; policy names are route segments and
        // must keep the case they were written with.
        if let Some(policies) = file_policies {
            config.rate_limiting.policies = policies;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();

        assert_eq!(config.server.addr, "127.0.0.1:8080".parse().unwrap());
        assert!(config.server.identity_header.is_none());
        assert_eq!(config.rate_limiting.entry_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.rate_limiting.cleanup_interval(), Duration::from_secs(900));
        assert_eq!(config.rate_limiting.policies.len(), 6);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  addr: 0.0.0.0:9000
  identity_header: X-Real-IP
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.server.identity_header.as_deref(), Some("X-Real-IP"));
        assert_eq!(config.rate_limiting.entry_lifetime_secs, 3600);
        assert!(config.rate_limiting.policies.contains_key("login"));
    }

    #[test]
    fn test_parse_inline_policies() {
        let yaml = r#"
rate_limiting:
  entry_lifetime_secs: 600
  cleanup_interval_secs: 60
  policies:
    login:
      refill_interval_ms: 30000
      burst: 1
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();
        let policies = config.rate_limiting.policy_set().unwrap();

        assert_eq!(policies.len(), 1);
        let login = policies.get("login").unwrap();
        assert_eq!(login.refill_interval(), Duration::from_secs(30));
        assert_eq!(login.burst(), 1);
        assert_eq!(config.rate_limiting.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_policy_fails_fast() {
        let yaml = r#"
rate_limiting:
  policies:
    login:
      refill_interval_ms: 0
      burst: 3
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.rate_limiting.policy_set(),
            Err(GateError::Policy(_))
        ));
    }

    #[test]
    fn test_zero_cleanup_interval_rejected() {
        let yaml = r#"
rate_limiting:
  cleanup_interval_secs: 0
"#;
        assert!(matches!(
            GateConfig::from_yaml(yaml),
            Err(GateError::Config(_))
        ));
    }

    #[test]
    fn test_rules_path_overrides_inline_policies() {
        let path = std::env::temp_dir().join(format!(
            "slms-gate-config-rules-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "policies:\n  export:\n    refill_interval_ms: 5000\n    burst: 1\n",
        )
        .unwrap();

        let config = RateLimitingConfig {
            rules_path: Some(path.display().to_string()),
            ..Default::default()
        };
        let policies = config.policy_set().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(policies.len(), 1);
        assert!(policies.get("export").is_some());
        assert!(policies.get("login").is_none());
    }

    fn temp_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "slms-gate-{}-{}.yaml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn environment(vars: &[(&str, &str)]) -> ::config::Environment {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ::config::Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    #[test]
    fn test_load_layers_file_and_environment() {
        let path = temp_config(
            "layered",
            "server:\n  addr: 127.0.0.1:9100\nrate_limiting:\n  entry_lifetime_secs: 120\n",
        );

        let from_file = GateConfig::load_with(Some(&path), environment(&[])).unwrap();
        assert_eq!(from_file.server.addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(from_file.rate_limiting.entry_lifetime_secs, 120);
        assert_eq!(from_file.rate_limiting.cleanup_interval_secs, 900);
        assert_eq!(from_file.rate_limiting.policies.len(), 6);

        let layered = GateConfig::load_with(
            Some(&path),
            environment(&[("SLMS_GATE__RATE_LIMITING__CLEANUP_INTERVAL_SECS", "30")]),
        );
        std::fs::remove_file(&path).unwrap();

        let layered = layered.unwrap();
        assert_eq!(layered.rate_limiting.cleanup_interval_secs, 30);
        assert_eq!(layered.rate_limiting.entry_lifetime_secs, 120);
    }

    #[test]
    fn test_load_keeps_policy_name_case() {
        let path = temp_config(
            "mixed-case",
            "rate_limiting:\n  policies:\n    createLink:\n      refill_interval_ms: 3000\n      burst: 3\n",
        );

        let loaded = GateConfig::load_with(Some(&path), environment(&[]));
        let parsed = GateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let loaded = loaded.unwrap().rate_limiting.policy_set().unwrap();
        let parsed = parsed.unwrap().rate_limiting.policy_set().unwrap();

        let loaded_names: Vec<&str> = loaded.iter().map(|p| p.name()).collect();
        let parsed_names: Vec<&str> = parsed.iter().map(|p| p.name()).collect();
        assert_eq!(loaded_names, vec!["createLink"]);
        assert_eq!(loaded_names, parsed_names);
    }

    #[test]
    fn test_from_file() {
        let path = temp_config("from-file", "server:\n  identity_header: X-Real-IP\n");

        let config = GateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.server.identity_header.as_deref(), Some("X-Real-IP"));
        assert_eq!(config.rate_limiting.policies.len(), 6);
    }

    #[test]
    fn test_from_missing_file_fails() {
        assert!(matches!(
            GateConfig::from_file("/nonexistent/slms-gate.yaml"),
            Err(GateError::Io(_))
        ));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = GateConfig::load(Some(Path::new("/nonexistent/slms-gate.yaml")));
        assert!(matches!(result, Err(GateError::Config(_))));
    }
}
