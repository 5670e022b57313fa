//! Rate limit policies and their configuration.
//!
//! A policy is a named `(refill interval, burst)` pair attached to one
//! protected operation. Rules are plain serde data as read from
//! configuration; they become [`Policy`] values only after validation, so
//! an invalid policy is rejected at load time rather than per request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{GateError, Result};

/// A validated rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: Arc<str>,
    refill_interval: Duration,
    burst: u32,
}

impl Policy {
    /// Create a policy, rejecting a zero burst or a zero refill interval.
    pub fn new(name: impl Into<Arc<str>>, refill_interval: Duration, burst: u32) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(GateError::Policy("policy name must not be empty".to_string()));
        }
        // Names double as URL path segments
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(GateError::Policy(format!(
                "policy '{}': name may only contain ASCII letters, digits, '_', '-' and '.'",
                name
            )));
        }
        if burst < 1 {
            return Err(GateError::Policy(format!(
                "policy '{}': burst must be at least 1",
                name
            )));
        }
        if refill_interval.is_zero() {
            return Err(GateError::Policy(format!(
                "policy '{}': refill interval must be greater than zero",
                name
            )));
        }

        Ok(Self {
            name,
            refill_interval,
            burst,
        })
    }

    /// The policy name, unique within a [`PolicySet`].
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Time for an empty bucket to refill completely.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }
}

/// A rate limit rule as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Full refill interval in milliseconds
    pub refill_interval_ms: u64,
    /// Bucket capacity
    pub burst: u32,
}

impl PolicyRule {
    pub fn new(refill_interval: Duration, burst: u32) -> Self {
        Self {
            refill_interval_ms: refill_interval.as_millis() as u64,
            burst,
        }
    }

    /// Validate this rule into a named policy.
    pub fn to_policy(&self, name: &str) -> Result<Policy> {
        Policy::new(name, Duration::from_millis(self.refill_interval_ms), self.burst)
    }
}

/// Shape of a standalone rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    policies: BTreeMap<String, PolicyRule>,
}

/// The rules guarding the short link API, one per protected operation.
pub fn default_rules() -> BTreeMap<String, PolicyRule> {
    [
        ("login", 10, 3),
        ("list_links", 2, 5),
        ("create_link", 3, 3),
        ("get_link", 1, 5),
        ("edit_link", 2, 3),
        ("delete_link", 2, 5),
    ]
    .into_iter()
    .map(|(name, secs, burst)| {
        (
            name.to_string(),
            PolicyRule::new(Duration::from_secs(secs), burst),
        )
    })
    .collect()
}

/// A set of validated policies indexed by name.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: BTreeMap<String, Policy>,
}

impl PolicySet {
    /// Validate every rule. Fails on the first invalid one.
    pub fn from_rules(rules: &BTreeMap<String, PolicyRule>) -> Result<Self> {
        let policies = rules
            .iter()
            .map(|(name, rule)| rule.to_policy(name).map(|p| (name.clone(), p)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self { policies })
    }

    /// Load policies from a YAML rules file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string with a top-level `policies` map.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        Self::from_rules(&file.policies)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
