//! Limiter key generation and handling.

use std::sync::Arc;

use super::rules::Policy;

/// A key that uniquely identifies one client's bucket under one policy.
///
/// Including the policy name keeps the buckets of different protected
/// operations apart even when they are hit by the same client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The policy this bucket enforces
    pub policy: Arc<str>,
    /// The client identity, typically the remote IP address
    pub identity: String,
}

impl LimiterKey {
    /// Create a new limiter key for a client under a policy.
    pub fn new(policy: &Policy, identity: &str) -> Self {
        Self {
            policy: policy.shared_name(),
            identity: identity.to_string(),
        }
    }

    /// Convert the key to a string representation.
    ///
    /// This is useful for logging and debugging.
    pub fn to_string_key(&self) -> String {
        format!("{}|{}", self.policy, self.identity)
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(name: &str) -> Policy {
        Policy::new(name, Duration::from_secs(1), 1).unwrap()
    }

    #[test]
    fn test_limiter_key_creation() {
        let key = LimiterKey::new(&policy("login"), "10.0.0.1");

        assert_eq!(&*key.policy, "login");
        assert_eq!(key.identity, "10.0.0.1");
    }

    #[test]
    fn test_limiter_key_to_string() {
        let key = LimiterKey::new(&policy("get_link"), "::1");
        assert_eq!(key.to_string_key(), "get_link|::1");
        assert_eq!(key.to_string(), "get_link|::1");
    }

    #[test]
    fn test_limiter_key_equality() {
        let key1 = LimiterKey::new(&policy("login"), "10.0.0.1");
        let key2 = LimiterKey::new(&policy("login"), "10.0.0.1");
        let other_policy = LimiterKey::new(&policy("list_links"), "10.0.0.1");
        let other_client = LimiterKey::new(&policy("login"), "10.0.0.2");

        assert_eq!(key1, key2);
        assert_ne!(key1, other_policy);
        assert_ne!(key1, other_client);
    }
}
