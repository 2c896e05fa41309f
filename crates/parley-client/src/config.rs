//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::{ClientError, Result};

/// Complete client configuration, TOML-loadable.
///
/// The replay window is strict `>` and deliberately not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Whether outbound payloads are sealed when a session exists.
    #[serde(default = "default_true")]
    pub encryption_enabled: bool,
    /// TTL for an in-flight key exchange.
    #[serde(default = "default_key_exchange_timeout")]
    pub key_exchange_timeout_secs: u32,
    /// How long the group engine waits for wrapped-key acks.
    #[serde(default = "default_group_ack_timeout")]
    pub group_ack_timeout_secs: u32,
    /// Sequence-counter value that triggers a rekey recommendation.
    #[serde(default = "default_rekey_threshold")]
    pub rekey_threshold: u64,
    /// Lifetime of an outbound contact request.
    #[serde(default = "default_contact_request_ttl")]
    pub contact_request_ttl_secs: u64,
    /// Interval of the pending-state sweepers.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u32,
    /// Retry budget for recoverable key-exchange failures.
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u8,
    /// TTL of a command awaiting acknowledgment.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            key_exchange_timeout_secs: default_key_exchange_timeout(),
            group_ack_timeout_secs: default_group_ack_timeout(),
            rekey_threshold: default_rekey_threshold(),
            contact_request_ttl_secs: default_contact_request_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_retry_attempts: default_max_retries(),
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] on malformed TOML.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_key_exchange_timeout() -> u32 {
    parley_types::KEY_EXCHANGE_TIMEOUT_SECS
}

fn default_group_ack_timeout() -> u32 {
    parley_types::GROUP_ACK_TIMEOUT_SECS
}

fn default_rekey_threshold() -> u64 {
    parley_types::REKEY_THRESHOLD
}

fn default_contact_request_ttl() -> u64 {
    parley_types::CONTACT_REQUEST_TTL_SECS
}

fn default_cleanup_interval() -> u32 {
    parley_types::CLEANUP_INTERVAL_SECS
}

fn default_max_retries() -> u8 {
    parley_types::MAX_RETRY_ATTEMPTS
}

fn default_ack_timeout() -> u32 {
    15
}
