//! Relay configuration.

use serde::{Deserialize, Serialize};

use crate::{Result, ServerError};

/// Relay configuration, TOML-loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Lifetime of a tracked contact request, in seconds.
    #[serde(default = "default_contact_request_ttl")]
    pub contact_request_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            contact_request_ttl_secs: default_contact_request_ttl(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] on malformed TOML.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }
}

// Default value functions

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", parley_types::DEFAULT_PORT)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_contact_request_ttl() -> u64 {
    parley_types::CONTACT_REQUEST_TTL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:1666");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config = ServerConfig::from_toml("listen_addr = \"127.0.0.1:0\"").expect("parse");
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert_eq!(config.log_level, "info");
    }
}
