//! Relay server configuration.

use pairlink_pairing::PairingConfig;
use pairlink_room::RelayLimits;
use serde::{Deserialize, Serialize};

use crate::PairlinkError;

/// Environment variable holding the listen address.
pub const ENV_BIND: &str = "PAIRLINK_BIND";

/// Environment variable that turns on device-token admission.
pub const ENV_REQUIRE_DEVICE_TOKEN: &str = "PAIRLINK_REQUIRE_DEVICE_TOKEN";

/// Environment variable holding the CORS origin for the pairing endpoints.
pub const ENV_ALLOWED_ORIGINS: &str = "PAIRLINK_ALLOWED_ORIGINS";

/// Everything the relay server needs besides its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, `host:port`.
    pub bind_addr: String,

    /// Per-room relay limits.
    pub limits: RelayLimits,

    /// When set, `/ws` requires a `token` naming a registered device.
    pub require_device_token: bool,

    /// Pairing code lifetimes and allocation attempts.
    pub pairing: PairingConfig,

    /// `Access-Control-Allow-Origin` sent with pairing endpoint responses.
    pub allowed_origins: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            limits: RelayLimits::default(),
            require_device_token: false,
            pairing: PairingConfig::default(),
            allowed_origins: "*".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PAIRLINK_BIND`,
    /// `PAIRLINK_REQUIRE_DEVICE_TOKEN` and `PAIRLINK_ALLOWED_ORIGINS`.
    pub fn from_env() -> Result<Self, PairlinkError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PairlinkError> {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND).filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }
        if let Some(flag) = lookup(ENV_REQUIRE_DEVICE_TOKEN) {
            config.require_device_token = parse_flag(&flag).ok_or_else(|| {
                PairlinkError::Config(format!("{ENV_REQUIRE_DEVICE_TOKEN}={flag} is not a boolean"))
            })?;
        }
        if let Some(origins) = lookup(ENV_ALLOWED_ORIGINS).filter(|o| !o.trim().is_empty()) {
            config.allowed_origins = origins.trim().to_string();
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert!(!config.require_device_token);
    }

    #[test]
    fn test_from_lookup_overrides_bind_and_flag() {
        let config = ServerConfig::from_lookup(lookup(&[
            (ENV_BIND, "0.0.0.0:9000"),
            (ENV_REQUIRE_DEVICE_TOKEN, "TRUE"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert!(config.require_device_token);
        assert_eq!(config.allowed_origins, "*");
    }

    #[test]
    fn test_from_lookup_allowed_origins() {
        let config =
            ServerConfig::from_lookup(lookup(&[(ENV_ALLOWED_ORIGINS, " https://app.example ")]))
                .unwrap();
        assert_eq!(config.allowed_origins, "https://app.example");
    }

    #[test]
    fn test_from_lookup_bad_flag_is_config_error() {
        let err = ServerConfig::from_lookup(lookup(&[(ENV_REQUIRE_DEVICE_TOKEN, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, PairlinkError::Config(_)));
    }

    #[test]
    fn test_parse_flag_variants() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("2"), None);
    }
}
