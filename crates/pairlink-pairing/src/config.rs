//! Pairing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long codes live and how hard allocation tries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Lifetime of a code minted by [`create_room`](crate::PairingService::create_room).
    pub pairing_expiry: Duration,

    /// Lifetime of a code minted during device reconnection.
    pub reconnect_expiry: Duration,

    /// Fresh codes tried before allocation gives up.
    pub max_code_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            pairing_expiry: Duration::from_secs(30 * 60),
            reconnect_expiry: Duration::from_secs(240 * 60),
            max_code_attempts: 5,
        }
    }
}

impl PairingConfig {
    /// Raises zero values to usable minimums.
    pub fn validated(mut self) -> Self {
        if self.pairing_expiry.is_zero() {
            tracing::warn!("pairing_expiry of zero, using 1 minute");
            self.pairing_expiry = Duration::from_secs(60);
        }
        if self.reconnect_expiry.is_zero() {
            tracing::warn!("reconnect_expiry of zero, using 1 minute");
            self.reconnect_expiry = Duration::from_secs(60);
        }
        self.max_code_attempts = self.max_code_attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PairingConfig::default();
        assert_eq!(config.pairing_expiry, Duration::from_secs(1800));
        assert_eq!(config.reconnect_expiry, Duration::from_secs(14400));
        assert_eq!(config.max_code_attempts, 5);
    }

    #[test]
    fn test_validated_raises_zeroes() {
        let config = PairingConfig {
            pairing_expiry: Duration::ZERO,
            reconnect_expiry: Duration::ZERO,
            max_code_attempts: 0,
        }
        .validated();
        assert_eq!(config.pairing_expiry, Duration::from_secs(60));
        assert_eq!(config.reconnect_expiry, Duration::from_secs(60));
        assert_eq!(config.max_code_attempts, 1);
    }
}
