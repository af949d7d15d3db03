//! Core configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overlay core configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Display name announced in session handshakes
    pub display_name: String,

    /// Connecting sessions are force-closed past this age
    pub handshake_timeout: Duration,

    /// Plaintext send buffer capacity per session
    pub send_buffer_size: usize,

    /// Encrypt buffer capacity per session
    pub encrypt_buffer_size: usize,

    /// Receive buffer capacity per session
    pub recv_buffer_size: usize,

    /// Proxy relationships to keep while firewalled
    pub wanted_proxies: usize,

    /// Whether this overlay's operations declare restricted access;
    /// restricted traffic never crosses the shared lookup overlay
    pub restricted_operations: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            display_name: "weftnet-peer".to_string(),
            handshake_timeout: Duration::from_secs(10),
            send_buffer_size: 64 * 1024,
            encrypt_buffer_size: 64 * 1024,
            recv_buffer_size: 64 * 1024,
            wanted_proxies: 2,
            restricted_operations: false,
        }
    }
}

impl CoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.display_name.is_empty() {
            return Err("Display name must not be empty".into());
        }
        if self.display_name.len() > 255 {
            return Err("Display name exceeds 255 bytes".into());
        }
        if self.handshake_timeout.is_zero() {
            return Err("Handshake timeout must be positive".into());
        }
        if self.send_buffer_size < 1024 || self.encrypt_buffer_size < 1024 {
            return Err("Session buffers must hold at least 1 KiB".into());
        }
        if self.recv_buffer_size < 1024 {
            return Err("Receive buffer must hold at least 1 KiB".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_name() {
        let config = CoreConfig {
            display_name: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_buffers() {
        let config = CoreConfig {
            send_buffer_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
