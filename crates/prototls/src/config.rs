// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::framing::DEFAULT_MAX_MESSAGE_SIZE;
use crate::tls::SecurityContext;

/// Default maximum number of concurrent peers.
pub const DEFAULT_MAX_PEERS: usize = 1024;

/// Default handshake worker count.
pub const DEFAULT_HANDSHAKE_WORKERS: usize = 8;

/// Default readiness wait per reactor tick.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Construction-time settings for a [`Server`](crate::Server).
///
/// # Example
///
/// ```ignore
/// let config = ServerConfig::new(1234)
///     .with_max_peers(64)
///     .with_security(ctx);
/// ```
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen port (0 picks an ephemeral port)
    pub listen_port: u16,

    /// `listen(2)` backlog; `None` uses `max_peers`
    pub listen_backlog: Option<i32>,

    /// Live peers plus in-flight handshakes never exceed this
    pub max_peers: usize,

    /// Handshake worker threads (secured mode only)
    pub handshake_workers: usize,

    /// Upper bound on one readiness wait
    pub poll_interval: Duration,

    /// Largest accepted frame payload
    pub max_message_size: usize,

    /// TCP_NODELAY on accepted peers
    pub nodelay: bool,

    /// TLS credentials; `Some` enables transport security
    pub security: Option<Arc<SecurityContext>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            listen_backlog: None,
            max_peers: DEFAULT_MAX_PEERS,
            handshake_workers: DEFAULT_HANDSHAKE_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            nodelay: true,
            security: None,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            ..Self::default()
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = Some(backlog);
        self
    }

    pub fn with_handshake_workers(mut self, workers: usize) -> Self {
        self.handshake_workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Enable TLS with the given credentials.
    pub fn with_security(mut self, context: Arc<SecurityContext>) -> Self {
        self.security = Some(context);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.security.is_some()
    }

    /// Effective `listen(2)` backlog.
    pub fn backlog(&self) -> i32 {
        self.listen_backlog
            .unwrap_or_else(|| i32::try_from(self.max_peers).unwrap_or(i32::MAX))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::NoPeers);
        }
        if self.is_secure() && self.handshake_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::MessageSize(self.max_message_size));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::PollInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::SecurityConfig;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(1234);
        assert_eq!(config.listen_port, 1234);
        assert_eq!(config.max_peers, 1024);
        assert_eq!(config.handshake_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.backlog(), 1024);
        assert!(!config.is_secure());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let ctx = SecurityConfig::new().build().unwrap();
        let config = ServerConfig::new(0)
            .with_max_peers(2)
            .with_listen_backlog(16)
            .with_handshake_workers(3)
            .with_nodelay(false)
            .with_security(ctx);

        assert_eq!(config.backlog(), 16);
        assert_eq!(config.handshake_workers, 3);
        assert!(!config.nodelay);
        assert!(config.is_secure());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            ServerConfig::new(0).with_max_peers(0).validate(),
            Err(ConfigError::NoPeers)
        ));
        assert!(matches!(
            ServerConfig::new(0).with_max_message_size(0).validate(),
            Err(ConfigError::MessageSize(0))
        ));
        assert!(matches!(
            ServerConfig::new(0)
                .with_poll_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::PollInterval)
        ));

        // Worker count only matters in secured mode.
        assert!(ServerConfig::new(0)
            .with_handshake_workers(0)
            .validate()
            .is_ok());
        let ctx = SecurityConfig::new().build().unwrap();
        assert!(matches!(
            ServerConfig::new(0)
                .with_handshake_workers(0)
                .with_security(ctx)
                .validate(),
            Err(ConfigError::NoWorkers)
        ));
    }
}
