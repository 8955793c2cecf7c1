use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::net::connector::{DEFAULT_INITIAL_RETRY_DELAY, DEFAULT_MAX_RETRY_DELAY};

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// How a server picks the I/O loop for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopDistribution {
    #[default]
    RoundRobin,
    /// Same peer IP, same loop.
    PeerHash,
}

/// Configuration for TCP server.
///
/// Use `TcpServerConfig::builder()` for ergonomic construction.
///
/// ## Threads
///
/// - io_threads: number of I/O loops; 0 serves every connection on the base loop
/// - distribution: round-robin or peer-IP affinity across the I/O loops
///
/// ## Socket Options
///
/// - reuse_port: SO_REUSEPORT on the listening socket
/// - no_delay: disables Nagle's algorithm on accepted connections
/// - keep_alive: SO_KEEPALIVE on accepted connections (default on)
///
/// ## Resource Limits
///
/// - high_water_mark: queued output size that triggers backpressure
/// - max_connections: hard limit on concurrent connections (None for unlimited)
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Prefix of connection names and I/O thread names
    pub name: String,
    /// Address to bind to
    pub address: SocketAddr,
    /// Enable SO_REUSEPORT
    pub reuse_port: bool,
    /// Number of I/O threads
    pub io_threads: usize,
    /// Loop selection policy
    pub distribution: LoopDistribution,
    /// Per-connection high-water mark in bytes
    pub high_water_mark: usize,
    /// Maximum number of connections
    pub max_connections: Option<usize>,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// Enable SO_KEEPALIVE
    pub keep_alive: bool,
}

impl TcpServerConfig {
    /// Create a new builder for TcpServerConfig
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("server name must not be empty".into()));
        }
        if self.high_water_mark == 0 {
            return Err(Error::Configuration("high water mark must be positive".into()));
        }
        if self.max_connections == Some(0) {
            return Err(Error::Configuration("max connections must be positive".into()));
        }
        Ok(())
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            name: "TcpServer".to_owned(),
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            reuse_port: false,
            io_threads: 0,
            distribution: LoopDistribution::RoundRobin,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_connections: None,
            no_delay: false,
            keep_alive: true,
        }
    }
}

/// Builder for TcpServerConfig.
///
/// All fields are optional and will use defaults from TcpServerConfig::default()
/// if not explicitly set.
#[derive(Default)]
pub struct TcpServerConfigBuilder {
    name: Option<String>,
    address: Option<SocketAddr>,
    reuse_port: Option<bool>,
    io_threads: Option<usize>,
    distribution: Option<LoopDistribution>,
    high_water_mark: Option<usize>,
    max_connections: Option<usize>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
}

impl TcpServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    /// Set the number of I/O threads
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = Some(threads);
        self
    }

    pub fn distribution(mut self, distribution: LoopDistribution) -> Self {
        self.distribution = Some(distribution);
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = Some(bytes);
        self
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Enable or disable SO_KEEPALIVE
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    /// Build the TcpServerConfig
    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            name: self.name.unwrap_or(default.name),
            address: self.address.unwrap_or(default.address),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            io_threads: self.io_threads.unwrap_or(default.io_threads),
            distribution: self.distribution.unwrap_or(default.distribution),
            high_water_mark: self.high_water_mark.unwrap_or(default.high_water_mark),
            max_connections: self.max_connections.or(default.max_connections),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
        }
    }
}

/// Configuration for TCP client.
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// Prefix of connection names
    pub name: String,
    /// Address to connect to
    pub server_addr: SocketAddr,
    /// Reconnect after an established connection goes down
    pub retry: bool,
    /// First reconnect delay
    pub initial_retry_delay: Duration,
    /// Reconnect delay ceiling
    pub max_retry_delay: Duration,
    /// Per-connection high-water mark in bytes
    pub high_water_mark: usize,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
}

impl TcpClientConfig {
    pub fn builder() -> TcpClientConfigBuilder {
        TcpClientConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("client name must not be empty".into()));
        }
        if self.initial_retry_delay.is_zero() {
            return Err(Error::Configuration("initial retry delay must be positive".into()));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(Error::Configuration(format!(
                "initial retry delay {:?} exceeds maximum {:?}",
                self.initial_retry_delay, self.max_retry_delay
            )));
        }
        if self.high_water_mark == 0 {
            return Err(Error::Configuration("high water mark must be positive".into()));
        }
        Ok(())
    }
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            name: "TcpClient".to_owned(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            retry: false,
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            no_delay: false,
        }
    }
}

#[derive(Default)]
pub struct TcpClientConfigBuilder {
    name: Option<String>,
    server_addr: Option<SocketAddr>,
    retry: Option<bool>,
    initial_retry_delay: Option<Duration>,
    max_retry_delay: Option<Duration>,
    high_water_mark: Option<usize>,
    no_delay: Option<bool>,
}

impl TcpClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = Some(addr);
        self
    }

    pub fn retry(mut self, enabled: bool) -> Self {
        self.retry = Some(enabled);
        self
    }

    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = Some(delay);
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = Some(delay);
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = Some(bytes);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn build(self) -> TcpClientConfig {
        let default = TcpClientConfig::default();
        TcpClientConfig {
            name: self.name.unwrap_or(default.name),
            server_addr: self.server_addr.unwrap_or(default.server_addr),
            retry: self.retry.unwrap_or(default.retry),
            initial_retry_delay: self.initial_retry_delay.unwrap_or(default.initial_retry_delay),
            max_retry_delay: self.max_retry_delay.unwrap_or(default.max_retry_delay),
            high_water_mark: self.high_water_mark.unwrap_or(default.high_water_mark),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_builder_defaults() {
        let config = TcpServerConfig::builder()
            .name("echo")
            .io_threads(2)
            .max_connections(10)
            .build();
        assert_eq!(config.name, "echo");
        assert_eq!(config.io_threads, 2);
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.high_water_mark, DEFAULT_HIGH_WATER_MARK);
        assert_eq!(config.distribution, LoopDistribution::RoundRobin);
        assert!(config.keep_alive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_validation() {
        let config = TcpServerConfig::builder().name("").build();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        let config = TcpServerConfig::builder().high_water_mark(0).build();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_client_validation() {
        let config = TcpClientConfig::builder()
            .initial_retry_delay(Duration::from_secs(5))
            .max_retry_delay(Duration::from_secs(1))
            .build();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = TcpClientConfig::builder().retry(true).build();
        assert!(config.retry);
        assert_eq!(config.initial_retry_delay, DEFAULT_INITIAL_RETRY_DELAY);
        assert!(config.validate().is_ok());
    }
}
