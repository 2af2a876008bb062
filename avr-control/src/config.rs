//! Configuration types for the receiver session
//!
//! This module defines the knobs controlling how a session finds its
//! receiver, how long it waits for responses, and how aggressively it
//! reconnects.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{AvrError, Result};

/// Default telnet control port of the receiver
pub const DEFAULT_PORT: u16 = 23;

/// How the session learns the receiver's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Listen for AMX beacons on the local network
    Beacon,
    /// Resolve a known hostname once
    Hostname(String),
    /// Use a fixed address
    Static(IpAddr),
    /// Addresses are fed in by the caller through `AvrSession::discovered`
    Manual,
}

/// Configuration for an `AvrSession`
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Only adopt devices advertising this model
    /// Default: None (any model)
    pub model: Option<String>,

    /// Address source
    /// Default: Beacon
    pub discovery: DiscoveryMode,

    /// TCP control port
    /// Default: 23
    pub port: u16,

    /// Time to wait for a command's matching response
    /// Default: 3 seconds
    pub command_timeout: Duration,

    /// Attempts per command before it fails with a timeout
    /// Default: 3
    pub retry_count: u32,

    /// Pause before a timed-out command is re-sent
    /// Default: 500 milliseconds
    pub retry_interval: Duration,

    /// Initial reconnect delay, restored after every successful connect
    /// Default: 1 second
    pub reconnect_floor: Duration,

    /// Upper bound for the doubling reconnect delay
    /// Default: 60 seconds
    pub reconnect_ceiling: Duration,

    /// Time allowed for a single TCP connect
    /// Default: 5 seconds
    pub connect_timeout: Duration,

    /// Spacing between the state probes written after connecting
    /// Default: 300 milliseconds
    pub probe_interval: Duration,

    /// Delay before querying properties the probes did not cover
    /// Default: 2 seconds
    pub collect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: None,
            discovery: DiscoveryMode::Beacon,
            port: DEFAULT_PORT,
            command_timeout: Duration::from_secs(3),
            retry_count: 3,
            retry_interval: Duration::from_millis(500),
            reconnect_floor: Duration::from_secs(1),
            reconnect_ceiling: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(300),
            collect_delay: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    /// Create a new SessionConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a SessionConfig that resolves `hostname` instead of listening
    /// for beacons
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            discovery: DiscoveryMode::Hostname(hostname.into()),
            ..Default::default()
        }
    }

    /// Create a SessionConfig bound to a fixed receiver address
    pub fn static_address(address: IpAddr) -> Self {
        Self {
            discovery: DiscoveryMode::Static(address),
            ..Default::default()
        }
    }

    /// Create a SessionConfig tuned for receivers on a busy or slow network
    pub fn patient() -> Self {
        Self {
            command_timeout: Duration::from_secs(6),
            retry_count: 5,
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Overlay settings from environment variables
    ///
    /// - `AVR_MODEL`: model filter
    /// - `AVR_ADDRESS`: fixed address (takes precedence over `AVR_HOSTNAME`)
    /// - `AVR_HOSTNAME`: hostname to resolve
    /// - `AVR_PORT`: control port
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(model) = std::env::var("AVR_MODEL") {
            config.model = Some(model);
        }

        if let Ok(address) = std::env::var("AVR_ADDRESS") {
            let address = address
                .parse()
                .map_err(|_| AvrError::Config(format!("Invalid AVR_ADDRESS: {}", address)))?;
            config.discovery = DiscoveryMode::Static(address);
        } else if let Ok(hostname) = std::env::var("AVR_HOSTNAME") {
            config.discovery = DiscoveryMode::Hostname(hostname);
        }

        if let Ok(port) = std::env::var("AVR_PORT") {
            config.port = port
                .parse()
                .map_err(|_| AvrError::Config(format!("Invalid AVR_PORT: {}", port)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(AvrError::Config("Port must be greater than 0".to_string()));
        }

        if self.command_timeout == Duration::ZERO {
            return Err(AvrError::Config(
                "Command timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry_count == 0 {
            return Err(AvrError::Config(
                "Retry count must be at least 1".to_string(),
            ));
        }

        if self.reconnect_floor == Duration::ZERO {
            return Err(AvrError::Config(
                "Reconnect floor must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_floor > self.reconnect_ceiling {
            return Err(AvrError::Config(
                "Invalid reconnect interval: floor must not exceed ceiling".to_string(),
            ));
        }

        if let DiscoveryMode::Hostname(hostname) = &self.discovery {
            if hostname.is_empty() {
                return Err(AvrError::Config("Hostname must not be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryMode) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, count: u32, interval: Duration) -> Self {
        self.retry_count = count;
        self.retry_interval = interval;
        self
    }

    pub fn with_reconnect_interval(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.reconnect_floor = floor;
        self.reconnect_ceiling = ceiling;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_probe_timing(mut self, probe_interval: Duration, collect_delay: Duration) -> Self {
        self.probe_interval = probe_interval;
        self.collect_delay = collect_delay;
        self
    }
}
