//! # Configuration Management
//!
//! Centralized configuration for the transport core.
//!
//! This module provides structured configuration for the TCP and UDP
//! transports, TLS material, the socket scheduler, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`NETWORK_TRANSPORT_*`)
//!
//! ## Flow Control Defaults
//! - Outbound queue size is unbounded (`u32::MAX`) unless configured
//! - A threshold of 0 resolves to `max(queue_size / 2, 1)`

use crate::core::address::{NodeAddress, SockAddr};
use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default TCP listen port.
pub const DEFAULT_TCP_PORT: u16 = 5377;

/// Default UDP port.
pub const DEFAULT_UDP_PORT: u16 = 5378;

/// Hard cap on delivery threads per transport.
pub const MAX_DELIVERY_THREADS: usize = 8;

/// Default initial read buffer for incoming connections (1 MB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default largest accepted message payload (64 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Main transport configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    /// TCP transport configuration
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP transport configuration
    #[serde(default)]
    pub udp: UdpConfig,

    /// TLS material and verification policy
    #[serde(default)]
    pub tls: TlsConfig,

    /// Socket scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TransportConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| TransportError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            TransportError::ConfigError(format!("Failed to read config file: {e}"))
        })?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TransportError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Start with defaults
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NETWORK_TRANSPORT_TCP_ADDRESS") {
            config.tcp.address = addr;
        }

        if let Ok(addr) = std::env::var("NETWORK_TRANSPORT_UDP_ADDRESS") {
            config.udp.address = addr;
        }

        if let Ok(proxy) = std::env::var("NETWORK_TRANSPORT_PROXY") {
            config.tcp.proxy = proxy.clone();
            config.udp.proxy = proxy;
        }

        if let Ok(host) = std::env::var("NETWORK_TRANSPORT_FORWARD_HOST") {
            config.tcp.forward_host = host.clone();
            config.udp.forward_host = host;
        }

        if let Ok(offset) = std::env::var("NETWORK_TRANSPORT_PORT_OFFSET") {
            if let Ok(val) = offset.parse::<u16>() {
                config.tcp.port_offset = val;
                config.udp.port_offset = val;
            }
        }

        if let Ok(size) = std::env::var("NETWORK_TRANSPORT_QUEUE_SIZE") {
            if let Ok(val) = size.parse::<u32>() {
                config.tcp.queue_size = val;
            }
        }

        if let Ok(threshold) = std::env::var("NETWORK_TRANSPORT_THRESHOLD") {
            if let Ok(val) = threshold.parse::<u32>() {
                config.tcp.threshold = val;
            }
        }

        if let Ok(threads) = std::env::var("NETWORK_TRANSPORT_DELIVERY_THREADS") {
            if let Ok(val) = threads.parse::<usize>() {
                config.tcp.delivery_threads = val;
            }
        }

        if let Ok(max) = std::env::var("NETWORK_TRANSPORT_MAX_CONSECUTIVE_DELIVER") {
            if let Ok(val) = max.parse::<u32>() {
                config.tcp.max_consecutive_deliver = val;
            }
        }

        if let Ok(crypto) = std::env::var("NETWORK_TRANSPORT_CRYPTO") {
            config.tcp.crypto = match crypto.to_ascii_lowercase().as_str() {
                "tls" => CryptoMode::Tls,
                "none" | "" => CryptoMode::None,
                other => {
                    return Err(TransportError::ConfigError(format!(
                        "Invalid NETWORK_TRANSPORT_CRYPTO value: '{other}' (expected 'none' or 'tls')"
                    )))
                }
            };
        }

        if let Ok(token) = std::env::var("NETWORK_TRANSPORT_CONNECTION_TOKEN") {
            config.tcp.connection_token = token;
        }

        if let Ok(hosts) = std::env::var("NETWORK_TRANSPORT_NO_VERIFY_HOSTNAMES") {
            config.tls.apply_no_verify_hostnames(&hosts);
        }

        if let Ok(timeout) = std::env::var("NETWORK_TRANSPORT_SELECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.scheduler.select_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("NETWORK_TRANSPORT_LOG_LEVEL") {
            if let Ok(val) = level.parse::<Level>() {
                config.logging.log_level = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            TransportError::ConfigError(format!("Failed to serialize config: {e}"))
        })?;

        std::fs::write(path, content).map_err(|e| {
            TransportError::ConfigError(format!("Failed to write config file: {e}"))
        })?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.tcp.validate());
        errors.extend(self.udp.validate());

        if self.tcp.crypto == CryptoMode::Tls {
            errors.extend(self.tls.validate());
        }

        errors.extend(self.scheduler.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Transport-level encryption mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoMode {
    /// Plain TCP
    #[default]
    None,
    /// TLS over every connection
    Tls,
}

/// Parse an optional `ip:port` field; empty means absent.
fn parse_optional_addr(field: &str, value: &str) -> Result<Option<SockAddr>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<SockAddr>()
        .map(Some)
        .map_err(|_| TransportError::ConfigError(format!("Invalid {field}: '{value}'")))
}

/// Local node address from an `address` / `proxy` pair.
fn parse_node_address(address: &str, proxy: &str) -> Result<NodeAddress> {
    let local = address
        .parse::<SockAddr>()
        .map_err(|_| TransportError::ConfigError(format!("Invalid address: '{address}'")))?;
    let proxy = parse_optional_addr("proxy", proxy)?.unwrap_or_default();
    Ok(NodeAddress::new(local, proxy))
}

fn validate_addresses(section: &str, address: &str, proxy: &str, forward: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if address.is_empty() {
        errors.push(format!("{section} address cannot be empty"));
    } else if address.parse::<SockAddr>().is_err() {
        errors.push(format!(
            "Invalid {section} address format: '{address}' (expected format: '10.0.0.1:5377')"
        ));
    }

    if !proxy.is_empty() && proxy.parse::<SockAddr>().is_err() {
        errors.push(format!("Invalid {section} proxy address: '{proxy}'"));
    }

    if !forward.is_empty() && forward.parse::<SockAddr>().is_err() {
        errors.push(format!("Invalid {section} forward host: '{forward}'"));
    }

    errors
}

/// TCP transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Local address; its port is the listen port (0 = ephemeral)
    pub address: String,

    /// Proxy / NAT address advertised as part of the local identity
    pub proxy: String,

    /// Added to every dialed and bound port
    pub port_offset: u16,

    /// Bind the listener to `address` instead of 0.0.0.0
    pub bind_local_address: bool,

    /// Accept incoming connections. A node that does not listen and whose
    /// port is 0 is unroutable and is reached over NAT helper connections.
    pub listen: bool,

    /// Listen backlog
    pub backlog: u32,

    /// Outbound bytes per connection before `can_send` turns false
    pub queue_size: u32,

    /// Unsent bytes below which a full connection becomes sendable again (0 = queue_size / 2)
    pub threshold: u32,

    /// Route every message through this host ("ip:port")
    pub forward_host: String,

    /// Transport-level encryption
    pub crypto: CryptoMode,

    /// Report each unsent message on an outgoing connection error
    pub upcall_message_errors: bool,

    /// Disable Nagle on every connection
    pub set_nodelay: bool,

    /// Drop (instead of queueing) RTS sends when the queue is full
    pub reject_route_rts: bool,

    /// Messages delivered from one connection before yielding (0 = unlimited)
    pub max_consecutive_deliver: u32,

    /// Worker threads in the delivery pool
    pub delivery_threads: usize,

    /// Bandwidth statistics window
    #[serde(with = "duration_serde")]
    pub window_size: Duration,

    /// Initial read buffer per connection
    pub read_buffer_size: usize,

    /// Largest accepted payload; larger frames close the connection
    pub max_message_size: usize,

    /// Clear the destination proxy from outgoing headers
    pub strip_proxy: bool,

    /// Do not learn or apply address translations
    pub disable_translation: bool,

    /// Add a flow-logging pipeline stage
    pub flow_pipeline: bool,

    /// Add a Lamport logical clock pipeline stage
    pub logical_clock: bool,

    /// Token presented on every outgoing connection
    pub connection_token: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_TCP_PORT}"),
            proxy: String::new(),
            port_offset: 0,
            bind_local_address: false,
            listen: true,
            backlog: 128,
            queue_size: u32::MAX,
            threshold: 0,
            forward_host: String::new(),
            crypto: CryptoMode::None,
            upcall_message_errors: false,
            set_nodelay: false,
            reject_route_rts: false,
            max_consecutive_deliver: 100,
            delivery_threads: MAX_DELIVERY_THREADS,
            window_size: Duration::from_millis(5000),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            strip_proxy: false,
            disable_translation: false,
            flow_pipeline: false,
            logical_clock: false,
            connection_token: String::new(),
        }
    }
}

impl TcpConfig {
    /// The local node address.
    pub fn local_address(&self) -> Result<NodeAddress> {
        parse_node_address(&self.address, &self.proxy)
    }

    /// The configured forwarding host, if any.
    pub fn forward_address(&self) -> Result<Option<SockAddr>> {
        parse_optional_addr("forward host", &self.forward_host)
    }

    /// Threshold with the default applied.
    pub fn effective_threshold(&self) -> u32 {
        if self.threshold == 0 {
            (self.queue_size / 2).max(1)
        } else {
            self.threshold
        }
    }

    /// Delivery thread count clamped to `1..=MAX_DELIVERY_THREADS`.
    pub fn effective_delivery_threads(&self) -> usize {
        self.delivery_threads.clamp(1, MAX_DELIVERY_THREADS)
    }

    /// Validate TCP configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = validate_addresses("TCP", &self.address, &self.proxy, &self.forward_host);

        if self.queue_size == 0 {
            errors.push("Queue size must be greater than 0".to_string());
        }

        if self.threshold > self.queue_size {
            errors.push(format!(
                "Threshold {} cannot exceed queue size {}",
                self.threshold, self.queue_size
            ));
        }

        if self.backlog == 0 {
            errors.push("Listen backlog must be greater than 0".to_string());
        }

        if self.delivery_threads == 0 {
            errors.push("Delivery threads must be greater than 0".to_string());
        } else if self.delivery_threads > MAX_DELIVERY_THREADS {
            errors.push(format!(
                "Too many delivery threads: {} (maximum: {MAX_DELIVERY_THREADS})",
                self.delivery_threads
            ));
        }

        if self.read_buffer_size < 1024 {
            errors.push("Read buffer size too small (minimum: 1 KB)".to_string());
        }

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > u32::MAX as usize {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum: {})",
                self.max_message_size,
                u32::MAX
            ));
        }

        if self.window_size.is_zero() {
            errors.push("Statistics window cannot be 0".to_string());
        }

        errors
    }
}

/// UDP transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local address; its port is the bound port (0 = ephemeral)
    pub address: String,

    /// Proxy / NAT address advertised as part of the local identity
    pub proxy: String,

    /// Added to every destination and bound port
    pub port_offset: u16,

    /// Bind to `address` instead of 0.0.0.0
    pub bind_local_address: bool,

    /// Route every datagram through this host ("ip:port")
    pub forward_host: String,

    /// Do not learn or apply address translations
    pub disable_translation: bool,

    /// Worker threads in the delivery pool
    pub delivery_threads: usize,

    /// Add a flow-logging pipeline stage
    pub flow_pipeline: bool,

    /// Add a Lamport logical clock pipeline stage
    pub logical_clock: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_UDP_PORT}"),
            proxy: String::new(),
            port_offset: 0,
            bind_local_address: false,
            forward_host: String::new(),
            disable_translation: false,
            delivery_threads: 1,
            flow_pipeline: false,
            logical_clock: false,
        }
    }
}

impl UdpConfig {
    /// The local node address.
    pub fn local_address(&self) -> Result<NodeAddress> {
        parse_node_address(&self.address, &self.proxy)
    }

    /// The configured forwarding host, if any.
    pub fn forward_address(&self) -> Result<Option<SockAddr>> {
        parse_optional_addr("forward host", &self.forward_host)
    }

    /// Validate UDP configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = validate_addresses("UDP", &self.address, &self.proxy, &self.forward_host);

        if self.delivery_threads == 0 {
            errors.push("UDP delivery threads must be greater than 0".to_string());
        } else if self.delivery_threads > MAX_DELIVERY_THREADS {
            errors.push(format!(
                "Too many UDP delivery threads: {} (maximum: {MAX_DELIVERY_THREADS})",
                self.delivery_threads
            ));
        }

        errors
    }
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented to peers
    pub cert_path: String,

    /// PEM PKCS#8 private key
    pub key_path: String,

    /// PEM CA bundle used to verify peers
    pub ca_path: String,

    /// Check the peer certificate's common name against its address
    pub verify_hostnames: bool,

    /// Hosts exempt from the common-name check
    pub no_verify_hostnames: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: String::new(),
            key_path: String::new(),
            ca_path: String::new(),
            verify_hostnames: true,
            no_verify_hostnames: Vec::new(),
        }
    }
}

impl TlsConfig {
    /// Apply a `NO_VERIFY_HOSTNAMES` value: a boolean, or a space-separated host list.
    pub fn apply_no_verify_hostnames(&mut self, value: &str) {
        match value.trim().parse::<bool>() {
            Ok(true) => self.verify_hostnames = false,
            Ok(false) => {}
            Err(_) => {
                self.no_verify_hostnames = value
                    .split_whitespace()
                    .map(|h| h.to_lowercase())
                    .collect();
            }
        }
    }

    /// Whether the common-name check is skipped for `host`.
    pub fn hostname_exempt(&self, host: &str) -> bool {
        !self.verify_hostnames
            || self
                .no_verify_hostnames
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host))
    }

    /// Validate TLS configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, path) in [
            ("certificate", &self.cert_path),
            ("private key", &self.key_path),
            ("CA", &self.ca_path),
        ] {
            if path.is_empty() {
                errors.push(format!("TLS {name} path must be specified when crypto = \"tls\""));
            } else if !Path::new(path).exists() {
                errors.push(format!("TLS {name} file does not exist: {path}"));
            }
        }

        errors
    }
}

/// Socket scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest single wait for readiness
    #[serde(with = "duration_serde")]
    pub select_timeout: Duration,

    /// Coalescing delay for small signals
    #[serde(with = "duration_serde")]
    pub max_timer_wait: Duration,

    /// Accumulated signal bytes that force an immediate wake
    pub timer_threshold: usize,

    /// Loop iterations between checks for stopped transports
    pub check_running_interval: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            select_timeout: Duration::from_millis(500),
            max_timer_wait: Duration::from_millis(1),
            timer_threshold: 32768,
            check_running_interval: 2,
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.select_timeout.as_millis() < 10 {
            errors.push("Select timeout too short (minimum: 10ms)".to_string());
        } else if self.select_timeout.as_secs() > 60 {
            errors.push("Select timeout too long (maximum: 60s)".to_string());
        }

        if self.max_timer_wait > self.select_timeout {
            errors.push("Max timer wait cannot exceed the select timeout".to_string());
        }

        if self.check_running_interval == 0 {
            errors.push("Check running interval must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("network-transport"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
