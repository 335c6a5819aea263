//! Server-wide configuration.
//!
//! Settings are grouped by concern (network, runtime, engine, logging,
//! telemetry), each with serde defaults and a `validate()` that collects
//! every problem instead of stopping at the first.

pub mod loader;

pub use loader::load_config;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the server binary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub runtime: RuntimeConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub telemetry: crate::telemetry::TelemetryConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(e) = self.network.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.runtime.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.engine.validate() {
            errors.extend(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Network binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address to bind to. `"0.0.0.0"` for all IPv4 interfaces.
    pub host: String,

    /// TCP port to bind to.
    pub port: u16,

    /// Enable SO_REUSEPORT so multiple processes can share the port with
    /// kernel-level load distribution.
    pub reuse_port: bool,

    /// Listen backlog.
    pub backlog: i32,

    /// Optional kernel receive buffer size (SO_RCVBUF).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_buffer_size: Option<usize>,

    /// Optional kernel send buffer size (SO_SNDBUF).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_buffer_size: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            reuse_port: true,
            backlog: 1024,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.host.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("invalid host address: {}", self.host));
        }
        if self.backlog <= 0 {
            errors.push("backlog must be positive".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Async runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; user handlers run here, so long blocks starve the
    /// pool. Defaults to the CPU count.
    pub worker_threads: usize,

    /// Blocking-thread pool cap.
    pub max_blocking_threads: usize,

    /// Thread name prefix, useful in profilers.
    pub thread_name: String,

    /// Per-thread stack size in bytes.
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            max_blocking_threads: 512,
            thread_name: "webd-worker".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.worker_threads == 0 {
            errors.push("worker_threads must be > 0".to_string());
        }
        if self.worker_threads > 1024 {
            errors.push("worker_threads is unreasonably high (> 1024)".to_string());
        }
        if self.thread_stack_size < 128 * 1024 {
            errors.push("thread_stack_size too small (< 128 KB)".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Request-engine configuration. Zero-valued timeouts mean "disabled".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-request deadline in milliseconds (0 = none), surfaced through
    /// the request's cancellation.
    pub request_timeout_ms: u64,

    /// Cap on unread keep-alive body bytes discarded before the
    /// connection is forced closed.
    pub max_drain_size: u64,

    /// Buffered reader/writer size in bytes.
    pub buffer_size: usize,

    /// Socket read deadline in seconds (0 = none).
    pub read_timeout_secs: u64,

    /// Socket write deadline in seconds (0 = none).
    pub write_timeout_secs: u64,

    /// Idle keep-alive timeout in seconds (0 = none).
    pub keep_alive_timeout_secs: u64,

    /// Concurrent connection cap (0 = unlimited).
    pub max_conns: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 0,
            max_drain_size: crate::engine::DEFAULT_MAX_DRAIN_SIZE,
            buffer_size: crate::engine::DEFAULT_BUFFER_SIZE,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            keep_alive_timeout_secs: 30,
            max_conns: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.buffer_size < 256 {
            errors.push("buffer_size too small (< 256 bytes)".to_string());
        }
        if self.max_conns < 0 {
            errors.push("max_conns must not be negative".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }

    pub fn read_timeout(&self) -> Option<std::time::Duration> {
        secs_opt(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Option<std::time::Duration> {
        secs_opt(self.write_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Option<std::time::Duration> {
        secs_opt(self.keep_alive_timeout_secs)
    }
}

fn secs_opt(secs: u64) -> Option<std::time::Duration> {
    match secs {
        0 => None,
        s => Some(std::time::Duration::from_secs(s)),
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is unset.
    pub level: String,

    /// Emit JSON-formatted logs for machine consumption.
    pub json_format: bool,

    /// Include source file and line number (costs a little per event).
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_file_line: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_host_is_rejected() {
        let mut config = NetworkConfig::default();
        config.host = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_worker_threads_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_disable() {
        let mut config = EngineConfig::default();
        config.read_timeout_secs = 0;
        config.request_timeout_ms = 0;
        assert!(config.read_timeout().is_none());
        assert!(config.request_timeout().is_none());
        config.request_timeout_ms = 1500;
        assert_eq!(
            config.request_timeout(),
            Some(std::time::Duration::from_millis(1500))
        );
    }

    #[test]
    fn tiny_buffer_size_is_rejected() {
        let mut config = EngineConfig::default();
        config.buffer_size = 16;
        assert!(config.validate().is_err());
    }
}
