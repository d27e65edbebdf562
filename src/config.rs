//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Static proxy startup configuration.
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy listens on
    pub listen_host: String,
    /// Port the proxy listens on (0 picks any free port)
    pub listen_port: u16,
    /// Control API port
    pub api_port: u16,
    /// Where captured packets are persisted as a JSON array
    pub persist_path: Option<PathBuf>,
    /// Directory holding the root CA certificate and key
    pub ca_dir: PathBuf,
    /// Host patterns whose traffic bypasses rule evaluation entirely
    /// (first-party API hosts; capture still occurs)
    pub bypass_hosts: Vec<String>,
    /// Limits and timeouts
    pub limits: CaptureLimits,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            api_port: 7070,
            persist_path: Some(PathBuf::from("data/packets.json")),
            ca_dir: PathBuf::from("./certs"),
            bypass_hosts: Vec::new(),
            limits: CaptureLimits::default(),
        }
    }
}

/// Body caps and per-operation timeouts.
///
/// The caps bound memory per exchange; the timeouts bound how long any single
/// socket operation may block a handler. Pragmatic defaults, not protocol
/// requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureLimits {
    /// Maximum stored body preview length in bytes
    pub body_preview_cap: usize,
    /// Request bodies larger than this are not read at all
    pub max_request_body: usize,
    /// Timeout for reading the client's request
    pub client_read_timeout_secs: u64,
    /// Timeout for connecting to the origin
    pub origin_connect_timeout_secs: u64,
    /// Timeout for each read from the origin
    pub origin_read_timeout_secs: u64,
    /// Idle timeout for the CONNECT tunnel splice loop
    pub tunnel_idle_timeout_secs: u64,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            body_preview_cap: 64 * 1024,
            max_request_body: 2 * 1024 * 1024,
            client_read_timeout_secs: 15,
            origin_connect_timeout_secs: 15,
            origin_read_timeout_secs: 10,
            tunnel_idle_timeout_secs: 60,
        }
    }
}

impl CaptureLimits {
    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_secs(self.client_read_timeout_secs)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout_secs)
    }

    pub fn origin_read_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_read_timeout_secs)
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout_secs)
    }
}
