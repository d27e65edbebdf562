//! Proxy service: a listening engine behind one interface.
//!
//! Two interchangeable engines implement [`ProxyEngine`]: the passthrough
//! engine (raw sockets, CONNECT tunnels stay opaque) and the TLS interception
//! engine (CA-backed decryption). Callers depend only on this interface and
//! the interceptor hook points, not on which engine is active.

use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Bind and begin accepting. Idempotent: when already running, returns
    /// the existing bound port without rebinding. Port 0 picks any free port.
    async fn start(&self) -> Result<u16>;

    /// Stop accepting new connections. In-flight handlers finish naturally.
    async fn stop(&self);

    /// Effective address once started.
    fn bound_addr(&self) -> Option<SocketAddr>;
}

/// Owner of the engine; what the control API talks to.
#[derive(Clone)]
pub struct ProxyServer {
    engine: Arc<dyn ProxyEngine>,
}

impl ProxyServer {
    pub fn new(engine: Arc<dyn ProxyEngine>) -> Self {
        Self { engine }
    }

    /// Start the engine if it is not already running; either way return the
    /// bound port.
    pub async fn ensure_started(&self) -> Result<u16> {
        self.engine.start().await
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.engine.bound_addr()
    }

    /// Address browsers should be configured with, e.g. `http://127.0.0.1:8080`.
    pub fn proxy_url(&self) -> Option<String> {
        self.bound_addr()
            .map(|addr| format!("http://{}:{}", addr.ip(), addr.port()))
    }
}
