//! Passthrough proxy engine: raw TCP listener, no TLS decryption.
//!
//! Plain HTTP is parsed, intercepted and recorded; HTTPS is carried through
//! opaque CONNECT tunnels with only the establishment event captured. One
//! tokio task per accepted connection; the accept loop is the only serialized
//! point.

use crate::config::CaptureLimits;
use crate::error::ProxyError;
use crate::handler::ConnectionHandler;
use crate::interceptor::TrafficInterceptor;
use crate::proxy::ProxyEngine;
use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct PassthroughEngine {
    listen_host: String,
    listen_port: u16,
    handler: Arc<ConnectionHandler>,
    state: Mutex<Option<EngineState>>,
}

struct EngineState {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl PassthroughEngine {
    pub fn new(
        listen_host: &str,
        listen_port: u16,
        interceptor: TrafficInterceptor,
        limits: CaptureLimits,
    ) -> Self {
        Self {
            listen_host: listen_host.to_string(),
            listen_port,
            handler: Arc::new(ConnectionHandler::new(interceptor, limits)),
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProxyEngine for PassthroughEngine {
    async fn start(&self) -> Result<u16> {
        if let Some(state) = self.state.lock().unwrap().as_ref() {
            return Ok(state.addr.port());
        }

        let bind_addr = format!("{}:{}", self.listen_host, self.listen_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;
        info!("Recording proxy listening on {}", addr);

        let (shutdown, mut stopped) = watch::channel(false);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                let _ = handler.handle(stream).await;
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        }
                    },
                }
            }
            debug!("Accept loop terminated");
        });

        *self.state.lock().unwrap() = Some(EngineState { addr, shutdown });
        Ok(addr.port())
    }

    async fn stop(&self) {
        if let Some(state) = self.state.lock().unwrap().take() {
            info!("Stopping recording proxy on {}", state.addr);
            let _ = state.shutdown.send(true);
        }
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|s| s.addr)
    }
}
