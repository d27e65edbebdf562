//! TLS interception engine, backed by hudsucker and the local CA.
//!
//! Terminates client TLS with per-host leaf certificates signed by the root
//! CA, decrypts, runs the same interceptor hooks as the passthrough engine
//! against each exchange, and records the decrypted traffic as ordinary
//! packets (method/url of the real request, not CONNECT).

use crate::ca::CertificateAuthority;
use crate::config::CaptureLimits;
use crate::error::ProxyError;
use crate::interceptor::{
    header_value, CapturedRequest, CapturedResponse, RequestAction, TrafficInterceptor,
};
use crate::proxy::ProxyEngine;
use crate::Result;
use async_trait::async_trait;
use hudsucker::{
    certificate_authority::RcgenAuthority,
    hyper::{body::HttpBody, Body, Request, Response, StatusCode},
    rustls, HttpContext, HttpHandler, ProxyBuilder, RequestOrResponse,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

pub struct InterceptEngine {
    listen_host: String,
    listen_port: u16,
    ca: Arc<CertificateAuthority>,
    interceptor: TrafficInterceptor,
    limits: CaptureLimits,
    state: Mutex<Option<EngineState>>,
}

struct EngineState {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

impl InterceptEngine {
    pub fn new(
        listen_host: &str,
        listen_port: u16,
        ca: Arc<CertificateAuthority>,
        interceptor: TrafficInterceptor,
        limits: CaptureLimits,
    ) -> Self {
        Self {
            listen_host: listen_host.to_string(),
            listen_port,
            ca,
            interceptor,
            limits,
            state: Mutex::new(None),
        }
    }

    /// Bind the listener up front so the port is known when the configured
    /// port is 0 and the socket is accepting by the time `start` returns.
    fn bind_listener(&self) -> Result<std::net::TcpListener> {
        let bind_addr = format!("{}:{}", self.listen_host, self.listen_port);
        let listener =
            std::net::TcpListener::bind(&bind_addr).map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        Ok(listener)
    }
}

#[async_trait]
impl ProxyEngine for InterceptEngine {
    async fn start(&self) -> Result<u16> {
        if let Some(state) = self.state.lock().unwrap().as_ref() {
            return Ok(state.addr.port());
        }

        let listener = self.bind_listener()?;
        let addr = listener.local_addr()?;

        // hudsucker/rustls expect DER, not PEM.
        let private_key = rustls::PrivateKey(self.ca.key_der());
        let ca_cert = rustls::Certificate(self.ca.cert_der()?);
        let authority = RcgenAuthority::new(private_key, ca_cert, 1000).map_err(|e| {
            ProxyError::Certificate(format!("Failed to create signing authority: {}", e))
        })?;

        let handler = InterceptHandler::new(self.interceptor.clone(), self.limits.clone());
        let proxy = ProxyBuilder::new()
            .with_listener(listener)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(handler)
            .build();

        let (shutdown, stopped) = oneshot::channel::<()>();
        info!("Interception proxy listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = proxy
                .start(async move {
                    let _ = stopped.await;
                })
                .await
            {
                error!("Interception proxy failed: {}", e);
            }
        });

        *self.state.lock().unwrap() = Some(EngineState { addr, shutdown });
        Ok(addr.port())
    }

    async fn stop(&self) {
        if let Some(state) = self.state.lock().unwrap().take() {
            info!("Stopping interception proxy on {}", state.addr);
            let _ = state.shutdown.send(());
        }
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|s| s.addr)
    }
}

/// hudsucker hook adapter: translates each decrypted exchange into the
/// interceptor's request/response phases.
#[derive(Clone)]
struct InterceptHandler {
    interceptor: TrafficInterceptor,
    limits: CaptureLimits,
    /// Request captured in handle_request, consumed in handle_response for
    /// correlation. hudsucker clones the handler per exchange, so this state
    /// must be a plain field: sharing it across clones would let concurrent
    /// exchanges clobber each other's pending request.
    pending: Option<CapturedRequest>,
}

impl InterceptHandler {
    fn new(interceptor: TrafficInterceptor, limits: CaptureLimits) -> Self {
        Self {
            interceptor,
            limits,
            pending: None,
        }
    }
}

#[async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == hudsucker::hyper::Method::CONNECT {
            // Tunnel establishment is its own discrete event, recorded before
            // any decrypted bytes flow.
            let target = req.uri().to_string();
            let (host, port) = match target.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
                None => (target, 443),
            };
            self.interceptor.record_connect(&host, port);
            return RequestOrResponse::Request(req);
        }

        let method = req.method().to_string();
        let url = req.uri().to_string();
        let (parts, body) = req.into_parts();
        let body_bytes = read_body(body, self.limits.max_request_body).await;

        let mut captured = CapturedRequest {
            method,
            url,
            headers: header_map(&parts.headers),
            body: body_bytes,
        };
        if self.interceptor.on_request(&mut captured) == RequestAction::Block {
            self.pending = None;
            let mut denied = Response::new(Body::empty());
            *denied.status_mut() = StatusCode::FORBIDDEN;
            return RequestOrResponse::Response(denied);
        }

        // Re-apply possibly mutated headers onto the outbound request.
        let mut req = Request::from_parts(parts, Body::from(captured.body.clone()));
        for (key, value) in &captured.headers {
            let name = match hudsucker::hyper::header::HeaderName::from_bytes(key.as_bytes()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            match hudsucker::hyper::header::HeaderValue::from_str(value) {
                Ok(v) => {
                    req.headers_mut().insert(name, v);
                }
                Err(_) => continue,
            }
        }

        self.pending = Some(captured);
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let request = match self.pending.take() {
            Some(req) => req,
            None => return res,
        };

        let status = res.status().as_u16();
        let (mut parts, body) = res.into_parts();
        let body_bytes = read_body(body, usize::MAX).await;

        let mut captured = CapturedResponse {
            status,
            headers: header_map(&parts.headers),
            body: body_bytes,
        };
        self.interceptor.on_response(&request, &mut captured);
        self.interceptor.record(&request, &captured);

        if let Some(len) = header_value(&captured.headers, "content-length") {
            if let Ok(v) = hudsucker::hyper::header::HeaderValue::from_str(len) {
                parts
                    .headers
                    .insert(hudsucker::hyper::header::CONTENT_LENGTH, v);
            }
        }
        Response::from_parts(parts, Body::from(captured.body))
    }
}

/// Drain a hyper body into memory, truncating at `cap`. Stream errors end
/// the read with whatever arrived; the proxy must keep serving.
async fn read_body(mut body: Body, cap: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                if out.len() + data.len() > cap {
                    out.extend_from_slice(&data[..cap.saturating_sub(out.len())]);
                    warn!("Body truncated at {} bytes", cap);
                    break;
                }
                out.extend_from_slice(&data);
            }
            Err(e) => {
                warn!("Stream error while reading body: {}", e);
                break;
            }
        }
    }
    out
}

fn header_map(headers: &hudsucker::hyper::HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in headers {
        if let Ok(v) = value.to_str() {
            map.insert(key.to_string(), v.to_string());
        }
    }
    map
}
