//! Re-issue a captured request outside the proxy path.
//!
//! Replay is a debugging tool for captured traffic, including self-signed
//! and test endpoints, so certificate validation is deliberately disabled on
//! the outbound call. This is an explicit trust relaxation, not a default to
//! copy elsewhere.

use crate::error::ProxyError;
use crate::store::PacketStore;
use crate::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Headers recomputed or invalid on resend.
const STRIPPED_HEADERS: [&str; 4] = [
    "content-length",
    "host",
    "connection",
    "upgrade-insecure-requests",
];

const RESPONSE_PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub new_response_status: u16,
    pub new_response_body_preview: String,
}

pub struct ReplayClient {
    store: Arc<PacketStore>,
    client: reqwest::Client,
}

impl ReplayClient {
    pub fn new(store: Arc<PacketStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProxyError::Configuration(format!("Replay client: {}", e)))?;
        Ok(Self { store, client })
    }

    /// Re-send the stored packet's method/URL/headers with its (possibly
    /// truncated) body preview as the body. Network failures come back as
    /// errors, never as panics past this boundary.
    pub async fn replay(&self, packet_id: &str) -> Result<ReplayOutcome> {
        let packet = self
            .store
            .get_packet(packet_id)
            .ok_or_else(|| ProxyError::NotFound(format!("No packet with id {}", packet_id)))?;

        let method = reqwest::Method::from_bytes(packet.method.as_bytes())
            .map_err(|_| ProxyError::Protocol(format!("Invalid method {}", packet.method)))?;

        info!("Replaying packet {} ({} {})", packet.id, packet.method, packet.url);
        let mut request = self
            .client
            .request(method, &packet.url)
            .headers(sanitize_headers(&packet.request_headers));
        if let Some(body) = packet.request_body_preview {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Network(format!("Replay failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::Network(format!("Replay failed: {}", e)))?;

        Ok(ReplayOutcome {
            new_response_status: status,
            new_response_body_preview: body.chars().take(RESPONSE_PREVIEW_CHARS).collect(),
        })
    }
}

fn sanitize_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        if STRIPPED_HEADERS.contains(&key.to_lowercase().as_str()) {
            continue;
        }
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(_) => continue,
        };
        if let Ok(value) = HeaderValue::from_str(value) {
            map.insert(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_connection_headers() {
        let headers = HashMap::from([
            ("Content-Length".to_string(), "42".to_string()),
            ("Host".to_string(), "example.com".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ]);
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized.get("accept").unwrap(), "*/*");
    }

    #[tokio::test]
    async fn test_replay_unknown_packet_is_not_found() {
        let store = Arc::new(PacketStore::new(None, 64 * 1024));
        let client = ReplayClient::new(store).unwrap();
        let err = client.replay("missing").await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }
}
