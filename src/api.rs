//! Control-plane HTTP API.
//!
//! The rest of the application consumes the proxy subsystem exclusively
//! through these endpoints: ensure the proxy is running, list/fetch/clear
//! captured packets, manage rules, download the CA certificate and replay a
//! packet. Every failure is a structured JSON body, never a bare 500.

use crate::ca::CertificateAuthority;
use crate::error::ProxyError;
use crate::proxy::ProxyServer;
use crate::replay::ReplayClient;
use crate::rules::{RuleData, RuleEngine, RuleKind};
use crate::store::PacketStore;
use crate::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: ProxyServer,
    pub store: Arc<PacketStore>,
    pub rules: Arc<RuleEngine>,
    pub replay: Arc<ReplayClient>,
    /// Present only when the TLS interception engine is active.
    pub ca: Option<Arc<CertificateAuthority>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/recorder/proxy", get(proxy_status_handler))
        .route(
            "/api/recorder/packets",
            get(list_packets_handler).post(clear_packets_handler),
        )
        .route("/api/recorder/packets/:packet_id", get(packet_detail_handler))
        .route("/api/recorder/cert", get(download_cert_handler))
        .route("/api/rules", get(list_rules_handler).post(add_rule_handler))
        .route("/api/rules/clear", post(clear_rules_handler))
        .route("/api/replay", post(replay_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Bind and serve the control API.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ProxyError::Bind { addr: addr.clone(), source })?;
    info!("Control API listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ProxyError::Network(format!("Control API failed: {}", e)))?;
    Ok(())
}

/// Ensure the proxy is running and report its address.
async fn proxy_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.proxy.ensure_started().await {
        Ok(port) => {
            let host = state
                .proxy
                .bound_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            (
                StatusCode::OK,
                Json(json!({
                    "ok": true,
                    "proxy_url": state.proxy.proxy_url(),
                    "host": host,
                    "port": port,
                })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct PacketsQuery {
    url_contains: Option<String>,
    /// Comma-separated list; takes precedence over `url_contains`.
    url_contains_any: Option<String>,
    limit: Option<usize>,
}

async fn list_packets_handler(
    State(state): State<AppState>,
    Query(query): Query<PacketsQuery>,
) -> impl IntoResponse {
    let any: Option<Vec<String>> = query.url_contains_any.as_deref().map(parse_csv);
    let packets = state.store.list_packets(
        query.url_contains.as_deref(),
        any.as_deref(),
        query.limit.unwrap_or(200),
    );
    Json(json!({ "packets": packets }))
}

async fn clear_packets_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.store.clear_packets();
    Json(json!({ "ok": true, "message": "Packets cleared" }))
}

async fn packet_detail_handler(
    State(state): State<AppState>,
    Path(packet_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_packet(&packet_id) {
        Some(packet) => (StatusCode::OK, Json(json!(packet))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No packet with id {}", packet_id) })),
        ),
    }
}

/// Download the root CA certificate users must trust for TLS interception.
async fn download_cert_handler(State(state): State<AppState>) -> impl IntoResponse {
    let not_found = (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "CA certificate not generated yet; start the interception proxy first"
        })),
    )
        .into_response();

    let ca = match &state.ca {
        Some(ca) => ca,
        None => return not_found,
    };
    match std::fs::read(ca.cert_path()) {
        Ok(pem) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-pem-file".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"proxy-ca-cert.pem\"".to_string(),
                ),
            ],
            pem,
        )
            .into_response(),
        Err(_) => not_found,
    }
}

#[derive(Deserialize)]
struct AddRuleRequest {
    url_regex: String,
    modification_type: String,
    #[serde(default)]
    data: RuleData,
}

async fn add_rule_handler(
    State(state): State<AppState>,
    Json(request): Json<AddRuleRequest>,
) -> impl IntoResponse {
    let kind = match request.modification_type.as_str() {
        "modify_request_header" => RuleKind::ModifyRequestHeader,
        "modify_response_body" => RuleKind::ModifyResponseBody,
        "block_request" => RuleKind::BlockRequest,
        other => {
            return Json(json!({
                "success": false,
                "error": format!("Unsupported modification type: {}", other),
            }))
        }
    };
    match state.rules.add_rule(kind, &request.url_regex, request.data) {
        Ok(id) => Json(json!({
            "success": true,
            "message": format!("Rule added with id {}", id),
        })),
        Err(e) => Json(json!({ "success": false, "error": e })),
    }
}

async fn list_rules_handler(State(state): State<AppState>) -> impl IntoResponse {
    let rules = state.rules.list_rules();
    let count = rules.len();
    Json(json!({
        "success": true,
        "data": { "rules": rules, "count": count },
    }))
}

async fn clear_rules_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.rules.clear_rules();
    Json(json!({ "success": true, "message": "All rules cleared" }))
}

#[derive(Deserialize)]
struct ReplayRequest {
    packet_id: String,
}

async fn replay_handler(
    State(state): State<AppState>,
    Json(request): Json<ReplayRequest>,
) -> impl IntoResponse {
    match state.replay.replay(&request.packet_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "new_response_status": outcome.new_response_status,
                "new_response_body_preview": outcome.new_response_body_preview,
            })),
        ),
        Err(ProxyError::NotFound(msg)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": msg })))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::BypassList;
    use crate::config::CaptureLimits;
    use crate::interceptor::TrafficInterceptor;
    use crate::passthrough::PassthroughEngine;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn state() -> AppState {
        let store = Arc::new(PacketStore::new(None, 64 * 1024));
        let rules = Arc::new(RuleEngine::new());
        let interceptor = TrafficInterceptor::new(
            rules.clone(),
            store.clone(),
            BypassList::default(),
        );
        let engine = Arc::new(PassthroughEngine::new(
            "127.0.0.1",
            0,
            interceptor,
            CaptureLimits::default(),
        ));
        AppState {
            proxy: ProxyServer::new(engine),
            store,
            rules,
            replay: Arc::new(ReplayClient::new(Arc::new(PacketStore::new(None, 64 * 1024))).unwrap()),
            ca: None,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_csv() {
        assert_eq!(parse_csv("a.com, b.com,,"), vec!["a.com", "b.com"]);
        assert!(parse_csv(" ").is_empty());
    }

    #[tokio::test]
    async fn test_list_packets_endpoint_filters_any() {
        let state = state();
        for url in ["http://a.com/", "http://b.com/", "http://c.com/"] {
            state.store.add_packet(
                "GET",
                url,
                HashMap::new(),
                None,
                200,
                HashMap::new(),
                None,
            );
        }
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/recorder/packets?url_contains_any=a.com,b.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let packets = json["packets"].as_array().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0]["url"], "http://b.com/");
        assert_eq!(packets[1]["url"], "http://a.com/");
    }

    #[tokio::test]
    async fn test_packet_detail_404_is_json() {
        let response = router(state())
            .oneshot(
                Request::builder()
                    .uri("/api/recorder/packets/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_add_rule_rejects_unknown_type() {
        let state = state();
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/rules")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"url_regex":".*","modification_type":"teleport","data":{}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(state.rules.list_rules().is_empty());
    }

    #[tokio::test]
    async fn test_add_and_list_rules() {
        let state = state();
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/rules")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"url_regex":"example\\.com","modification_type":"modify_request_header","data":{"key":"X-Test","value":"1"}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/rules")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["data"]["count"], 1);
        assert_eq!(json["data"]["rules"][0]["type"], "modify_request_header");
    }

    #[tokio::test]
    async fn test_cert_endpoint_404_without_ca() {
        let response = router(state())
            .oneshot(
                Request::builder()
                    .uri("/api/recorder/cert")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replay_unknown_packet_is_json_error() {
        let response = router(state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/replay")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"packet_id":"missing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }
}
