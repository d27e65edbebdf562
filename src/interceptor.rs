//! Two-phase traffic hooks shared by both proxy engines.
//!
//! A [`TrafficInterceptor`] bundles the rule engine, the packet store and the
//! bypass list. Connection handlers call [`TrafficInterceptor::on_request`]
//! before forwarding and [`TrafficInterceptor::on_response`] before returning
//! the response, then [`TrafficInterceptor::record`] once the exchange
//! completed. No implicit event dispatch; the hooks run synchronously at the
//! two defined phases.

use crate::bypass::BypassList;
use crate::rules::{RuleEngine, RuleKind, RulePhase};
use crate::store::PacketStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One request as seen at the request phase, mutable by rules.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// One response as seen at the response phase, mutable by rules.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Decision returned by the request phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Forward,
    /// Abort the request entirely: no forward, no origin connection.
    Block,
}

#[derive(Clone)]
pub struct TrafficInterceptor {
    rules: Arc<RuleEngine>,
    store: Arc<PacketStore>,
    bypass: BypassList,
}

impl TrafficInterceptor {
    pub fn new(rules: Arc<RuleEngine>, store: Arc<PacketStore>, bypass: BypassList) -> Self {
        Self {
            rules,
            store,
            bypass,
        }
    }

    pub fn store(&self) -> &Arc<PacketStore> {
        &self.store
    }

    /// Request-phase hook: applies header rules, decides forward vs block.
    /// Bypassed origins skip rule evaluation entirely.
    pub fn on_request(&self, req: &mut CapturedRequest) -> RequestAction {
        if self.bypass.contains(&req.url) {
            return RequestAction::Forward;
        }
        for rule in self.rules.match_rules(&req.url, RulePhase::Request) {
            match rule.kind {
                RuleKind::BlockRequest => {
                    info!("Blocking {} {} (rule {})", req.method, req.url, rule.id);
                    return RequestAction::Block;
                }
                RuleKind::ModifyRequestHeader => {
                    if let (Some(key), Some(value)) = (rule.data.key, rule.data.value) {
                        debug!("Rule {} sets request header {} on {}", rule.id, key, req.url);
                        set_header(&mut req.headers, &key, &value);
                    }
                }
                RuleKind::ModifyResponseBody => {}
            }
        }
        RequestAction::Forward
    }

    /// Response-phase hook: applies body substitution rules to textual
    /// responses and keeps Content-Length consistent with the new body.
    pub fn on_response(&self, req: &CapturedRequest, res: &mut CapturedResponse) {
        if self.bypass.contains(&req.url) {
            return;
        }
        let matched = self.rules.match_rules(&req.url, RulePhase::Response);
        if matched.is_empty() || !is_textual(&res.headers) {
            return;
        }
        // Chunked or compressed bodies are opaque bytes here; rewriting them
        // would corrupt the stream.
        if header_value(&res.headers, "transfer-encoding").is_some() {
            return;
        }
        if header_value(&res.headers, "content-encoding")
            .map(|e| !e.is_empty() && e != "identity")
            .unwrap_or(false)
        {
            return;
        }

        let mut text = String::from_utf8_lossy(&res.body).into_owned();
        let mut changed = false;
        for rule in matched {
            if rule.kind != RuleKind::ModifyResponseBody {
                continue;
            }
            if let (Some(old), Some(new)) = (rule.data.old_text, rule.data.new_text) {
                if text.contains(&old) {
                    debug!("Rule {} rewrites response body for {}", rule.id, req.url);
                    text = text.replace(&old, &new);
                    changed = true;
                }
            }
        }
        if changed {
            res.body = text.into_bytes();
            if header_value(&res.headers, "content-length").is_some() {
                set_header(&mut res.headers, "Content-Length", &res.body.len().to_string());
            }
        }
    }

    /// Append a Packet for a completed exchange.
    pub fn record(&self, req: &CapturedRequest, res: &CapturedResponse) -> String {
        self.store.add_packet(
            &req.method,
            &req.url,
            req.headers.clone(),
            (!req.body.is_empty()).then_some(req.body.as_slice()),
            res.status,
            res.headers.clone(),
            Some(&res.body),
        )
    }

    /// Record tunnel establishment as a discrete event, before any bytes
    /// flow through the tunnel.
    pub fn record_connect(&self, host: &str, port: u16) -> String {
        self.store.add_packet(
            "CONNECT",
            &format!("https://{}:{}/", host, port),
            HashMap::new(),
            None,
            200,
            HashMap::new(),
            Some(b""),
        )
    }
}

/// Set a header, replacing any existing entry with the same name regardless
/// of case (duplicate names collapse to last-seen).
pub fn set_header(headers: &mut HashMap<String, String>, key: &str, value: &str) {
    headers.retain(|k, _| !k.eq_ignore_ascii_case(key));
    headers.insert(key.to_string(), value.to_string());
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Heuristic for "is this body text we may substring-replace". Binary
/// payloads are left untouched; an absent Content-Type is treated as text.
fn is_textual(headers: &HashMap<String, String>) -> bool {
    match header_value(headers, "content-type") {
        None => true,
        Some(ct) => {
            let ct = ct.to_lowercase();
            ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("javascript")
                || ct.contains("xml")
                || ct.contains("html")
                || ct.contains("urlencoded")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleData;

    fn interceptor(bypass: Vec<String>) -> TrafficInterceptor {
        TrafficInterceptor::new(
            Arc::new(RuleEngine::new()),
            Arc::new(PacketStore::new(None, 64 * 1024)),
            BypassList::new(bypass),
        )
    }

    fn request(url: &str) -> CapturedRequest {
        CapturedRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    fn response(body: &str) -> CapturedResponse {
        CapturedResponse {
            status: 200,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "text/html".to_string(),
            )]),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_header_rule_sets_header() {
        let it = interceptor(vec![]);
        it.rules
            .add_rule(
                RuleKind::ModifyRequestHeader,
                r"example\.com",
                RuleData {
                    key: Some("X-Test".to_string()),
                    value: Some("1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut req = request("http://example.com/path");
        req.headers.insert("x-test".to_string(), "0".to_string());
        assert_eq!(it.on_request(&mut req), RequestAction::Forward);
        assert_eq!(req.headers.get("X-Test").map(String::as_str), Some("1"));
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn test_block_rule_blocks() {
        let it = interceptor(vec![]);
        it.rules
            .add_rule(RuleKind::BlockRequest, "blocked", RuleData::default())
            .unwrap();
        let mut req = request("http://example.com/blocked");
        assert_eq!(it.on_request(&mut req), RequestAction::Block);
        let mut other = request("http://example.com/ok");
        assert_eq!(it.on_request(&mut other), RequestAction::Forward);
    }

    #[test]
    fn test_bypass_skips_rules() {
        let it = interceptor(vec!["api.example.com".to_string()]);
        it.rules
            .add_rule(RuleKind::BlockRequest, ".*", RuleData::default())
            .unwrap();
        it.rules
            .add_rule(
                RuleKind::ModifyResponseBody,
                ".*",
                RuleData {
                    old_text: Some("foo".to_string()),
                    new_text: Some("bar".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut req = request("https://api.example.com/v1");
        assert_eq!(it.on_request(&mut req), RequestAction::Forward);

        let mut res = response("foo baz");
        it.on_response(&req, &mut res);
        assert_eq!(res.body, b"foo baz");
    }

    #[test]
    fn test_body_rule_rewrites_text_and_content_length() {
        let it = interceptor(vec![]);
        it.rules
            .add_rule(
                RuleKind::ModifyResponseBody,
                ".*",
                RuleData {
                    old_text: Some("foo".to_string()),
                    new_text: Some("barbar".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let req = request("http://example.com/");
        let mut res = response("foo baz");
        res.headers
            .insert("content-length".to_string(), "7".to_string());
        it.on_response(&req, &mut res);
        assert_eq!(res.body, b"barbar baz");
        assert_eq!(
            header_value(&res.headers, "Content-Length"),
            Some("10")
        );
    }

    #[test]
    fn test_body_rule_skips_binary() {
        let it = interceptor(vec![]);
        it.rules
            .add_rule(
                RuleKind::ModifyResponseBody,
                ".*",
                RuleData {
                    old_text: Some("foo".to_string()),
                    new_text: Some("bar".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let req = request("http://example.com/");
        let mut res = response("foo");
        set_header(&mut res.headers, "Content-Type", "image/png");
        it.on_response(&req, &mut res);
        assert_eq!(res.body, b"foo");
    }

    #[test]
    fn test_record_and_record_connect() {
        let it = interceptor(vec![]);
        let req = request("http://example.com/");
        let res = response("hello");
        let id = it.record(&req, &res);
        let packet = it.store().get_packet(&id).unwrap();
        assert_eq!(packet.method, "GET");
        assert_eq!(packet.response_body_preview.as_deref(), Some("hello"));

        let cid = it.record_connect("example.com", 443);
        let connect = it.store().get_packet(&cid).unwrap();
        assert_eq!(connect.method, "CONNECT");
        assert_eq!(connect.url, "https://example.com:443/");
        assert_eq!(connect.response_status, 200);
    }
}
