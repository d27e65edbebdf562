//! Append-only store for captured request/response exchanges.
//!
//! Packets live in memory and are mirrored to disk as a single JSON array
//! after every mutation. Persistence is best-effort: disk trouble must never
//! block capture, so write failures are logged and swallowed and the
//! in-memory list stays authoritative.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Marker appended to a body preview that was cut at the cap.
const TRUNCATION_MARKER: char = '…';

/// One captured request/response exchange (or CONNECT establishment event).
///
/// Immutable once stored; removed only by [`PacketStore::clear_packets`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub id: String,
    /// Capture time, seconds since epoch
    pub timestamp: f64,
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub request_body_preview: Option<String>,
    pub response_status: u16,
    pub response_headers: HashMap<String, String>,
    pub response_body_preview: Option<String>,
}

/// Durable, queryable record of captured exchanges.
///
/// Shared across all connection handlers; every mutation and the persistence
/// write happen under one mutex, reads clone out of it.
pub struct PacketStore {
    packets: Mutex<Vec<Packet>>,
    persist_path: Mutex<Option<PathBuf>>,
    body_preview_cap: usize,
}

impl PacketStore {
    pub fn new(persist_path: Option<PathBuf>, body_preview_cap: usize) -> Self {
        Self {
            packets: Mutex::new(Vec::new()),
            persist_path: Mutex::new(persist_path),
            body_preview_cap,
        }
    }

    /// Point the store at a new on-disk location. Startup hook; does not
    /// rewrite anything until the next mutation.
    pub fn set_persist_path(&self, path: Option<PathBuf>) {
        *self.persist_path.lock().unwrap() = path;
    }

    /// Record one exchange. Bodies are decoded permissively and truncated to
    /// the preview cap. Returns the assigned packet id.
    pub fn add_packet(
        &self,
        method: &str,
        url: &str,
        request_headers: HashMap<String, String>,
        request_body: Option<&[u8]>,
        response_status: u16,
        response_headers: HashMap<String, String>,
        response_body: Option<&[u8]>,
    ) -> String {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        let packet = Packet {
            id: id.clone(),
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            method: method.to_uppercase(),
            url: url.to_string(),
            request_headers,
            request_body_preview: request_body.map(|b| self.truncate(b)),
            response_status,
            response_headers,
            response_body_preview: response_body.map(|b| self.truncate(b)),
        };

        let mut packets = self.packets.lock().unwrap();
        packets.push(packet);
        self.persist(&packets);
        id
    }

    /// List captured packets, most recent first.
    ///
    /// `url_contains_any` takes precedence over `url_contains` when both are
    /// supplied; both match case-insensitive substrings of the URL. `limit`
    /// is clamped to 1..=1000.
    pub fn list_packets(
        &self,
        url_contains: Option<&str>,
        url_contains_any: Option<&[String]>,
        limit: usize,
    ) -> Vec<Packet> {
        let packets = self.packets.lock().unwrap();
        let needles: Vec<String> = match url_contains_any {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => url_contains
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .into_iter()
                .collect(),
        };

        packets
            .iter()
            .rev()
            .filter(|p| {
                if needles.is_empty() {
                    return true;
                }
                let url = p.url.to_lowercase();
                needles.iter().any(|q| url.contains(q))
            })
            .take(limit.clamp(1, 1000))
            .cloned()
            .collect()
    }

    pub fn get_packet(&self, id: &str) -> Option<Packet> {
        self.packets
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Remove all packets and persist the empty state.
    pub fn clear_packets(&self) {
        let mut packets = self.packets.lock().unwrap();
        packets.clear();
        self.persist(&packets);
    }

    /// Restore prior state from disk. A missing or corrupt file yields an
    /// empty store rather than failing startup.
    pub fn load(&self) {
        let path = match self.persist_path.lock().unwrap().clone() {
            Some(p) => p,
            None => return,
        };
        let mut packets = self.packets.lock().unwrap();
        *packets = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring corrupt packet file {}: {}", path.display(), e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
    }

    fn persist(&self, packets: &[Packet]) {
        let path = match self.persist_path.lock().unwrap().clone() {
            Some(p) => p,
            None => return,
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Failed to create {}: {}", parent.display(), e);
                return;
            }
        }
        match serde_json::to_string(packets) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!("Failed to persist packets to {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize packets: {}", e),
        }
    }

    fn truncate(&self, body: &[u8]) -> String {
        let text = String::from_utf8_lossy(body);
        if text.len() <= self.body_preview_cap {
            return text.into_owned();
        }
        let mut cut = self.body_preview_cap;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut out = text[..cut].to_string();
        out.push(TRUNCATION_MARKER);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> PacketStore {
        PacketStore::new(None, 64 * 1024)
    }

    fn add(store: &PacketStore, method: &str, url: &str) -> String {
        store.add_packet(
            method,
            url,
            HashMap::new(),
            None,
            200,
            HashMap::new(),
            None,
        )
    }

    #[test]
    fn test_add_then_get_roundtrip() {
        let store = store();
        let id = store.add_packet(
            "get",
            "http://example.com/a",
            HashMap::from([("Accept".to_string(), "*/*".to_string())]),
            Some(b"hello"),
            404,
            HashMap::new(),
            Some(b"not found"),
        );
        let packet = store.get_packet(&id).expect("packet should exist");
        assert_eq!(packet.method, "GET");
        assert_eq!(packet.url, "http://example.com/a");
        assert_eq!(packet.response_status, 404);
        assert_eq!(packet.request_body_preview.as_deref(), Some("hello"));
        assert_eq!(packet.response_body_preview.as_deref(), Some("not found"));
        assert!(store.get_packet("nope").is_none());
    }

    #[test]
    fn test_truncation_marker_iff_over_cap() {
        let store = PacketStore::new(None, 8);
        let id = add(&store, "GET", "http://example.com/");
        let exact = store.add_packet(
            "POST",
            "http://example.com/",
            HashMap::new(),
            Some(b"12345678"),
            200,
            HashMap::new(),
            Some(b"123456789"),
        );
        let p = store.get_packet(&exact).unwrap();
        assert_eq!(p.request_body_preview.as_deref(), Some("12345678"));
        assert_eq!(p.response_body_preview.as_deref(), Some("12345678…"));
        assert!(store.get_packet(&id).unwrap().request_body_preview.is_none());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let store = PacketStore::new(None, 5);
        // "aé" is three bytes; cutting at 5 would split the second 'é'
        let id = store.add_packet(
            "GET",
            "http://example.com/",
            HashMap::new(),
            Some("aéé".as_bytes()),
            200,
            HashMap::new(),
            None,
        );
        let p = store.get_packet(&id).unwrap();
        assert_eq!(p.request_body_preview.as_deref(), Some("aé…"));
    }

    #[test]
    fn test_list_reverse_chronological() {
        let store = store();
        let first = add(&store, "GET", "http://a.com/");
        let second = add(&store, "GET", "http://b.com/");
        let third = add(&store, "GET", "http://c.com/");
        let listed: Vec<String> = store
            .list_packets(None, None, 200)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(listed, vec![third, second, first]);
    }

    #[test]
    fn test_list_filters() {
        let store = store();
        add(&store, "GET", "http://a.com/x");
        add(&store, "GET", "http://b.com/y");
        add(&store, "GET", "http://c.com/z");

        let single = store.list_packets(Some("B.COM"), None, 200);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].url, "http://b.com/y");

        let any = store.list_packets(
            None,
            Some(&["a.com".to_string(), "b.com".to_string()]),
            200,
        );
        assert_eq!(any.len(), 2);
        assert_eq!(any[0].url, "http://b.com/y");
        assert_eq!(any[1].url, "http://a.com/x");

        // any-of takes precedence when both are supplied
        let both = store.list_packets(
            Some("c.com"),
            Some(&["a.com".to_string()]),
            200,
        );
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].url, "http://a.com/x");
    }

    #[test]
    fn test_limit_clamped() {
        let store = store();
        for i in 0..5 {
            add(&store, "GET", &format!("http://example.com/{}", i));
        }
        assert_eq!(store.list_packets(None, None, 0).len(), 1);
        assert_eq!(store.list_packets(None, None, 3).len(), 3);
    }

    #[test]
    fn test_clear_then_list_empty() {
        let store = store();
        add(&store, "GET", "http://a.com/");
        store.clear_packets();
        assert!(store.list_packets(None, None, 200).is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("packets.json");

        let store = PacketStore::new(Some(path.clone()), 64 * 1024);
        let a = add(&store, "GET", "http://a.com/");
        let b = add(&store, "POST", "http://b.com/");

        let restored = PacketStore::new(Some(path.clone()), 64 * 1024);
        restored.load();
        let listed: Vec<String> = restored
            .list_packets(None, None, 200)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(listed, vec![b, a]);

        restored.clear_packets();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "[]");
    }

    #[test]
    fn test_corrupt_file_yields_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("packets.json");
        fs::write(&path, "{not json").unwrap();

        let store = PacketStore::new(Some(path), 64 * 1024);
        store.load();
        assert!(store.list_packets(None, None, 200).is_empty());
    }
}
