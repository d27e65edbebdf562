//! Runtime traffic rules.
//!
//! Rules are declared through the control API and evaluated by the connection
//! handlers at the request and response phases. Read-heavy, write-light: many
//! handlers call [`RuleEngine::match_rules`] concurrently while additions are
//! rare, so the list sits behind an `RwLock`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Kind of mutation a rule performs. The kind fixes the lifecycle phase the
/// rule is eligible for: header and block rules run at the request phase,
/// body rules at the response phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ModifyRequestHeader,
    ModifyResponseBody,
    BlockRequest,
}

impl RuleKind {
    pub fn phase(&self) -> RulePhase {
        match self {
            RuleKind::ModifyRequestHeader | RuleKind::BlockRequest => RulePhase::Request,
            RuleKind::ModifyResponseBody => RulePhase::Response,
        }
    }
}

/// Lifecycle point at which rules are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePhase {
    Request,
    Response,
}

/// Type-specific rule payload.
///
/// `{key, value}` for header modification, `{old_text, new_text}` for body
/// substitution, empty for blocking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_text: Option<String>,
}

/// A user-declared interception/mutation directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Pattern searched (not fully matched) against the request URL
    pub regex: String,
    pub data: RuleData,
    pub enabled: bool,
}

impl Rule {
    /// Regex search against the URL. An invalid pattern never matches; the
    /// rule stays in the list and does not abort request processing.
    fn matches_url(&self, url: &str) -> bool {
        Regex::new(&self.regex)
            .map(|re| re.is_match(url))
            .unwrap_or(false)
    }
}

/// Ordered set of interception rules, shared across connection handlers.
///
/// Injectable shared state: the proxy service constructs one engine and hands
/// it to every handler, so tests can build isolated instances.
#[derive(Default)]
pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
    next_id: AtomicU64,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. The payload must carry the fields its kind needs; regex
    /// syntax is deliberately not validated here (see [`Rule::matches_url`]).
    pub fn add_rule(
        &self,
        kind: RuleKind,
        url_regex: &str,
        data: RuleData,
    ) -> Result<String, String> {
        if url_regex.is_empty() {
            return Err("url_regex must not be empty".to_string());
        }
        match kind {
            RuleKind::ModifyRequestHeader => {
                if data.key.is_none() || data.value.is_none() {
                    return Err("header modification requires key and value".to_string());
                }
            }
            RuleKind::ModifyResponseBody => {
                if data.old_text.is_none() || data.new_text.is_none() {
                    return Err("body modification requires old_text and new_text".to_string());
                }
            }
            RuleKind::BlockRequest => {}
        }

        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let rule = Rule {
            id: id.clone(),
            kind,
            regex: url_regex.to_string(),
            data,
            enabled: true,
        };
        self.rules.write().unwrap().push(rule);
        Ok(id)
    }

    /// All rules including disabled ones, in insertion order.
    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().unwrap().clone()
    }

    pub fn clear_rules(&self) {
        self.rules.write().unwrap().clear();
    }

    /// Enabled rules of the given phase whose pattern matches `url`,
    /// preserving insertion order.
    pub fn match_rules(&self, url: &str, phase: RulePhase) -> Vec<Rule> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.enabled && r.kind.phase() == phase && r.matches_url(url))
            .cloned()
            .collect()
    }
}
