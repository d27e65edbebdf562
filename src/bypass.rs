use wildmatch::WildMatch;

/// Allow-list of origins whose traffic is never touched by user rules.
///
/// Control-plane traffic (first-party API hosts) must not be mutated or
/// blocked by user-defined rules, so matching URLs skip rule evaluation
/// entirely. Capture is unaffected.
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    patterns: Vec<String>,
}

impl BypassList {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Check whether the host of `url` matches a bypass pattern.
    /// Unparseable URLs are not bypassed.
    pub fn contains(&self, url: &str) -> bool {
        let host = match url::Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(h) => h.to_string(),
                None => return false,
            },
            Err(_) => return false,
        };
        self.patterns
            .iter()
            .any(|p| WildMatch::new(p).matches(&host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_bypasses_nothing() {
        let list = BypassList::default();
        assert!(!list.contains("https://api.example.com/v1"));
    }

    #[test]
    fn test_exact_and_wildcard_patterns() {
        let list = BypassList::new(vec![
            "api.deepseek.com".to_string(),
            "*.aliyuncs.com".to_string(),
        ]);
        assert!(list.contains("https://api.deepseek.com/chat/completions"));
        assert!(list.contains("https://dashscope.aliyuncs.com/v1"));
        assert!(!list.contains("https://deepseek.com/"));
        assert!(!list.contains("http://example.com/api.deepseek.com"));
    }

    #[test]
    fn test_unparseable_url_not_bypassed() {
        let list = BypassList::new(vec!["*".to_string()]);
        assert!(!list.contains("not a url"));
    }
}
