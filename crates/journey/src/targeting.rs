//! Targeting: decides whether a step may activate on the current page.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use wayfinder_core::config::TargetingConfig;
use wayfinder_core::error::TargetingTimeoutError;
use wayfinder_core::types::StepNode;

/// What the host page exposes to the player.
pub trait PageContext: Send + Sync {
    fn current_url(&self) -> String;
    /// Number of live elements matching a CSS selector.
    fn count_matches(&self, selector: &str) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    UrlMismatch { pattern: String, url: String },
    SelectorTimeout(TargetingTimeoutError),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

#[derive(Debug, Clone)]
pub struct TargetingEvaluator {
    timeout: Duration,
    poll_interval: Duration,
}

impl TargetingEvaluator {
    pub fn new(config: &TargetingConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.selector_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub async fn is_eligible(&self, node: &StepNode, page: &dyn PageContext) -> bool {
        self.evaluate(node, page).await.is_eligible()
    }

    /// Checks the URL gate first, then polls for the selector until it
    /// resolves or the timeout elapses.
    pub async fn evaluate(&self, node: &StepNode, page: &dyn PageContext) -> Eligibility {
        if let Some(pattern) = node.targeting.page_url.as_deref() {
            let url = page.current_url();
            if !url_matches(pattern, &url) {
                debug!(node_id = %node.id, pattern = %pattern, url = %url, "Page URL does not match");
                return Eligibility::UrlMismatch {
                    pattern: pattern.to_string(),
                    url,
                };
            }
        }

        let selector = match node.targeting.dom_selector.as_deref() {
            Some(selector) if !selector.trim().is_empty() => selector,
            _ => return Eligibility::Eligible,
        };

        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            if page.count_matches(selector) > 0 {
                return Eligibility::Eligible;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        let error = TargetingTimeoutError {
            node_id: node.id.clone(),
            selector: selector.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        };
        warn!(error = %error, "Targeting selector never resolved, node is not eligible");
        Eligibility::SelectorTimeout(error)
    }
}

/// Matches a page URL against an exact or `*`-wildcard pattern.
///
/// Patterns starting with `/` are matched against the URL path, plus the
/// query string when the pattern contains `?`. A trailing slash is ignored.
pub fn url_matches(pattern: &str, url: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return true;
    }

    let subject = if pattern.starts_with('/') {
        match url::Url::parse(url) {
            Ok(parsed) => match (pattern.contains('?'), parsed.query()) {
                (true, Some(query)) => format!("{}?{}", parsed.path(), query),
                _ => parsed.path().to_string(),
            },
            Err(_) => url.to_string(),
        }
    } else {
        url.to_string()
    };

    wildcard_match(trim_trailing_slash(pattern), trim_trailing_slash(&subject))
}

fn trim_trailing_slash(value: &str) -> &str {
    if value.len() > 1 {
        value.strip_suffix('/').unwrap_or(value)
    } else {
        value
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = t;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wayfinder_core::types::NodeKind;

    struct FakePage {
        url: String,
        /// Selector resolves once this many polls have happened.
        appears_after: Option<usize>,
        polls: AtomicUsize,
    }

    impl FakePage {
        fn new(url: &str, appears_after: Option<usize>) -> Self {
            Self {
                url: url.into(),
                appears_after,
                polls: AtomicUsize::new(0),
            }
        }
    }

    impl PageContext for FakePage {
        fn current_url(&self) -> String {
            self.url.clone()
        }

        fn count_matches(&self, _selector: &str) -> usize {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.appears_after {
                Some(after) if polls >= after => 1,
                _ => 0,
            }
        }
    }

    fn tooltip(selector: Option<&str>, page_url: Option<&str>) -> StepNode {
        let mut node = StepNode::new("tip", NodeKind::Tooltip(Default::default()));
        node.targeting.dom_selector = selector.map(Into::into);
        node.targeting.page_url = page_url.map(Into::into);
        node
    }

    #[test]
    fn test_url_matching() {
        let url = "https://app.example.com/projects/42/settings?tab=billing";
        assert!(url_matches("", url));
        assert!(url_matches(url, url));
        assert!(url_matches("/projects/*/settings", url));
        assert!(url_matches("/projects/*", url));
        assert!(url_matches("/projects/*/settings?tab=*", url));
        assert!(url_matches("https://app.example.com/*", url));
        assert!(url_matches("/projects/42/settings/", url));
        assert!(!url_matches("/projects/*/members", url));
        assert!(!url_matches("https://other.example.com/*", url));
        assert!(url_matches("/", "https://app.example.com/"));
    }

    #[test]
    fn test_wildcard() {
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a**", "a"));
        assert!(!wildcard_match("a*d", "abc"));
        assert!(wildcard_match("*ab*ab", "xabyab"));
    }

    #[tokio::test]
    async fn test_unconstrained_node_is_eligible() {
        let evaluator = TargetingEvaluator::new(&TargetingConfig::default());
        let page = FakePage::new("https://app.example.com/", None);
        assert!(evaluator.is_eligible(&tooltip(None, None), &page).await);
        assert_eq!(page.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_url_mismatch_skips_selector_poll() {
        let evaluator = TargetingEvaluator::new(&TargetingConfig::default());
        let page = FakePage::new("https://app.example.com/home", Some(1));
        let result = evaluator
            .evaluate(&tooltip(Some("#save"), Some("/settings")), &page)
            .await;
        assert!(matches!(result, Eligibility::UrlMismatch { .. }));
        assert_eq!(page.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_rendering_selector_is_found() {
        let evaluator = TargetingEvaluator::new(&TargetingConfig::default());
        let page = FakePage::new("https://app.example.com/", Some(5));
        assert!(evaluator.is_eligible(&tooltip(Some("#save"), None), &page).await);
        assert_eq!(page.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector_timeout_is_bounded() {
        let config = TargetingConfig {
            selector_timeout_ms: 1000,
            poll_interval_ms: 100,
        };
        let evaluator = TargetingEvaluator::new(&config);
        let page = FakePage::new("https://app.example.com/", None);

        let started = Instant::now();
        let result = evaluator.evaluate(&tooltip(Some("#missing"), None), &page).await;
        match result {
            Eligibility::SelectorTimeout(error) => {
                assert_eq!(error.node_id, "tip");
                assert_eq!(error.waited_ms, 1000);
            }
            other => panic!("Expected SelectorTimeout, got {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(page.polls.load(Ordering::SeqCst), 11);
    }
}
