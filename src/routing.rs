//! Ordered label-matching rules deciding which channels receive an alert.
//!
//! A rule either carries `default = true` (unconditional, last-resort match)
//! or a `match` table of label-key to pattern entries that must all match.
//! A pattern containing any regex metacharacter is compiled as a regular
//! expression and matched with search semantics; anything else must equal
//! the label value exactly. All patterns are compiled once at configuration
//! load; an invalid pattern fails the load.
//!
//! # Configuration
//!
//! ```toml
//! [[routing]]
//! match = { _source = "prometheus", severity = "critical|warning" }
//! send_to = [ "chat_default" ]
//!
//! [[routing]]
//! default = true
//! send_to = [ "catchall_webhook" ]
//! ```

use crate::prelude::*;

use crate::alert::Alert;

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use thiserror::Error;

/// Characters promoting a pattern from exact-match to regex interpretation.
const METACHARACTERS: [char; 14] = [
    '.', '*', '+', '?', '^', '$', '(', ')', '[', ']', '{', '}', '|', '\\',
];

/// One entry of the routing table, as written in configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Rule {
    /// Label-key to pattern map; all entries must match (AND).
    #[serde(rename = "match", default)]
    pub match_labels: BTreeMap<String, String>,
    /// Unconditional match, for last-resort rules.
    #[serde(default)]
    pub default: bool,
    /// Channel IDs receiving alerts matched by this rule.
    pub send_to: Vec<String>,
}

/// Errors rejecting a routing table at configuration load.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {index}: invalid pattern {pattern:?} for label {label:?}: {source}")]
    InvalidPattern {
        index: usize,
        label: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("rule {index}: send_to must not be empty")]
    EmptySendTo { index: usize },
    #[error("rule {index}: needs either a match table or default = true")]
    EmptyMatch { index: usize },
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == value,
            Self::Pattern(regex) => regex.is_match(value),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    matchers: Vec<(String, Matcher)>,
    default: bool,
    send_to: Vec<String>,
}

impl CompiledRule {
    fn matches(&self, alert: &Alert) -> bool {
        if self.default {
            return true;
        }
        self.matchers.iter().all(|(key, matcher)| {
            alert
                .labels
                .get(key)
                .is_some_and(|value| matcher.matches(value))
        })
    }
}

/// The compiled routing table. Built once at configuration load, read-only
/// afterwards.
#[derive(Debug)]
pub struct Router {
    rules: Vec<CompiledRule>,
}

/// Whether a pattern string is interpreted as a regular expression.
#[must_use]
pub fn is_pattern(s: &str) -> bool {
    s.contains(|c| METACHARACTERS.contains(&c))
}

impl Router {
    /// Compile the declared rules, validating every pattern.
    pub fn compile(rules: &[Rule]) -> Result<Self, RuleError> {
        let mut compiled = Vec::with_capacity(rules.len());

        for (index, rule) in rules.iter().enumerate() {
            if rule.send_to.is_empty() {
                return Err(RuleError::EmptySendTo { index });
            }
            if !rule.default && rule.match_labels.is_empty() {
                return Err(RuleError::EmptyMatch { index });
            }

            let mut matchers = Vec::with_capacity(rule.match_labels.len());
            for (label, pattern) in &rule.match_labels {
                let matcher = if is_pattern(pattern) {
                    Matcher::Pattern(Regex::new(pattern).map_err(|source| {
                        RuleError::InvalidPattern {
                            index,
                            label: label.clone(),
                            pattern: pattern.clone(),
                            source,
                        }
                    })?)
                } else {
                    Matcher::Exact(pattern.clone())
                };
                matchers.push((label.clone(), matcher));
            }

            compiled.push(CompiledRule {
                matchers,
                default: rule.default,
                send_to: rule.send_to.clone(),
            });
        }

        Ok(Self { rules: compiled })
    }

    /// Channel IDs for an alert: the union of `send_to` over matching rules,
    /// in rule declaration order, deduplicated. Empty when nothing matched.
    #[must_use]
    pub fn route(&self, alert: &Alert) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut channels: Vec<String> = Vec::new();

        for rule in &self.rules {
            if !rule.matches(alert) {
                continue;
            }
            for id in &rule.send_to {
                if seen.insert(id.as_str()) {
                    channels.push(id.clone());
                }
            }
        }

        channels
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertStatus, open_sentinel};
    use std::collections::BTreeMap;

    fn alert(labels: &[(&str, &str)]) -> Alert {
        Alert {
            status: AlertStatus::Firing,
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            annotations: BTreeMap::new(),
            starts_at: open_sentinel(),
            ends_at: open_sentinel(),
            generator_url: String::new(),
            fingerprint: None,
            silence_url: None,
            dashboard_url: None,
            panel_url: None,
            values: None,
            value_string: None,
            merged_entities: vec![],
        }
    }

    fn rule(matches: &[(&str, &str)], default: bool, send_to: &[&str]) -> Rule {
        Rule {
            match_labels: matches
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            default,
            send_to: send_to.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn pattern_detection() {
        assert!(!is_pattern("prometheus"));
        assert!(!is_pattern("prod_jenkins_alarm"));
        assert!(is_pattern("critical|warning"));
        assert!(is_pattern(".*[Jj]enkins.*"));
        assert!(is_pattern("^exact$"));
    }

    #[test]
    fn exact_match_requires_equality() {
        let router = Router::compile(&[rule(&[("severity", "critical")], false, &["chat"])]).unwrap();

        assert_eq!(router.route(&alert(&[("severity", "critical")])), vec!["chat"]);
        assert!(router.route(&alert(&[("severity", "critically")])).is_empty());
    }

    #[test]
    fn regex_match_uses_search_semantics() {
        let router =
            Router::compile(&[rule(&[("alertname", "[Jj]enkins")], false, &["chat"])]).unwrap();

        assert_eq!(
            router.route(&alert(&[("alertname", "JenkinsBuildFailed")])),
            vec!["chat"]
        );
        assert_eq!(
            router.route(&alert(&[("alertname", "prod-jenkins-agent")])),
            vec!["chat"]
        );
        assert!(router.route(&alert(&[("alertname", "GitlabCI")])).is_empty());
    }

    #[test]
    fn all_entries_must_match() {
        let router = Router::compile(&[rule(
            &[("_source", "prometheus"), ("severity", "critical")],
            false,
            &["chat"],
        )])
        .unwrap();

        assert!(
            router
                .route(&alert(&[("_source", "prometheus"), ("severity", "critical")]))
                .len()
                == 1
        );
        // missing label means no match
        assert!(router.route(&alert(&[("severity", "critical")])).is_empty());
    }

    #[test]
    fn default_rule_matches_unconditionally() {
        let router = Router::compile(&[rule(&[], true, &["catchall"])]).unwrap();
        assert_eq!(router.route(&alert(&[("whatever", "x")])), vec!["catchall"]);
    }

    #[test]
    fn union_preserves_declaration_order_and_dedups() {
        let router = Router::compile(&[
            rule(&[("severity", "critical")], false, &["pager", "chat"]),
            rule(&[("_source", "prometheus")], false, &["chat", "audit"]),
            rule(&[], true, &["catchall"]),
        ])
        .unwrap();

        let routed = router.route(&alert(&[("severity", "critical"), ("_source", "prometheus")]));
        assert_eq!(routed, vec!["pager", "chat", "audit", "catchall"]);
    }

    #[test]
    fn invalid_pattern_fails_compile() {
        let err = Router::compile(&[rule(&[("alertname", "([unclosed")], false, &["chat"])])
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { index: 0, .. }));
    }

    #[test]
    fn empty_send_to_fails_compile() {
        let err = Router::compile(&[rule(&[("a", "b")], false, &[])]).unwrap_err();
        assert!(matches!(err, RuleError::EmptySendTo { index: 0 }));
    }

    #[test]
    fn matchless_non_default_rule_fails_compile() {
        let err = Router::compile(&[rule(&[], false, &["chat"])]).unwrap_err();
        assert!(matches!(err, RuleError::EmptyMatch { index: 0 }));
    }
}
