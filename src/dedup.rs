//! Time-windowed suppression of build-system alert storms.
//!
//! CI pipelines (jenkins in particular) tend to re-fire the same failure on
//! every poll, so alerts matching the build-system predicate are admitted at
//! most once per TTL window, keyed by a fingerprint over their identifying
//! labels. The cache is in-memory only; a restart opens a fresh window.
//!
//! # Configuration
//!
//! ```toml
//! [jenkins_dedup]
//! enabled = true
//! receiver_substring = "jenkins"
//! alertname_pattern = ".*[Jj]enkins.*"
//! ttl_seconds = 900
//! clear_on_resolved = true
//! ```

use crate::prelude::*;

use crate::alert::{Alert, LABEL_ALERTNAME, LABEL_RECEIVER};

use expiringmap::ExpiringMap;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Labels participating in the computed fingerprint, besides `alertname`.
const FINGERPRINT_LABELS: [&str; 6] = [
    "pod",
    "instance",
    "service_name",
    "container",
    "host",
    "job",
];

/// Configuration for the build-system dedup window.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Alerts whose `_receiver` contains this substring are deduplicated.
    #[serde(default = "receiver_substring")]
    pub receiver_substring: String,
    /// Alerts whose `alertname` matches this pattern are deduplicated.
    #[serde(default = "alertname_pattern")]
    pub alertname_pattern: String,
    /// Suppression window length.
    #[serde(default = "ttl_seconds")]
    pub ttl_seconds: u64,
    /// Forget the fingerprint once its resolved alert was forwarded.
    #[serde(default = "clear_on_resolved")]
    pub clear_on_resolved: bool,
}

fn enabled() -> bool {
    true
}

fn receiver_substring() -> String {
    "jenkins".s()
}

fn alertname_pattern() -> String {
    ".*[Jj]enkins.*".s()
}

fn ttl_seconds() -> u64 {
    900
}

fn clear_on_resolved() -> bool {
    true
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: enabled(),
            receiver_substring: receiver_substring(),
            alertname_pattern: alertname_pattern(),
            ttl_seconds: ttl_seconds(),
            clear_on_resolved: clear_on_resolved(),
        }
    }
}

/// Outcome of presenting a fingerprint to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First occurrence in the window; forward the alert.
    Admitted,
    /// Already seen within the window; drop the alert.
    Suppressed,
}

/// Process-wide admission cache for build-system alerts.
///
/// All reads and mutations hold one lock; the critical sections are pure map
/// operations, so among concurrent firings of the same fingerprint exactly
/// one is admitted.
pub struct DedupCache {
    enabled: bool,
    clear_on_resolved: bool,
    ttl: Duration,
    receiver_substring: String,
    alertname_pattern: Regex,
    seen: Mutex<ExpiringMap<String, Instant>>,
}

impl DedupCache {
    /// Build the cache, compiling the alertname pattern.
    ///
    /// # Errors
    /// Will return `Err` when the configured pattern is not a valid regex.
    pub fn new(config: &DedupConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            enabled: config.enabled,
            clear_on_resolved: config.clear_on_resolved,
            ttl: Duration::from_secs(config.ttl_seconds),
            receiver_substring: config.receiver_substring.clone(),
            alertname_pattern: Regex::new(&config.alertname_pattern)?,
            seen: Mutex::new(ExpiringMap::default()),
        })
    }

    /// Whether the alert falls under the build-system predicate.
    #[must_use]
    pub fn applies(&self, alert: &Alert) -> bool {
        if !self.enabled {
            return false;
        }
        if alert
            .labels
            .get(LABEL_RECEIVER)
            .is_some_and(|receiver| receiver.contains(&self.receiver_substring))
        {
            return true;
        }
        self.alertname_pattern.is_match(alert.name())
    }

    /// Deterministic fingerprint over the identifying labels.
    ///
    /// The producer-supplied fingerprint wins when present; otherwise the key
    /// is a SHA-256 over `alertname` and the entity/job labels, serialized as
    /// sorted `key=value;` pairs so label ordering cannot change the result.
    #[must_use]
    pub fn fingerprint(alert: &Alert) -> String {
        if let Some(fingerprint) = &alert.fingerprint {
            return fingerprint.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(LABEL_ALERTNAME.as_bytes());
        hasher.update(b"=");
        hasher.update(alert.name().as_bytes());
        hasher.update(b";");
        // FINGERPRINT_LABELS is iterated in its fixed order and the map is
        // sorted, so serialization is order-invariant by construction.
        for label in FINGERPRINT_LABELS {
            if let Some(value) = alert.labels.get(label) {
                hasher.update(label.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
                hasher.update(b";");
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Present a firing fingerprint; at most one admit per TTL window.
    ///
    /// # Errors
    /// Will return `Err` if acquiring the cache mutex fails.
    pub fn admit(&self, key: &str) -> anyhow::Result<Admission> {
        let mut seen = match self.seen.lock() {
            Ok(s) => s,
            Err(e) => bail!("failed locking dedup cache: {e}"),
        };

        if seen.get(key).is_some() {
            return Ok(Admission::Suppressed);
        }
        seen.insert(key.s(), Instant::now(), self.ttl);
        Ok(Admission::Admitted)
    }

    /// Drop a fingerprint after forwarding its resolved alert.
    ///
    /// # Errors
    /// Will return `Err` if acquiring the cache mutex fails.
    pub fn forget(&self, key: &str) -> anyhow::Result<()> {
        if !self.clear_on_resolved {
            return Ok(());
        }
        let mut seen = match self.seen.lock() {
            Ok(s) => s,
            Err(e) => bail!("failed locking dedup cache: {e}"),
        };
        seen.remove(key);
        Ok(())
    }
}
