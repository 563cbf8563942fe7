use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Identifier of a record inside one pool
pub type CredentialId = u64;

/// The opaque set of short-lived auth parameters sent with a request
///
/// Headers are kept sorted so two bundles with the same pairs fingerprint
/// identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl CredentialBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header, builder style
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// SHA-256 over the sorted header pairs and the session ID
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.headers {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"session:");
        if let Some(session) = &self.session_id {
            hasher.update(session.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// A bundle plus the bookkeeping the pool scores it by
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub bundle: CredentialBundle,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub active: bool,
}

impl CredentialRecord {
    pub(crate) fn new(id: CredentialId, bundle: CredentialBundle, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            bundle,
            created_at,
            last_used_at: None,
            use_count: 0,
            success_count: 0,
            failure_count: 0,
            active: true,
        }
    }

    /// Fraction of successful uses; an unused record scores 1.0
    pub fn success_rate(&self) -> f64 {
        if self.use_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.use_count as f64
    }

    pub fn failure_rate(&self) -> f64 {
        if self.use_count == 0 {
            return 0.0;
        }
        self.failure_count as f64 / self.use_count as f64
    }

    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.created_at
    }

    /// Younger than `ttl`
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
        self.age(now) < ttl
    }

    /// Eligible for selection: active and not expired
    pub fn is_usable(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
        self.active && self.is_fresh(now, ttl)
    }

    pub(crate) fn record_use(&mut self, success: bool, now: DateTime<Utc>) {
        self.use_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.last_used_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_header_order() {
        let a = CredentialBundle::new()
            .with_header("x-zse-96", "sig")
            .with_header("x-zst-81", "tok");
        let b = CredentialBundle::new()
            .with_header("X-ZST-81", "tok")
            .with_header("x-zse-96", "sig");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_includes_session() {
        let a = CredentialBundle::new().with_header("x-zse-96", "sig");
        let b = a.clone().with_session_id("s1");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_unused_record_scores_one() {
        let record = CredentialRecord::new(1, CredentialBundle::new(), Utc::now());
        assert_eq!(record.success_rate(), 1.0);
        assert_eq!(record.failure_rate(), 0.0);
    }

    #[test]
    fn test_record_use_updates_counters() {
        let now = Utc::now();
        let mut record = CredentialRecord::new(1, CredentialBundle::new(), now);
        record.record_use(true, now);
        record.record_use(false, now);
        assert_eq!(record.use_count, 2);
        assert_eq!(record.success_rate(), 0.5);
        assert_eq!(record.last_used_at, Some(now));
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let ttl = ChronoDuration::hours(1);
        let record = CredentialRecord::new(1, CredentialBundle::new(), now - ChronoDuration::minutes(61));
        assert!(!record.is_fresh(now, ttl));
        assert!(!record.is_usable(now, ttl));
    }
}
