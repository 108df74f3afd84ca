//! Credential state machine and round-robin selection
//!
//! The pool holds every configured API key together with its error counters.
//! Selection is round-robin over healthy keys; keys inside a rate-limit
//! cooldown are skipped until the window elapses, at which point they become
//! selectable again without explicit action.
//!
//! Transitions:
//! - Healthy → CoolingDown (429 from upstream)
//! - Healthy → Disabled (401/403, or hard failures reaching the threshold)
//! - CoolingDown → Healthy (cooldown expired)
//! - Disabled → Healthy (operator `restore`)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Pool tuning, usually deserialized from the `[credentials]` config table.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Hard failures (non-429 error statuses) before a credential is disabled
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Cooldown applied after a 429
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_error_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Why a request made with a credential failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Http(u16),
}

impl FailureKind {
    /// Label used in logs and metrics (`rate_limit`, `http_500`, ...).
    pub fn label(&self) -> String {
        match self {
            FailureKind::RateLimited => "rate_limit".to_string(),
            FailureKind::Http(status) => format!("http_{status}"),
        }
    }

    /// Invalid or revoked keys never recover on their own.
    fn is_permanent(&self) -> bool {
        matches!(self, FailureKind::Http(401) | FailureKind::Http(403))
    }
}

/// One API key and its runtime health.
struct Credential {
    label: String,
    key: Secret<String>,
    error_count: u32,
    last_error_kind: Option<FailureKind>,
    disabled_until: Option<Instant>,
    healthy: bool,
}

impl Credential {
    fn status_label(&self, now: Instant) -> &'static str {
        if !self.healthy {
            "disabled"
        } else if self.disabled_until.is_some_and(|until| now < until) {
            "cooling_down"
        } else {
            "available"
        }
    }

    fn selected(&self) -> SelectedCredential {
        SelectedCredential {
            label: self.label.clone(),
            key: self.key.clone(),
        }
    }
}

/// A credential handed out for one request attempt.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub label: String,
    pub key: Secret<String>,
}

impl SelectedCredential {
    /// Masked key suffix for debug strings.
    pub fn masked(&self) -> String {
        self.key.masked()
    }
}

/// Read-only view of a credential's health, for status reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialInfo {
    pub label: String,
    pub error_count: u32,
    pub last_error_kind: Option<FailureKind>,
    pub healthy: bool,
    pub cooling_down: bool,
}

/// Pool of API credentials shared by all in-flight requests.
///
/// Uses an `AtomicUsize` for the round-robin index and `RwLock` for the
/// credential list so that selection is serialized while HTTP calls made with
/// the selected key run concurrently.
pub struct CredentialPool {
    credentials: RwLock<Vec<Credential>>,
    pinned: RwLock<Option<String>>,
    next_index: AtomicUsize,
    config: PoolConfig,
}

impl CredentialPool {
    /// Create a pool from the configured keys. Labels are `key-0`, `key-1`, ...
    pub fn new(keys: Vec<Secret<String>>, config: PoolConfig) -> Self {
        let credentials: Vec<Credential> = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| Credential {
                label: format!("key-{i}"),
                key,
                error_count: 0,
                last_error_kind: None,
                disabled_until: None,
                healthy: true,
            })
            .collect();
        info!(
            credentials = credentials.len(),
            error_threshold = config.error_threshold,
            cooldown_secs = config.cooldown_secs,
            "credential pool initialized"
        );
        Self {
            credentials: RwLock::new(credentials),
            pinned: RwLock::new(None),
            next_index: AtomicUsize::new(0),
            config,
        }
    }

    /// Select the next usable credential.
    ///
    /// With a manual override active, the pinned credential is returned as long
    /// as it is not disabled; cooldowns are ignored for it. Otherwise scans all
    /// credentials round-robin starting from `next_index`, transitioning expired
    /// cooldowns back to available on the way.
    pub async fn next(&self) -> Result<SelectedCredential> {
        let pinned = self.pinned.read().await.clone();
        let mut credentials = self.credentials.write().await;
        let now = Instant::now();

        if let Some(label) = pinned {
            return match credentials.iter().find(|c| c.label == label) {
                Some(c) if c.healthy => Ok(c.selected()),
                _ => {
                    warn!(credential = %label, "pinned credential is unavailable");
                    Err(Error::NoCredentialsAvailable(exhausted_message(
                        &credentials,
                        now,
                    )))
                }
            };
        }

        let n = credentials.len();
        if n == 0 {
            return Err(Error::NoCredentialsAvailable(exhausted_message(
                &credentials,
                now,
            )));
        }

        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let credential = &mut credentials[(start + offset) % n];
            if !credential.healthy {
                continue;
            }
            if let Some(until) = credential.disabled_until {
                if now < until {
                    continue;
                }
                info!(credential = %credential.label, "cooldown expired, credential available again");
                credential.disabled_until = None;
            }
            return Ok(credential.selected());
        }

        Err(Error::NoCredentialsAvailable(exhausted_message(
            &credentials,
            now,
        )))
    }

    /// Record a failed request made with `label`.
    ///
    /// - RateLimited → cooldown for `cooldown_secs`
    /// - 401/403 → disabled immediately
    /// - other statuses → disabled once `error_count` reaches `error_threshold`
    pub async fn mark_error(&self, label: &str, kind: FailureKind) {
        let mut credentials = self.credentials.write().await;
        let Some(credential) = credentials.iter_mut().find(|c| c.label == label) else {
            warn!(credential = label, "mark_error for unknown credential");
            return;
        };

        credential.error_count += 1;
        credential.last_error_kind = Some(kind);
        metrics::counter!("llm_credential_errors_total", "kind" => kind.label()).increment(1);

        match kind {
            FailureKind::RateLimited => {
                let cooldown = Duration::from_secs(self.config.cooldown_secs);
                credential.disabled_until = Some(Instant::now() + cooldown);
                info!(
                    credential = label,
                    cooldown_secs = cooldown.as_secs(),
                    "credential entering cooldown (rate limited)"
                );
            }
            kind if kind.is_permanent() => {
                credential.healthy = false;
                warn!(credential = label, kind = %kind.label(), "credential disabled (rejected by upstream)");
            }
            kind => {
                if credential.error_count >= self.config.error_threshold {
                    credential.healthy = false;
                    warn!(
                        credential = label,
                        kind = %kind.label(),
                        errors = credential.error_count,
                        "credential disabled (error threshold reached)"
                    );
                } else {
                    debug!(
                        credential = label,
                        kind = %kind.label(),
                        errors = credential.error_count,
                        "credential error recorded"
                    );
                }
            }
        }
    }

    /// Record a successful request: the error counter starts over.
    pub async fn mark_success(&self, label: &str) {
        let mut credentials = self.credentials.write().await;
        if let Some(credential) = credentials.iter_mut().find(|c| c.label == label) {
            credential.error_count = 0;
        }
    }

    /// Pin selection to one credential (operator control).
    pub async fn enable_manual_override(&self, label: &str) -> Result<()> {
        let credentials = self.credentials.read().await;
        if !credentials.iter().any(|c| c.label == label) {
            return Err(Error::NotFound(label.to_string()));
        }
        *self.pinned.write().await = Some(label.to_string());
        info!(credential = label, "manual credential override enabled");
        Ok(())
    }

    /// Return to automatic round-robin rotation.
    pub async fn disable_manual_override(&self) {
        if self.pinned.write().await.take().is_some() {
            info!("manual credential override disabled, automatic rotation resumed");
        }
    }

    /// Label of the pinned credential, if a manual override is active.
    pub async fn manual_override(&self) -> Option<String> {
        self.pinned.read().await.clone()
    }

    /// Re-enable a disabled credential and clear its error state.
    pub async fn restore(&self, label: &str) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .iter_mut()
            .find(|c| c.label == label)
            .ok_or_else(|| Error::NotFound(label.to_string()))?;
        credential.healthy = true;
        credential.error_count = 0;
        credential.disabled_until = None;
        info!(credential = label, "credential restored");
        Ok(())
    }

    /// Add a key at runtime. Returns its label.
    pub async fn add_credential(&self, key: Secret<String>) -> String {
        let mut credentials = self.credentials.write().await;
        let label = format!("key-{}", credentials.len());
        credentials.push(Credential {
            label: label.clone(),
            key,
            error_count: 0,
            last_error_kind: None,
            disabled_until: None,
            healthy: true,
        });
        info!(credential = %label, "credential added to pool");
        label
    }

    /// Snapshot of one credential's health.
    pub async fn info(&self, label: &str) -> Option<CredentialInfo> {
        let credentials = self.credentials.read().await;
        let now = Instant::now();
        credentials
            .iter()
            .find(|c| c.label == label)
            .map(|c| CredentialInfo {
                label: c.label.clone(),
                error_count: c.error_count,
                last_error_kind: c.last_error_kind,
                healthy: c.healthy,
                cooling_down: c.disabled_until.is_some_and(|until| now < until),
            })
    }

    /// Number of configured credentials, usable or not.
    pub async fn len(&self) -> usize {
        self.credentials.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.credentials.read().await.is_empty()
    }

    /// Pool health summary.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let credentials = self.credentials.read().await;
        let now = Instant::now();
        let counts = StatusCounts::of(&credentials, now);

        let entries: Vec<serde_json::Value> = credentials
            .iter()
            .map(|c| {
                let mut entry = serde_json::json!({
                    "label": c.label,
                    "key": c.key.masked(),
                    "status": c.status_label(now),
                    "error_count": c.error_count,
                    "last_error": c.last_error_kind.map(|k| k.label()),
                });
                if let Some(until) = c.disabled_until
                    && until > now
                {
                    entry["cooldown_remaining_secs"] =
                        serde_json::json!((until - now).as_secs());
                }
                entry
            })
            .collect();

        let status = if counts.available == counts.total && counts.total > 0 {
            "healthy"
        } else if counts.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": counts.total,
            "credentials_available": counts.available,
            "credentials_cooling_down": counts.cooling,
            "credentials_disabled": counts.disabled,
            "manual_override": self.pinned.read().await.clone(),
            "credentials": entries,
        })
    }
}

struct StatusCounts {
    total: usize,
    available: usize,
    cooling: usize,
    disabled: usize,
}

impl StatusCounts {
    fn of(credentials: &[Credential], now: Instant) -> Self {
        let mut counts = Self {
            total: credentials.len(),
            available: 0,
            cooling: 0,
            disabled: 0,
        };
        for c in credentials {
            match c.status_label(now) {
                "available" => counts.available += 1,
                "cooling_down" => counts.cooling += 1,
                _ => counts.disabled += 1,
            }
        }
        counts
    }
}

/// Build the exhausted error message JSON.
fn exhausted_message(credentials: &[Credential], now: Instant) -> String {
    let counts = StatusCounts::of(credentials, now);
    serde_json::json!({
        "error": {
            "type": "no_credentials_available",
            "message": "All credentials exhausted",
            "pool": {
                "credentials_total": counts.total,
                "credentials_available": counts.available,
                "credentials_cooling_down": counts.cooling,
                "credentials_disabled": counts.disabled
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(keys: &[&str], config: PoolConfig) -> CredentialPool {
        CredentialPool::new(
            keys.iter().map(|k| Secret::new(k.to_string())).collect(),
            config,
        )
    }

    fn config(error_threshold: u32, cooldown_secs: u64) -> PoolConfig {
        PoolConfig {
            error_threshold,
            cooldown_secs,
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_through_credentials() {
        let pool = test_pool(&["gsk_aaaaaaaaaa", "gsk_bbbbbbbbbb"], PoolConfig::default());

        let s1 = pool.next().await.unwrap();
        let s2 = pool.next().await.unwrap();
        let s3 = pool.next().await.unwrap();

        assert_eq!(s1.label, "key-0");
        assert_eq!(s2.label, "key-1");
        assert_eq!(s3.label, "key-0");
        assert_eq!(s1.key.expose(), "gsk_aaaaaaaaaa");
    }

    #[tokio::test]
    async fn rate_limited_credential_is_skipped_during_cooldown() {
        let pool = test_pool(&["a", "b", "c"], config(3, 600));
        pool.mark_error("key-0", FailureKind::RateLimited).await;

        for _ in 0..6 {
            let s = pool.next().await.unwrap();
            assert_ne!(s.label, "key-0");
        }
        let info = pool.info("key-0").await.unwrap();
        assert!(info.cooling_down);
        assert!(info.healthy);
        assert_eq!(info.last_error_kind, Some(FailureKind::RateLimited));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cooldown_returns_credential_to_rotation() {
        let pool = test_pool(&["a"], config(3, 60));
        pool.mark_error("key-0", FailureKind::RateLimited).await;
        assert!(pool.next().await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        let s = pool.next().await.unwrap();
        assert_eq!(s.label, "key-0");
        assert!(!pool.info("key-0").await.unwrap().cooling_down);
    }

    #[tokio::test]
    async fn threshold_of_hard_failures_disables_only_credential() {
        let pool = test_pool(&["a"], config(2, 60));

        pool.mark_error("key-0", FailureKind::Http(500)).await;
        assert!(pool.next().await.is_ok(), "one failure is below threshold");

        pool.mark_error("key-0", FailureKind::Http(500)).await;
        let err = pool.next().await.unwrap_err();
        assert!(matches!(err, Error::NoCredentialsAvailable(_)));
        assert!(!pool.info("key-0").await.unwrap().healthy);
    }

    #[tokio::test]
    async fn disabled_credential_skipped_by_rotation() {
        let pool = test_pool(&["a", "b"], config(1, 60));
        pool.mark_error("key-0", FailureKind::Http(502)).await;

        for _ in 0..4 {
            assert_eq!(pool.next().await.unwrap().label, "key-1");
        }
    }

    #[tokio::test]
    async fn unauthorized_disables_immediately() {
        let pool = test_pool(&["a", "b"], config(10, 60));
        pool.mark_error("key-1", FailureKind::Http(401)).await;

        let info = pool.info("key-1").await.unwrap();
        assert!(!info.healthy);
        assert_eq!(info.error_count, 1);
    }

    #[tokio::test]
    async fn mark_success_resets_error_count() {
        let pool = test_pool(&["a"], config(3, 60));
        pool.mark_error("key-0", FailureKind::Http(500)).await;
        pool.mark_error("key-0", FailureKind::Http(500)).await;
        pool.mark_success("key-0").await;

        assert_eq!(pool.info("key-0").await.unwrap().error_count, 0);

        // Two more failures stay below the threshold after the reset.
        pool.mark_error("key-0", FailureKind::Http(500)).await;
        pool.mark_error("key-0", FailureKind::Http(500)).await;
        assert!(pool.next().await.is_ok());
    }

    #[tokio::test]
    async fn empty_pool_returns_no_credentials() {
        let pool = test_pool(&[], PoolConfig::default());
        let err = pool.next().await.unwrap_err();
        assert!(err.to_string().contains("no_credentials_available"));
    }

    #[tokio::test]
    async fn exhausted_error_carries_counts() {
        let pool = test_pool(&["a", "b"], config(1, 600));
        pool.mark_error("key-0", FailureKind::RateLimited).await;
        pool.mark_error("key-1", FailureKind::Http(500)).await;

        let msg = pool.next().await.unwrap_err().to_string();
        let json: serde_json::Value = serde_json::from_str(
            msg.strip_prefix("no credentials available: ")
                .unwrap_or(&msg),
        )
        .unwrap();
        assert_eq!(json["error"]["pool"]["credentials_total"], 2);
        assert_eq!(json["error"]["pool"]["credentials_cooling_down"], 1);
        assert_eq!(json["error"]["pool"]["credentials_disabled"], 1);
    }

    #[tokio::test]
    async fn manual_override_pins_selection() {
        let pool = test_pool(&["a", "b", "c"], PoolConfig::default());
        pool.enable_manual_override("key-2").await.unwrap();

        for _ in 0..3 {
            assert_eq!(pool.next().await.unwrap().label, "key-2");
        }

        pool.disable_manual_override().await;
        let labels: Vec<String> = [
            pool.next().await.unwrap().label,
            pool.next().await.unwrap().label,
        ]
        .into();
        assert_ne!(labels[0], labels[1], "rotation resumes after override");
    }

    #[tokio::test]
    async fn manual_override_ignores_cooldown_but_not_disable() {
        let pool = test_pool(&["a", "b"], config(1, 600));
        pool.enable_manual_override("key-0").await.unwrap();

        pool.mark_error("key-0", FailureKind::RateLimited).await;
        assert_eq!(pool.next().await.unwrap().label, "key-0");

        pool.mark_error("key-0", FailureKind::Http(500)).await;
        assert!(pool.next().await.is_err());
    }

    #[tokio::test]
    async fn manual_override_unknown_label_rejected() {
        let pool = test_pool(&["a"], PoolConfig::default());
        let err = pool.enable_manual_override("key-9").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(pool.manual_override().await.is_none());
    }

    #[tokio::test]
    async fn restore_reenables_disabled_credential() {
        let pool = test_pool(&["a"], config(1, 60));
        pool.mark_error("key-0", FailureKind::Http(500)).await;
        assert!(pool.next().await.is_err());

        pool.restore("key-0").await.unwrap();
        assert_eq!(pool.next().await.unwrap().label, "key-0");
    }

    #[tokio::test]
    async fn add_credential_assigns_next_label() {
        let pool = test_pool(&["a"], PoolConfig::default());
        let label = pool.add_credential(Secret::new("b".into())).await;
        assert_eq!(label, "key-1");
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn health_reports_status_mapping() {
        let pool = test_pool(&["gsk_aaaaaaaaaa1111", "gsk_bbbbbbbbbb2222"], config(1, 600));
        assert_eq!(pool.health().await["status"], "healthy");

        pool.mark_error("key-0", FailureKind::RateLimited).await;
        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["credentials_cooling_down"], 1);
        let entry = &health["credentials"][0];
        assert_eq!(entry["status"], "cooling_down");
        assert_eq!(entry["key"], "...1111");
        assert!(entry["cooldown_remaining_secs"].as_u64().unwrap() > 0);

        pool.mark_error("key-1", FailureKind::Http(500)).await;
        assert_eq!(pool.health().await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn health_never_contains_raw_key() {
        let pool = test_pool(&["gsk_supersecretvalue"], PoolConfig::default());
        let rendered = pool.health().await.to_string();
        assert!(!rendered.contains("supersecret"));
    }

    #[test]
    fn failure_kind_labels() {
        assert_eq!(FailureKind::RateLimited.label(), "rate_limit");
        assert_eq!(FailureKind::Http(500).label(), "http_500");
        assert!(FailureKind::Http(403).is_permanent());
        assert!(!FailureKind::Http(500).is_permanent());
    }
}
