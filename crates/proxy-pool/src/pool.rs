//! Per-class rotation, scoring and fallback selection
//!
//! Each proxied class keeps a rotation state: the current endpoint and when it
//! was chosen. Within the rotation interval a healthy current endpoint is
//! reused as-is. Once the interval elapses, the endpoint turns unhealthy, or a
//! rotation is forced, every endpoint in the class is probed concurrently and
//! the best-scoring healthy one becomes current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint::{ProxyClass, ProxyEndpoint};
use crate::error::Result;
use crate::probe::{HttpProbe, Probe, ProbeResult};

/// Proxy pool configuration, usually deserialized from the `[proxies]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyPoolConfig {
    /// Mobile proxy connection strings (`user:pass@host:port`)
    #[serde(default)]
    pub mobile: Vec<String>,

    /// Residential proxy connection strings
    #[serde(default)]
    pub residential: Vec<String>,

    /// Minimum time a mobile endpoint stays current
    #[serde(default = "default_mobile_rotation_secs")]
    pub mobile_rotation_secs: u64,

    /// Minimum time a residential endpoint stays current
    #[serde(default = "default_residential_rotation_secs")]
    pub residential_rotation_secs: u64,

    /// URL fetched through each proxy by the HTTP probe
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Upper bound for a single probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Probes in flight at once
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    /// Period of the background health task
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Score of a perfect endpoint
    #[serde(default = "default_score_base")]
    pub score_base: f64,

    /// Response time (ms) worth one score point
    #[serde(default = "default_score_latency_divisor")]
    pub score_latency_divisor: f64,

    /// Score points lost per recorded error
    #[serde(default = "default_score_error_weight")]
    pub score_error_weight: f64,
}

fn default_mobile_rotation_secs() -> u64 {
    60
}

fn default_residential_rotation_secs() -> u64 {
    300
}

fn default_probe_url() -> String {
    "http://httpbin.org/ip".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_health_check_interval_secs() -> u64 {
    300
}

fn default_score_base() -> f64 {
    100.0
}

fn default_score_latency_divisor() -> f64 {
    100.0
}

fn default_score_error_weight() -> f64 {
    5.0
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            mobile: Vec::new(),
            residential: Vec::new(),
            mobile_rotation_secs: default_mobile_rotation_secs(),
            residential_rotation_secs: default_residential_rotation_secs(),
            probe_url: default_probe_url(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_concurrency: default_probe_concurrency(),
            health_check_interval_secs: default_health_check_interval_secs(),
            score_base: default_score_base(),
            score_latency_divisor: default_score_latency_divisor(),
            score_error_weight: default_score_error_weight(),
        }
    }
}

impl ProxyPoolConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    fn rotation_interval(&self, class: ProxyClass) -> Duration {
        match class {
            ProxyClass::Mobile => Duration::from_secs(self.mobile_rotation_secs),
            ProxyClass::Residential => Duration::from_secs(self.residential_rotation_secs),
            ProxyClass::Direct => Duration::ZERO,
        }
    }

    fn connection_strings(&self, class: ProxyClass) -> &[String] {
        match class {
            ProxyClass::Mobile => &self.mobile,
            ProxyClass::Residential => &self.residential,
            ProxyClass::Direct => &[],
        }
    }
}

/// The egress path chosen for one request. `endpoint == None` means direct.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    pub class: ProxyClass,
    pub endpoint: Option<ProxyEndpoint>,
}

impl ProxyRoute {
    pub fn direct() -> Self {
        Self {
            class: ProxyClass::Direct,
            endpoint: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.endpoint.is_none()
    }

    /// `mobile (host:port)` or `direct`, safe to log.
    pub fn describe(&self) -> String {
        match &self.endpoint {
            Some(ep) => format!("{} ({})", self.class, ep.address()),
            None => self.class.to_string(),
        }
    }
}

/// Rotation state of one proxied class.
struct ClassState {
    endpoints: Vec<ProxyEndpoint>,
    current: Option<usize>,
    last_rotated_at: Option<Instant>,
    rotation_interval: Duration,
}

impl ClassState {
    /// Current endpoint, if it may still be reused at `now`.
    fn sticky(&self, now: Instant) -> Option<&ProxyEndpoint> {
        let rotated = self.last_rotated_at?;
        let current = self.endpoints.get(self.current?)?;
        (current.healthy && now.duration_since(rotated) < self.rotation_interval).then_some(current)
    }

    fn find_mut(&mut self, url: &str) -> Option<&mut ProxyEndpoint> {
        self.endpoints.iter_mut().find(|ep| ep.url() == url)
    }
}

/// Pool of proxy endpoints shared by all in-flight requests.
///
/// Endpoint state sits behind an `RwLock` that is never held across a probe.
/// Rotations are serialized by a separate mutex so that concurrent callers
/// finding an expired class probe it once.
pub struct ProxyPool {
    classes: RwLock<HashMap<ProxyClass, ClassState>>,
    rotation: Mutex<()>,
    probe: Arc<dyn Probe>,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    /// Build a pool probing with [`HttpProbe`] against `config.probe_url`.
    pub fn new(config: ProxyPoolConfig) -> Result<Self> {
        let probe = Arc::new(HttpProbe::new(config.probe_url.clone()));
        Self::with_probe(config, probe)
    }

    /// Build a pool with a custom probe.
    ///
    /// Duplicate connection strings within a class are collapsed into one
    /// endpoint.
    pub fn with_probe(config: ProxyPoolConfig, probe: Arc<dyn Probe>) -> Result<Self> {
        let mut classes = HashMap::new();
        for class in ProxyClass::PROXIED {
            let mut endpoints: Vec<ProxyEndpoint> = Vec::new();
            for connection in config.connection_strings(class) {
                let endpoint = ProxyEndpoint::parse(connection, class)?;
                if endpoints.iter().all(|ep| ep.url() != endpoint.url()) {
                    endpoints.push(endpoint);
                }
            }
            classes.insert(
                class,
                ClassState {
                    endpoints,
                    current: None,
                    last_rotated_at: None,
                    rotation_interval: config.rotation_interval(class),
                },
            );
        }

        info!(
            mobile = classes[&ProxyClass::Mobile].endpoints.len(),
            residential = classes[&ProxyClass::Residential].endpoints.len(),
            mobile_rotation_secs = config.mobile_rotation_secs,
            residential_rotation_secs = config.residential_rotation_secs,
            "proxy pool initialized"
        );

        Ok(Self {
            classes: RwLock::new(classes),
            rotation: Mutex::new(()),
            probe,
            config,
        })
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Number of unique endpoints across all classes.
    pub async fn len(&self) -> usize {
        self.classes
            .read()
            .await
            .values()
            .map(|s| s.endpoints.len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Score of an endpoint: higher is better.
    ///
    /// `base - response_time_ms / latency_divisor - error_count * error_weight`.
    /// An endpoint never probed successfully is charged the full probe timeout.
    pub fn score_of(&self, endpoint: &ProxyEndpoint) -> f64 {
        let response_time = endpoint
            .response_time_ms()
            .unwrap_or(self.config.probe_timeout_ms) as f64;
        self.config.score_base
            - response_time / self.config.score_latency_divisor
            - f64::from(endpoint.error_count()) * self.config.score_error_weight
    }

    /// Endpoint to use for `class`, or `None` for direct or when no endpoint
    /// in the class is healthy.
    pub async fn get_for_class(&self, class: ProxyClass) -> Option<ProxyEndpoint> {
        if class == ProxyClass::Direct {
            return None;
        }
        if let Some(ep) = self.sticky(class).await {
            return Some(ep);
        }

        let _rotating = self.rotation.lock().await;
        // Another caller may have rotated while we waited
        if let Some(ep) = self.sticky(class).await {
            return Some(ep);
        }

        let snapshot = self.snapshot(class).await;
        if snapshot.is_empty() {
            return None;
        }
        let results = self.probe_endpoints(&snapshot).await;

        let mut classes = self.classes.write().await;
        let state = classes.get_mut(&class)?;
        for (_, url, result) in results {
            if let Some(ep) = state.find_mut(&url) {
                apply_probe(ep, result);
            }
        }

        let best = self.best_index(&state.endpoints);
        match best {
            Some(index) => {
                let previous = state.current.replace(index);
                state.last_rotated_at = Some(Instant::now());
                let chosen = state.endpoints[index].clone();
                if previous != Some(index) {
                    info!(
                        class = %class,
                        proxy = chosen.address(),
                        score = self.score_of(&chosen),
                        "rotated to proxy endpoint"
                    );
                } else {
                    debug!(class = %class, proxy = chosen.address(), "kept proxy endpoint after rotation");
                }
                Some(chosen)
            }
            None => {
                state.current = None;
                state.last_rotated_at = None;
                warn!(class = %class, endpoints = state.endpoints.len(), "no healthy proxy in class");
                None
            }
        }
    }

    /// Route for a request preferring `preferred`.
    ///
    /// Tries the preferred class, then the other proxied class, then direct.
    /// Never fails.
    pub async fn get_with_fallback(&self, preferred: ProxyClass) -> ProxyRoute {
        for &class in preferred.fallback_order() {
            if class == ProxyClass::Direct {
                break;
            }
            if let Some(endpoint) = self.get_for_class(class).await {
                if class != preferred {
                    warn!(preferred = %preferred, using = %class, "falling back to other proxy class");
                }
                return ProxyRoute {
                    class,
                    endpoint: Some(endpoint),
                };
            }
        }
        if preferred != ProxyClass::Direct {
            warn!(preferred = %preferred, "all proxies failed, using direct egress");
        }
        ProxyRoute::direct()
    }

    /// Probe one endpoint now and record the result. Returns whether it is healthy.
    pub async fn health_check(&self, endpoint: &ProxyEndpoint, timeout: Duration) -> bool {
        let result = run_probe(self.probe.as_ref(), endpoint, timeout).await;
        let healthy = result.is_ok();
        let mut classes = self.classes.write().await;
        if let Some(ep) = classes
            .get_mut(&endpoint.class())
            .and_then(|s| s.find_mut(endpoint.url()))
        {
            apply_probe(ep, result);
        }
        healthy
    }

    /// Probe every endpoint in every class. Returns the number found healthy.
    pub async fn check_all(&self) -> usize {
        let mut snapshot = Vec::new();
        for class in ProxyClass::PROXIED {
            snapshot.extend(self.snapshot(class).await);
        }
        if snapshot.is_empty() {
            return 0;
        }
        let results = self.probe_endpoints(&snapshot).await;
        let healthy = results.iter().filter(|(_, _, r)| r.is_ok()).count();

        let mut classes = self.classes.write().await;
        for (class, url, result) in results {
            if let Some(ep) = classes.get_mut(&class).and_then(|s| s.find_mut(&url)) {
                apply_probe(ep, result);
            }
        }
        info!(checked = snapshot.len(), healthy, "proxy health check complete");
        healthy
    }

    /// Clear the rotation timestamp so the next selection re-evaluates the class.
    pub async fn force_rotate(&self, class: ProxyClass) {
        if let Some(state) = self.classes.write().await.get_mut(&class) {
            state.last_rotated_at = None;
            info!(class = %class, "forced proxy rotation");
        }
    }

    /// Record a request-level failure through `endpoint`: the error counts
    /// toward its score and it is unhealthy until probed again.
    pub async fn mark_failure(&self, endpoint: &ProxyEndpoint, detail: &str) {
        let mut classes = self.classes.write().await;
        if let Some(ep) = classes
            .get_mut(&endpoint.class())
            .and_then(|s| s.find_mut(endpoint.url()))
        {
            ep.record_failure(detail.to_string());
            warn!(
                class = %endpoint.class(),
                proxy = ep.address(),
                error_count = ep.error_count(),
                error = detail,
                "proxy marked unhealthy after request failure"
            );
        }
    }

    /// Current health view of an endpoint, looked up by address and class.
    pub async fn endpoint(&self, class: ProxyClass, address: &str) -> Option<ProxyEndpoint> {
        self.classes
            .read()
            .await
            .get(&class)?
            .endpoints
            .iter()
            .find(|ep| ep.address() == address)
            .cloned()
    }

    /// Pool status for the health endpoint. Endpoints appear as `host:port` only.
    pub async fn status(&self) -> serde_json::Value {
        let classes = self.classes.read().await;
        let now = Instant::now();
        let mut total = 0;
        let mut healthy = 0;
        let mut by_class = serde_json::Map::new();

        for class in ProxyClass::PROXIED {
            let Some(state) = classes.get(&class) else {
                continue;
            };
            total += state.endpoints.len();
            healthy += state.endpoints.iter().filter(|ep| ep.healthy()).count();

            let endpoints: Vec<serde_json::Value> = state
                .endpoints
                .iter()
                .map(|ep| {
                    serde_json::json!({
                        "address": ep.address(),
                        "healthy": ep.healthy(),
                        "response_time_ms": ep.response_time_ms(),
                        "error_count": ep.error_count(),
                        "score": self.score_of(ep),
                        "last_error": ep.last_error(),
                        "last_checked_secs_ago": ep
                            .last_checked_at()
                            .map(|at| now.duration_since(at).as_secs()),
                    })
                })
                .collect();

            by_class.insert(
                class.to_string(),
                serde_json::json!({
                    "current": state
                        .current
                        .and_then(|i| state.endpoints.get(i))
                        .map(|ep| ep.address()),
                    "rotation_interval_secs": state.rotation_interval.as_secs(),
                    "last_rotation_secs_ago": state
                        .last_rotated_at
                        .map(|at| now.duration_since(at).as_secs()),
                    "endpoints": endpoints,
                }),
            );
        }

        serde_json::json!({
            "endpoints_total": total,
            "endpoints_healthy": healthy,
            "classes": by_class,
        })
    }

    async fn sticky(&self, class: ProxyClass) -> Option<ProxyEndpoint> {
        let classes = self.classes.read().await;
        classes.get(&class)?.sticky(Instant::now()).cloned()
    }

    async fn snapshot(&self, class: ProxyClass) -> Vec<ProxyEndpoint> {
        self.classes
            .read()
            .await
            .get(&class)
            .map(|s| s.endpoints.clone())
            .unwrap_or_default()
    }

    /// Probe endpoints concurrently, bounded by `probe_concurrency`.
    async fn probe_endpoints(
        &self,
        endpoints: &[ProxyEndpoint],
    ) -> Vec<(ProxyClass, String, ProbeResult)> {
        let timeout = self.config.probe_timeout();
        let probe = self.probe.as_ref();
        let probes: Vec<BoxFuture<'_, (ProxyClass, String, ProbeResult)>> = endpoints
            .iter()
            .map(|ep| {
                async move {
                    let result = run_probe(probe, ep, timeout).await;
                    (ep.class(), ep.url().to_string(), result)
                }
                .boxed()
            })
            .collect();
        stream::iter(probes)
            .buffer_unordered(self.config.probe_concurrency.max(1))
            .collect()
            .await
    }

    /// Best healthy endpoint: highest score, ties to the fewest errors.
    fn best_index(&self, endpoints: &[ProxyEndpoint]) -> Option<usize> {
        let mut best: Option<(usize, f64, u32)> = None;
        for (i, ep) in endpoints.iter().enumerate().filter(|(_, ep)| ep.healthy()) {
            let score = self.score_of(ep);
            let better = match best {
                None => true,
                Some((_, best_score, best_errors)) => {
                    score > best_score || (score == best_score && ep.error_count() < best_errors)
                }
            };
            if better {
                best = Some((i, score, ep.error_count()));
            }
        }
        best.map(|(i, _, _)| i)
    }
}

/// Run one probe bounded by `timeout`, and count it.
async fn run_probe(probe: &dyn Probe, endpoint: &ProxyEndpoint, timeout: Duration) -> ProbeResult {
    let result = match tokio::time::timeout(timeout, probe.probe(endpoint, timeout)).await {
        Ok(result) => result,
        Err(_) => Err("timeout".to_string()),
    };
    let outcome = if result.is_ok() { "healthy" } else { "unhealthy" };
    metrics::counter!(
        "llm_proxy_health_checks_total",
        "class" => endpoint.class().as_str(),
        "result" => outcome
    )
    .increment(1);
    match &result {
        Ok(rtt) => debug!(
            class = %endpoint.class(),
            proxy = endpoint.address(),
            response_time_ms = rtt.as_millis() as u64,
            "proxy healthy"
        ),
        Err(e) => debug!(
            class = %endpoint.class(),
            proxy = endpoint.address(),
            error = %e,
            "proxy probe failed"
        ),
    }
    result
}

fn apply_probe(endpoint: &mut ProxyEndpoint, result: ProbeResult) {
    match result {
        Ok(rtt) => endpoint.record_success(rtt.as_millis() as u64),
        Err(e) => endpoint.record_failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeFuture;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe answering from a table keyed by `host:port`. Unknown addresses fail.
    #[derive(Default)]
    struct FakeProbe {
        answers: StdMutex<HashMap<String, ProbeResult>>,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn set(&self, address: &str, result: ProbeResult) {
            self.answers
                .lock()
                .unwrap()
                .insert(address.to_string(), result);
        }

        fn ok(&self, address: &str, ms: u64) {
            self.set(address, Ok(Duration::from_millis(ms)));
        }

        fn fail(&self, address: &str) {
            self.set(address, Err("connection failed".into()));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Probe for FakeProbe {
        fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint, _timeout: Duration) -> ProbeFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .answers
                .lock()
                .unwrap()
                .get(endpoint.address())
                .cloned()
                .unwrap_or_else(|| Err("unreachable".into()));
            Box::pin(async move { result })
        }
    }

    fn config(mobile: &[&str], residential: &[&str]) -> ProxyPoolConfig {
        ProxyPoolConfig {
            mobile: mobile.iter().map(|s| s.to_string()).collect(),
            residential: residential.iter().map(|s| s.to_string()).collect(),
            ..ProxyPoolConfig::default()
        }
    }

    fn pool(config: ProxyPoolConfig, probe: &Arc<FakeProbe>) -> ProxyPool {
        ProxyPool::with_probe(config, probe.clone()).unwrap()
    }

    #[tokio::test]
    async fn duplicate_connection_strings_collapse() {
        let probe = Arc::new(FakeProbe::default());
        let pool = pool(
            config(&["u:p@m1.example:823", "u:p@m1.example:823", "u:p@m1.example:823"], &[]),
            &probe,
        );
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_connection_string_rejected() {
        let probe = Arc::new(FakeProbe::default());
        let result = ProxyPool::with_probe(config(&["u:p@"], &[]), probe);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn direct_class_has_no_endpoint() {
        let probe = Arc::new(FakeProbe::default());
        let pool = pool(config(&["m1.example:823"], &[]), &probe);
        assert!(pool.get_for_class(ProxyClass::Direct).await.is_none());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn picks_lowest_latency_endpoint() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 900);
        probe.ok("m2.example:823", 150);
        probe.ok("m3.example:823", 400);
        let pool = pool(
            config(&["m1.example:823", "m2.example:823", "m3.example:823"], &[]),
            &probe,
        );

        let ep = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(ep.address(), "m2.example:823");
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn current_endpoint_is_sticky_within_interval() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 300);
        probe.ok("m2.example:823", 100);
        let pool = pool(config(&["m1.example:823", "m2.example:823"], &[]), &probe);

        let first = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(first.address(), "m2.example:823");

        // m1 gets faster, but the rotation interval has not elapsed
        probe.ok("m1.example:823", 10);
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(second.address(), first.address());
        assert_eq!(probe.calls(), 2, "sticky selection must not probe");

        tokio::time::advance(Duration::from_secs(31)).await;
        let third = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(third.address(), "m1.example:823");
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn force_rotate_reevaluates_immediately() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 300);
        probe.ok("m2.example:823", 100);
        let pool = pool(config(&["m1.example:823", "m2.example:823"], &[]), &probe);

        assert_eq!(
            pool.get_for_class(ProxyClass::Mobile).await.unwrap().address(),
            "m2.example:823"
        );
        probe.fail("m2.example:823");
        pool.force_rotate(ProxyClass::Mobile).await;

        let ep = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(ep.address(), "m1.example:823");
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_current_endpoint_is_replaced() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 300);
        probe.ok("m2.example:823", 100);
        let pool = pool(config(&["m1.example:823", "m2.example:823"], &[]), &probe);

        let ep = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        pool.mark_failure(&ep, "proxy connect refused").await;
        probe.fail("m2.example:823");

        let replacement = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(replacement.address(), "m1.example:823");

        let failed = pool
            .endpoint(ProxyClass::Mobile, "m2.example:823")
            .await
            .unwrap();
        assert!(!failed.healthy());
        assert_eq!(failed.error_count(), 2, "request failure plus failed probe");
    }

    #[tokio::test]
    async fn score_penalizes_latency_and_errors() {
        let probe = Arc::new(FakeProbe::default());
        let pool = pool(config(&["m1.example:823"], &[]), &probe);
        let mut ep = ProxyEndpoint::parse("m1.example:823", ProxyClass::Mobile).unwrap();

        ep.record_success(500);
        assert_eq!(pool.score_of(&ep), 95.0);
        ep.record_failure("timeout".into());
        ep.record_failure("timeout".into());
        ep.record_success(500);
        assert_eq!(pool.score_of(&ep), 85.0);
    }

    #[tokio::test]
    async fn equal_scores_prefer_fewer_errors() {
        let probe = Arc::new(FakeProbe::default());
        // Weight of 0 makes errors irrelevant to the score, leaving only the tie-break
        let cfg = ProxyPoolConfig {
            score_error_weight: 0.0,
            ..config(&["m1.example:823", "m2.example:823"], &[])
        };
        let pool = pool(cfg, &probe);

        probe.fail("m1.example:823");
        probe.fail("m2.example:823");
        pool.check_all().await;
        probe.fail("m1.example:823");
        probe.ok("m2.example:823", 200);
        pool.check_all().await;

        // m1: 2 errors, m2: 1 error, both now 200 ms
        probe.ok("m1.example:823", 200);
        let ep = pool.get_for_class(ProxyClass::Mobile).await.unwrap();
        assert_eq!(ep.address(), "m2.example:823");
    }

    #[tokio::test]
    async fn check_all_updates_address_shared_by_both_classes() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("shared.example:823", 300);
        let pool = pool(
            config(&["shared.example:823"], &["shared.example:823"]),
            &probe,
        );

        assert_eq!(pool.check_all().await, 2);
        for class in ProxyClass::PROXIED {
            let ep = pool.endpoint(class, "shared.example:823").await.unwrap();
            assert!(ep.healthy(), "{class} copy not updated");
            assert_eq!(ep.response_time_ms(), Some(300), "{class} copy not updated");
        }
    }

    #[tokio::test]
    async fn falls_back_to_other_class() {
        let probe = Arc::new(FakeProbe::default());
        probe.fail("m1.example:823");
        probe.ok("r1.example:823", 200);
        let pool = pool(config(&["m1.example:823"], &["r1.example:823"]), &probe);

        let route = pool.get_with_fallback(ProxyClass::Mobile).await;
        assert_eq!(route.class, ProxyClass::Residential);
        assert_eq!(route.endpoint.unwrap().address(), "r1.example:823");
    }

    #[tokio::test]
    async fn all_classes_failing_yields_direct() {
        let probe = Arc::new(FakeProbe::default());
        probe.fail("m1.example:823");
        probe.fail("r1.example:823");
        let pool = pool(config(&["m1.example:823"], &["r1.example:823"]), &probe);

        let route = pool.get_with_fallback(ProxyClass::Mobile).await;
        assert!(route.is_direct());
        assert_eq!(route.class, ProxyClass::Direct);
        assert_eq!(route.describe(), "direct");
    }

    #[tokio::test]
    async fn empty_pool_yields_direct() {
        let probe = Arc::new(FakeProbe::default());
        let pool = pool(ProxyPoolConfig::default(), &probe);
        assert!(pool.is_empty().await);
        assert!(pool.get_with_fallback(ProxyClass::Residential).await.is_direct());
    }

    #[tokio::test]
    async fn direct_preference_skips_proxies() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 100);
        let pool = pool(config(&["m1.example:823"], &[]), &probe);
        assert!(pool.get_with_fallback(ProxyClass::Direct).await.is_direct());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn health_check_records_result() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 250);
        let pool = pool(config(&["m1.example:823"], &[]), &probe);
        let ep = pool.endpoint(ProxyClass::Mobile, "m1.example:823").await.unwrap();

        assert!(pool.health_check(&ep, Duration::from_secs(1)).await);
        let ep = pool.endpoint(ProxyClass::Mobile, "m1.example:823").await.unwrap();
        assert_eq!(ep.response_time_ms(), Some(250));
        assert!(ep.last_checked_at().is_some());

        probe.fail("m1.example:823");
        assert!(!pool.health_check(&ep, Duration::from_secs(1)).await);
        let ep = pool.endpoint(ProxyClass::Mobile, "m1.example:823").await.unwrap();
        assert!(!ep.healthy());
        assert_eq!(ep.last_error(), Some("connection failed"));
    }

    /// Probe that never answers.
    struct HangingProbe;

    impl Probe for HangingProbe {
        fn probe<'a>(&'a self, _endpoint: &'a ProxyEndpoint, _timeout: Duration) -> ProbeFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_marks_unhealthy() {
        let pool =
            ProxyPool::with_probe(config(&["m1.example:823"], &[]), Arc::new(HangingProbe)).unwrap();
        let route = pool.get_with_fallback(ProxyClass::Mobile).await;
        assert!(route.is_direct());

        let ep = pool.endpoint(ProxyClass::Mobile, "m1.example:823").await.unwrap();
        assert_eq!(ep.last_error(), Some("timeout"));
    }

    #[tokio::test]
    async fn status_reports_addresses_only() {
        let probe = Arc::new(FakeProbe::default());
        probe.ok("m1.example:823", 120);
        let pool = pool(
            config(&["user:topsecret@m1.example:823"], &["user:topsecret@r1.example:823"]),
            &probe,
        );
        pool.get_for_class(ProxyClass::Mobile).await;

        let status = pool.status().await;
        assert_eq!(status["endpoints_total"], 2);
        assert_eq!(status["classes"]["mobile"]["current"], "m1.example:823");
        assert_eq!(status["classes"]["mobile"]["rotation_interval_secs"], 60);
        assert_eq!(status["classes"]["residential"]["rotation_interval_secs"], 300);
        assert!(status["classes"]["residential"]["current"].is_null());
        assert!(!status.to_string().contains("topsecret"));
    }
}
