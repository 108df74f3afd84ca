//! Liveness probes for proxy endpoints

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;

use crate::endpoint::ProxyEndpoint;

/// Round-trip time of a successful probe, or the failure detail.
pub type ProbeResult = std::result::Result<Duration, String>;

/// Boxed probe future, so probes can live behind `Arc<dyn Probe>`.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Checks whether traffic can flow through an endpoint.
///
/// Implementations must finish within `timeout`; the pool also enforces it.
pub trait Probe: Send + Sync {
    fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint, timeout: Duration) -> ProbeFuture<'a>;
}

/// Plain HTTP GET through the proxy to a probe URL. Any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    probe_url: String,
}

impl HttpProbe {
    pub fn new(probe_url: impl Into<String>) -> Self {
        Self {
            probe_url: probe_url.into(),
        }
    }

    pub fn probe_url(&self) -> &str {
        &self.probe_url
    }

    async fn check(&self, endpoint: &ProxyEndpoint, timeout: Duration) -> ProbeResult {
        let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|e| e.to_string())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build probe client: {e}"))?;

        let start = Instant::now();
        let response = client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(probe_error)?;
        let elapsed = start.elapsed();

        if response.status().is_success() {
            Ok(elapsed)
        } else {
            Err(format!("HTTP {}", response.status().as_u16()))
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new("http://httpbin.org/ip")
    }
}

impl Probe for HttpProbe {
    fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint, timeout: Duration) -> ProbeFuture<'a> {
        Box::pin(self.check(endpoint, timeout))
    }
}

/// Short failure detail without the proxy URL (which holds credentials).
fn probe_error(error: reqwest::Error) -> String {
    if error.is_timeout() {
        "timeout".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else {
        error.without_url().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ProxyClass;
    use axum::Router;
    use axum::http::StatusCode;

    /// Start a plain HTTP server that answers every path; acting as a forward
    /// proxy it receives absolute-form requests for the probe URL.
    async fn start_fake_proxy(status: StatusCode) -> std::net::SocketAddr {
        let app = Router::new().fallback(move || async move { (status, "ok") });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn probe_succeeds_through_live_proxy() {
        let addr = start_fake_proxy(StatusCode::OK).await;
        let endpoint = ProxyEndpoint::parse(&addr.to_string(), ProxyClass::Mobile).unwrap();
        let probe = HttpProbe::new("http://probe.invalid/ip");

        let rtt = probe
            .probe(&endpoint, Duration::from_secs(5))
            .await
            .expect("probe should pass through the proxy");
        assert!(rtt < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn probe_reports_non_success_status() {
        let addr = start_fake_proxy(StatusCode::PROXY_AUTHENTICATION_REQUIRED).await;
        let endpoint = ProxyEndpoint::parse(&addr.to_string(), ProxyClass::Mobile).unwrap();
        let probe = HttpProbe::new("http://probe.invalid/ip");

        let err = probe
            .probe(&endpoint, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, "HTTP 407");
    }

    #[tokio::test]
    async fn probe_fails_on_closed_port() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint =
            ProxyEndpoint::parse(&format!("user:hunter2@{addr}"), ProxyClass::Residential).unwrap();
        let err = HttpProbe::new("http://probe.invalid/ip")
            .probe(&endpoint, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(!err.contains("hunter2"), "credentials leaked: {err}");
    }
}
