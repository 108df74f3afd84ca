//! Proxy pool for outbound LLM requests
//!
//! Endpoints are grouped by class (mobile, residential, direct). Each class
//! keeps a current endpoint that is reused until its rotation interval
//! elapses or it turns unhealthy. On rotation every endpoint in the class is
//! probed and the best-scoring healthy one becomes current.
//!
//! Selection order for a request:
//! 1. Preferred class (sticky current endpoint, or re-evaluated after rotation)
//! 2. The other proxied class
//! 3. Direct egress (no proxy), which always succeeds

pub mod endpoint;
pub mod error;
pub mod health;
pub mod pool;
pub mod probe;

pub use endpoint::{ProxyClass, ProxyEndpoint};
pub use error::{Error, Result};
pub use health::spawn_health_task;
pub use pool::{ProxyPool, ProxyPoolConfig, ProxyRoute};
pub use probe::{HttpProbe, Probe, ProbeFuture};
