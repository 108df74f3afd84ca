//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the LLM_API_KEYS env var or keys_file, never
//! stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use context_budget::BudgetConfig;
use credential_pool::PoolConfig;
use proxy_pool::{ProxyClass, ProxyEndpoint, ProxyPoolConfig};
use request_router::{ClientConfig, RouterConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub proxies: ProxyPoolConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential pool settings plus where the keys come from
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(flatten)]
    pub pool: PoolConfig,
    /// File with one API key per line; `#` starts a comment
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. LLM_API_KEYS env var (comma separated)
    /// 2. keys_file path from config
    ///
    /// LLM_MOBILE_PROXIES / LLM_RESIDENTIAL_PROXIES replace the proxy lists.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(list) = std::env::var("LLM_MOBILE_PROXIES") {
            config.proxies.mobile = split_list(&list);
        }
        if let Ok(list) = std::env::var("LLM_RESIDENTIAL_PROXIES") {
            config.proxies.residential = split_list(&list);
        }

        config.validate()?;

        if let Ok(keys) = std::env::var("LLM_API_KEYS") {
            config.credentials.keys = split_list(&keys).into_iter().map(Secret::new).collect();
        } else if let Some(ref keys_file) = config.credentials.keys_file {
            let contents =
                std::fs::read_to_string(keys_file).map_err(|source| common::Error::KeysFile {
                    path: keys_file.clone(),
                    source,
                })?;
            config.credentials.keys = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| Secret::new(line.to_owned()))
                .collect();
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.router.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "router.base_url must start with http:// or https://, got: {base_url}"
            )));
        }

        if self.router.timeout_secs == 0 {
            return Err(common::Error::Config(
                "router.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }

        if self.credentials.pool.error_threshold == 0 {
            return Err(common::Error::Config(
                "credentials.error_threshold must be greater than 0".into(),
            ));
        }

        if self.proxies.health_check_interval_secs == 0 {
            return Err(common::Error::Config(
                "proxies.health_check_interval_secs must be greater than 0".into(),
            ));
        }

        let lists = [
            (ProxyClass::Mobile, &self.proxies.mobile),
            (ProxyClass::Residential, &self.proxies.residential),
        ];
        for (class, list) in lists {
            for connection in list {
                ProxyEndpoint::parse(connection, class)
                    .map_err(|e| common::Error::Config(format!("proxies.{class}: {e}")))?;
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("llm-dispatch.toml")
    }
}

/// Comma separated list, entries trimmed, empties dropped.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}
