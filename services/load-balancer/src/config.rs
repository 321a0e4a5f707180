//! Configuration types and loading
//!
//! Config precedence: CLI arg > CONFIG_PATH env var > default file name.
//! Subscription credentials come either inline (`credential`) or from an env
//! var named by `credential_env`; they are resolved and classified at load time
//! so a bad credential fails startup instead of the first request.

use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use subscription_pool::{Credential, MAX_COOLDOWN, Pool, PoolSettings, SubscriptionDescriptor};
use tracing::warn;

use crate::error::{Error, Result};

/// Upper bound on `max_concurrent` per subscription.
const MAX_CONCURRENT_LIMIT: u32 = 50;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Resolved from `subscriptions` by [`Config::load`].
    #[serde(skip)]
    pub descriptors: Vec<SubscriptionDescriptor>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Separate listener for the administrative API
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown(),
            burst_limit: default_burst_limit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoutingConfig {
    /// Rate-limit failovers after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_quota_weight")]
    pub quota_weight: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            quota_weight: default_quota_weight(),
        }
    }
}

/// One `[[subscriptions]]` entry as written in the file
#[derive(Deserialize)]
pub struct SubscriptionConfig {
    pub name: String,
    #[serde(default)]
    pub credential: Option<String>,
    /// Name of an env var holding the credential
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("name", &self.name)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("credential_env", &self.credential_env)
            .field("max_concurrent", &self.max_concurrent)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_upstream_url() -> String {
    "https://api.anthropic.com".into()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_cooldown() -> u64 {
    60
}

fn default_burst_limit() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    subscription_pool::DEFAULT_MAX_RETRIES
}

fn default_quota_weight() -> f64 {
    subscription_pool::DEFAULT_QUOTA_WEIGHT
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_priority() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file, validate it and resolve credentials.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        warn_if_world_readable(path);
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.descriptors = config.resolve_descriptors()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }
        if self.proxy.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be greater than 0".into()));
        }
        if self.proxy.max_connections == 0 {
            return Err(Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.rate_limit.cooldown_seconds == 0 {
            return Err(Error::Config(
                "cooldown_seconds must be greater than 0".into(),
            ));
        }
        if self.rate_limit.cooldown_seconds > MAX_COOLDOWN.as_secs() {
            return Err(Error::Config(format!(
                "cooldown_seconds must be at most {}, got: {}",
                MAX_COOLDOWN.as_secs(),
                self.rate_limit.cooldown_seconds
            )));
        }
        if self.rate_limit.burst_limit == 0 {
            return Err(Error::Config("burst_limit must be greater than 0".into()));
        }
        if !(0.0..1.0).contains(&self.routing.quota_weight) {
            return Err(Error::Config(format!(
                "quota_weight must be in [0, 1), got: {}",
                self.routing.quota_weight
            )));
        }
        if self.subscriptions.is_empty() {
            return Err(Error::Config(
                "at least one [[subscriptions]] entry is required".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for sub in &self.subscriptions {
            if sub.name.trim().is_empty() {
                return Err(Error::Config("subscription name must not be empty".into()));
            }
            if !seen.insert(sub.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate subscription name: {}",
                    sub.name
                )));
            }
            if !(1..=MAX_CONCURRENT_LIMIT).contains(&sub.max_concurrent) {
                return Err(Error::Config(format!(
                    "{}: max_concurrent must be between 1 and {MAX_CONCURRENT_LIMIT}, got: {}",
                    sub.name, sub.max_concurrent
                )));
            }
        }
        Ok(())
    }

    /// Resolve each subscription's secret and classify its header scheme.
    fn resolve_descriptors(&self) -> Result<Vec<SubscriptionDescriptor>> {
        self.subscriptions
            .iter()
            .map(|sub| {
                let raw = match (&sub.credential, &sub.credential_env) {
                    (Some(inline), None) => inline.clone(),
                    (None, Some(var)) => std::env::var(var).map_err(|_| {
                        Error::Config(format!(
                            "{}: credential_env {var} is not set",
                            sub.name
                        ))
                    })?,
                    (Some(_), Some(_)) => {
                        return Err(Error::Config(format!(
                            "{}: set either credential or credential_env, not both",
                            sub.name
                        )));
                    }
                    (None, None) => {
                        return Err(Error::Config(format!(
                            "{}: credential or credential_env is required",
                            sub.name
                        )));
                    }
                };
                let credential = Credential::parse(&raw)
                    .map_err(|e| Error::Config(format!("{}: {e}", sub.name)))?;
                Ok(SubscriptionDescriptor {
                    name: sub.name.clone(),
                    credential,
                    max_concurrent: sub.max_concurrent,
                    priority: sub.priority,
                    enabled: sub.enabled,
                })
            })
            .collect()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            cooldown: Duration::from_secs(self.rate_limit.cooldown_seconds),
            burst_limit: self.rate_limit.burst_limit,
            quota_weight: self.routing.quota_weight,
        }
    }

    /// Build the routing pool from the resolved subscriptions.
    pub fn build_pool(&self) -> Result<Pool> {
        Ok(Pool::new(self.descriptors.clone(), self.pool_settings())?)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("anthropic-load-balancer.toml")
    }
}

/// The file holds credentials; complain if anyone on the host can read it.
/// Returns whether the warning fired.
#[cfg(unix)]
fn warn_if_world_readable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let mode = meta.permissions().mode();
    if mode & 0o004 == 0 {
        return false;
    }
    warn!(
        path = %path.display(),
        mode = %format!("{:o}", mode & 0o777),
        "config file is world-readable and contains credentials, consider chmod 600"
    );
    true
}

#[cfg(not(unix))]
fn warn_if_world_readable(_path: &Path) -> bool {
    false
}
