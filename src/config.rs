use crate::pool::PoolConfig;
use crate::rule::{PathRewrite, ProxyRule, ProxyTable, RuleError};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Dev-server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Build-tool plugins to activate (reported, not loaded)
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Public base path for emitted asset URLs in production builds
    #[serde(default = "default_base")]
    pub base: String,

    /// Web worker bundling options
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Development server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            base: default_base(),
            worker: WorkerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Output module format for bundled worker scripts
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerFormat {
    /// ES module workers (default)
    #[default]
    Es,
    /// Classic script workers
    Iife,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub format: WorkerFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (default: 5173)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream response timeout in seconds. Unset means no timeout.
    pub request_timeout_secs: Option<u64>,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Proxy rules keyed by path prefix
    #[serde(default)]
    pub proxy: HashMap<String, ProxyRuleConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            proxy: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Resolve `host:port`. Hostnames such as `localhost` are looked up,
    /// and the first address returned is used.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let invalid = |reason: String| {
            anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.host, self.port, reason)
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

/// A proxy rule as written in the config file: either a bare target URL
/// or a table of options
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ProxyRuleConfig {
    Target(String),
    Options(ProxyOptions),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProxyOptions {
    /// Upstream origin, e.g. "http://localhost:8080"
    pub target: String,

    /// Rewrite the Host header to the target's host
    #[serde(default, alias = "changeOrigin")]
    pub change_origin: bool,

    /// Path rewrite applied before forwarding
    pub rewrite: Option<RewriteConfig>,

    /// Tunnel WebSocket upgrade requests
    #[serde(default)]
    pub ws: bool,

    /// Add X-Forwarded-For/Host/Proto headers
    #[serde(default)]
    pub xfwd: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RewriteConfig {
    /// Regular expression matched against the request path
    pub pattern: String,

    /// Replacement for the first match (default: empty)
    #[serde(default)]
    pub replacement: String,
}

impl ProxyRuleConfig {
    /// Shorthand for a rule that strips its own prefix and rewrites the
    /// Host header, the usual shape of an API proxy
    pub fn strip_prefix(prefix: &str, target: &str) -> Self {
        ProxyRuleConfig::Options(ProxyOptions {
            target: target.to_string(),
            change_origin: true,
            rewrite: Some(RewriteConfig {
                pattern: format!("^{}", regex::escape(prefix)),
                replacement: String::new(),
            }),
            ws: false,
            xfwd: false,
        })
    }

    pub fn target(&self) -> &str {
        match self {
            ProxyRuleConfig::Target(target) => target,
            ProxyRuleConfig::Options(options) => &options.target,
        }
    }

    /// Compile into an immutable rule
    pub fn compile(&self, prefix: &str) -> Result<ProxyRule, RuleError> {
        let options = match self {
            ProxyRuleConfig::Target(target) => return ProxyRule::new(prefix, target),
            ProxyRuleConfig::Options(options) => options,
        };

        let mut rule = ProxyRule::new(prefix, &options.target)?
            .with_change_origin(options.change_origin)
            .with_ws(options.ws)
            .with_xfwd(options.xfwd);

        if let Some(rewrite) = &options.rewrite {
            let rewrite = PathRewrite::new(&rewrite.pattern, rewrite.replacement.clone())
                .map_err(|source| RuleError::InvalidRewrite {
                    prefix: prefix.to_string(),
                    source,
                })?;
            rule = rule.with_rewrite(rewrite);
        }

        Ok(rule)
    }
}

// Default value functions
fn default_base() -> String {
    "/".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5173
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.base.starts_with('/') {
            errors.push(format!("'base' must start with '/', got '{}'", self.base));
        }

        for plugin in &self.plugins {
            if plugin.trim().is_empty() {
                errors.push("plugin names must not be empty".to_string());
            }
        }

        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }

        let mut prefixes: Vec<&String> = self.server.proxy.keys().collect();
        prefixes.sort();
        for prefix in prefixes {
            if let Err(e) = self.server.proxy[prefix].compile(prefix) {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Compile the proxy rules into a lookup table
    pub fn proxy_table(&self) -> anyhow::Result<ProxyTable> {
        let rules = self
            .server
            .proxy
            .iter()
            .map(|(prefix, rule)| rule.compile(prefix))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProxyTable::new(rules))
    }
}
