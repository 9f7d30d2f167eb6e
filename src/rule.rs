//! Proxy rule matching and path rewriting
//!
//! A [`ProxyTable`] is compiled once from configuration and never mutated
//! afterwards, so it can be shared across connections behind an `Arc`
//! without locking. Everything in this module is pure: no I/O happens here.

use hyper::header::HeaderValue;
use hyper::http::uri::Authority;
use hyper::Uri;
use regex::Regex;
use thiserror::Error;

/// Errors produced while compiling a proxy rule or building its upstream URI
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("proxy prefix '{0}' must start with '/'")]
    InvalidPrefix(String),

    #[error("proxy '{prefix}': invalid target '{target}': {reason}")]
    InvalidTarget {
        prefix: String,
        target: String,
        reason: String,
    },

    #[error("proxy '{prefix}': invalid rewrite pattern: {source}")]
    InvalidRewrite {
        prefix: String,
        #[source]
        source: regex::Error,
    },

    #[error("rewritten upstream URI '{uri}' is invalid: {reason}")]
    InvalidUpstreamUri { uri: String, reason: String },
}

/// A single regex substitution applied to the request path before forwarding
#[derive(Debug, Clone)]
pub struct PathRewrite {
    pattern: Regex,
    replacement: String,
}

impl PathRewrite {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    /// Replace the first match only. Anchored patterns (`^/api`) leave
    /// paths without the prefix untouched.
    pub fn apply(&self, path: &str) -> String {
        self.pattern
            .replacen(path, 1, self.replacement.as_str())
            .into_owned()
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }
}

/// A compiled proxy rule
#[derive(Debug, Clone)]
pub struct ProxyRule {
    prefix: String,
    authority: Authority,
    /// Path component of the target, without a trailing slash
    target_base: String,
    change_origin: bool,
    rewrite: Option<PathRewrite>,
    ws: bool,
    xfwd: bool,
}

impl ProxyRule {
    /// Create a rule forwarding `prefix` to `target`. Only plain `http`
    /// targets are accepted.
    pub fn new(prefix: &str, target: &str) -> Result<Self, RuleError> {
        if !prefix.starts_with('/') {
            return Err(RuleError::InvalidPrefix(prefix.to_string()));
        }

        let invalid_target = |reason: String| RuleError::InvalidTarget {
            prefix: prefix.to_string(),
            target: target.to_string(),
            reason,
        };

        let uri: Uri = target.parse().map_err(|e| invalid_target(format!("{}", e)))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(invalid_target(format!(
                    "unsupported scheme '{}', only http is supported",
                    other
                )))
            }
            None => return Err(invalid_target("missing scheme".to_string())),
        }

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid_target("missing host".to_string()))?;

        if uri.query().is_some() {
            return Err(invalid_target("query strings are not allowed".to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            authority,
            target_base: uri.path().trim_end_matches('/').to_string(),
            change_origin: false,
            rewrite: None,
            ws: false,
            xfwd: false,
        })
    }

    /// Rewrite the Host header to the target authority (builder pattern)
    pub fn with_change_origin(mut self, change_origin: bool) -> Self {
        self.change_origin = change_origin;
        self
    }

    /// Set the path rewrite (builder pattern)
    pub fn with_rewrite(mut self, rewrite: PathRewrite) -> Self {
        self.rewrite = Some(rewrite);
        self
    }

    /// Tunnel WebSocket upgrades (builder pattern)
    pub fn with_ws(mut self, ws: bool) -> Self {
        self.ws = ws;
        self
    }

    /// Add X-Forwarded-* headers (builder pattern)
    pub fn with_xfwd(mut self, xfwd: bool) -> Self {
        self.xfwd = xfwd;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn change_origin(&self) -> bool {
        self.change_origin
    }

    pub fn rewrite(&self) -> Option<&PathRewrite> {
        self.rewrite.as_ref()
    }

    pub fn ws(&self) -> bool {
        self.ws
    }

    pub fn xfwd(&self) -> bool {
        self.xfwd
    }

    /// Target origin as a display string, e.g. `http://localhost:8080`
    pub fn target(&self) -> String {
        format!("http://{}{}", self.authority, self.target_base)
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Apply the rewrite to a path-and-query string. The result always
    /// starts with '/' so it can be used as a request target.
    pub fn rewrite_path(&self, path_and_query: &str) -> String {
        let rewritten = match &self.rewrite {
            Some(rewrite) => rewrite.apply(path_and_query),
            None => path_and_query.to_string(),
        };

        if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        }
    }

    /// Path-and-query sent upstream: target base path followed by the
    /// rewritten request path
    pub fn upstream_path(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target_base, self.rewrite_path(path_and_query))
    }

    /// Absolute URI for the forwarded request
    pub fn upstream_uri(&self, path_and_query: &str) -> Result<Uri, RuleError> {
        let uri = format!("http://{}{}", self.authority, self.upstream_path(path_and_query));
        uri.parse().map_err(|e| RuleError::InvalidUpstreamUri {
            reason: format!("{}", e),
            uri,
        })
    }

    /// Host header to send upstream, if this rule overrides it
    pub fn host_override(&self) -> Option<HeaderValue> {
        if !self.change_origin {
            return None;
        }
        HeaderValue::from_str(self.authority.as_str()).ok()
    }

    /// Host and port for raw TCP connections (WebSocket tunnelling).
    /// IPv6 literals come back without their brackets.
    pub fn socket_addr(&self) -> (String, u16) {
        let host = self.authority.host();
        (
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
            self.authority.port_u16().unwrap_or(80),
        )
    }
}

/// Immutable set of proxy rules
#[derive(Debug, Default, Clone)]
pub struct ProxyTable {
    /// Sorted by prefix length, longest first
    rules: Vec<ProxyRule>,
}

impl ProxyTable {
    pub fn new(mut rules: Vec<ProxyRule>) -> Self {
        rules.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Self { rules }
    }

    /// Find the rule for a request path. The longest matching prefix wins.
    ///
    /// Vite's proxy picks the first matching key in declaration order instead.
    /// TOML tables carry no reliable order, so a config with overlapping
    /// prefixes such as `/api` and `/api/v2` routes `/api/v2/*` to the latter
    /// here regardless of which was written first.
    pub fn match_path(&self, path: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyRule> {
        self.rules.iter()
    }
}
