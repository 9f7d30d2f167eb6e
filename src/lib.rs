//! devproxy - A development-server reverse proxy
//!
//! This library provides the proxy half of a front-end dev server:
//! - Loads a dev-server configuration (plugins, base path, worker format, proxy rules) from TOML
//! - Forwards requests whose path starts with a configured prefix to an upstream origin
//! - Rewrites the request path with a single regex substitution before forwarding
//! - Optionally rewrites the Host header to the upstream's host (`change_origin`)
//! - Tunnels WebSocket upgrades for rules that enable them
//! - Uses connection pooling for upstream requests

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod rule;
