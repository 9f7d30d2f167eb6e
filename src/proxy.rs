use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{is_hop_by_hop, ConnectionPool, PoolConfig, PoolError};
use crate::rule::{ProxyRule, ProxyTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Largest upstream response head accepted during a WebSocket upgrade
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Shared state for every connection of one server
struct ProxyContext {
    table: Arc<ProxyTable>,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
}

/// The development reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    table: Arc<ProxyTable>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        table: Arc<ProxyTable>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, table, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        table: Arc<ProxyTable>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            table,
            shutdown_rx,
            pool,
            request_timeout: None,
        }
    }

    /// Bound the time spent waiting for upstream response headers
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn table(&self) -> &Arc<ProxyTable> {
        &self.table
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, rules = self.table.len(), "Dev proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let context = Arc::new(ProxyContext {
            table: Arc::clone(&self.table),
            pool: Arc::clone(&self.pool),
            request_timeout: self.request_timeout,
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections keep upgrade support for WebSocket tunnelling
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = ensure_request_id(req.headers_mut());

    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let rule = match context.table.match_path(&path) {
        Some(rule) => rule,
        None => {
            debug!(method = %req.method(), path, request_id, "No proxy rule matched");
            return Ok(json_error_response(
                ProxyErrorCode::NoMatchingRule,
                format!("No proxy rule matches {}", path),
            ));
        }
    };

    let upstream = match rule.upstream_uri(&path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            warn!(prefix = rule.prefix(), path, error = %e, request_id, "Invalid rewrite result");
            return Ok(json_error_response(
                ProxyErrorCode::InvalidRewrite,
                "Rewritten path is not a valid request target",
            ));
        }
    };

    set_forwarded_headers(&mut req, rule, client_addr);

    debug!(
        method = %req.method(),
        path = %path_and_query,
        prefix = rule.prefix(),
        upstream = %upstream,
        request_id,
        "Proxying request"
    );

    if rule.ws() && is_upgrade_request(&req) {
        return handle_upgrade(req, rule, request_id).await;
    }

    let send = context.pool.send_request(req, upstream, rule.host_override());
    let result = match context.request_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    upstream = %rule.target(),
                    timeout_ms = timeout.as_millis() as u64,
                    request_id,
                    "Request timed out"
                );
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {:?}", timeout),
                ));
            }
        },
        None => send.await,
    };

    match result {
        Ok(response) => {
            debug!(status = %response.status(), request_id, "Upstream responded");
            Ok(response)
        }
        Err(PoolError::RequestBuild(e)) => {
            error!(error = %e, request_id, "Failed to build upstream request");
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to build upstream request",
            ))
        }
        Err(e) => {
            error!(upstream = %rule.target(), error = %e, request_id, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to {}", rule.target()),
            ))
        }
    }
}

/// Return the request ID used in logs, generating one if the client sent
/// none. A client-supplied value is forwarded byte for byte.
fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(value) = headers.get(X_REQUEST_ID) {
        return String::from_utf8_lossy(value.as_bytes()).into_owned();
    }

    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_REQUEST_ID, value);
    }
    id
}

/// Set the X-Forwarded-* headers for rules with `xfwd`.
///
/// Values are overwritten rather than appended: the dev proxy is always the
/// first hop.
fn set_forwarded_headers<B>(req: &mut Request<B>, rule: &ProxyRule, client_addr: SocketAddr) {
    if !rule.xfwd() {
        return;
    }

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Forward bytes bidirectionally between client and upstream connections.
/// `pending` holds upstream bytes that arrived with the 101 response head.
async fn forward_bidirectional(
    client: Upgraded,
    upstream: TcpStream,
    pending: Vec<u8>,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    if !pending.is_empty() {
        if let Err(e) = client_io.write_all(&pending).await {
            debug!(request_id, error = %e, "Failed to relay initial upstream bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                request_id,
                client_to_upstream,
                upstream_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Build the raw HTTP/1.1 upgrade request sent to the upstream
fn build_upgrade_request<B>(req: &Request<B>, path: &str, host: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if *name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", host));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Offset just past the blank line ending an HTTP head
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read the upstream's response head. Returns the head and whatever bytes
/// followed it in the same reads, or `None` if the upstream closed first.
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&data) {
            let rest = data.split_off(end);
            return Ok(Some((data, rest)));
        }
        if data.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        data.extend_from_slice(&buf[..n]);
    }
}

/// Read the body of a refused upgrade as framed by its Content-Length.
/// Without one, no body is relayed.
async fn read_rejection_body<S>(
    stream: &mut S,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());

    let Some(len) = content_length else {
        return Ok(Vec::new());
    };

    if body.len() < len {
        let missing = (len - body.len()) as u64;
        stream.take(missing).read_to_end(&mut body).await?;
    }
    body.truncate(len);
    Ok(body)
}

/// Copy upstream response headers onto a builder, skipping names and values
/// hyper would reject and any `skip`ped header.
fn copy_response_headers(
    mut builder: hyper::http::response::Builder,
    headers: &[(String, String)],
    skip: impl Fn(&HeaderName) -> bool,
) -> hyper::http::response::Builder {
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        if skip(&name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Parse the upstream's response head to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Tunnel a WebSocket upgrade request to the rule's target
async fn handle_upgrade(
    req: Request<Incoming>,
    rule: &ProxyRule,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upstream_path = rule.upstream_path(
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );

    let host = match rule.host_override() {
        Some(_) => rule.authority().as_str().to_string(),
        None => req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| rule.authority().as_str().to_string()),
    };

    debug!(request_id, path = %upstream_path, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &upstream_path, &host);

    let (upstream_host, upstream_port) = rule.socket_addr();
    let mut upstream_stream = match TcpStream::connect((upstream_host.as_str(), upstream_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(upstream = %rule.target(), error = %e, "Failed to connect to upstream for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to {}", rule.target()),
            ));
        }
    };

    if let Err(e) = upstream_stream.write_all(&raw_request).await {
        error!(upstream = %rule.target(), error = %e, "Failed to send upgrade request to upstream");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to send upgrade request",
        ));
    }

    let (head, rest) = match read_response_head(&mut upstream_stream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => {
            error!(upstream = %rule.target(), "Upstream closed connection before responding to upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Upstream closed connection",
            ));
        }
        Err(e) => {
            error!(upstream = %rule.target(), error = %e, "Failed to read upgrade response from upstream");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to read upstream response",
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(upstream = %rule.target(), "Failed to parse upstream upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(upstream = %rule.target(), status = %status, "Upstream rejected upgrade request");

        let body = match read_rejection_body(&mut upstream_stream, &response_headers, rest).await {
            Ok(body) => body,
            Err(e) => {
                error!(upstream = %rule.target(), error = %e, "Failed to read upgrade rejection body");
                return Ok(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to read upstream response",
                ));
            }
        };

        // hyper frames the relayed body itself
        let response = copy_response_headers(Response::builder().status(status), &response_headers, |name| {
            is_hop_by_hop(name) || *name == hyper::header::CONTENT_LENGTH
        })
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());

        return Ok(response.unwrap_or_else(|e| {
            error!(request_id, error = %e, "Failed to build upgrade rejection response");
            json_error_response(ProxyErrorCode::InternalError, "Invalid upstream response")
        }));
    }

    info!(request_id, upstream = %rule.target(), "WebSocket upgrade successful");

    // hyper manages framing for the 101 response itself
    let response = copy_response_headers(
        Response::builder().status(StatusCode::SWITCHING_PROTOCOLS),
        &response_headers,
        |name| *name == hyper::header::CONTENT_LENGTH || *name == hyper::header::TRANSFER_ENCODING,
    )
    .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            error!(request_id, error = %e, "Failed to build upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Invalid upstream response",
            ));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, pending = rest.len(), "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, upstream_stream, rest, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
