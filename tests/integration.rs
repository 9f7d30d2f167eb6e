//! Integration tests for devproxy

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devproxy::config::Config;
use devproxy::proxy::ProxyServer;
use devproxy::rule::{PathRewrite, ProxyRule, ProxyTable};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Upstream that echoes what it received, one `key=value` per line
async fn spawn_echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let (method, path, host, request_id, forwarded_for) = {
                            let header = |name: &str| {
                                req.headers()
                                    .get(name)
                                    .and_then(|v| v.to_str().ok())
                                    .unwrap_or("")
                                    .to_string()
                            };
                            let path = req
                                .uri()
                                .path_and_query()
                                .map(|pq| pq.as_str().to_string())
                                .unwrap_or_default();
                            (
                                req.method().to_string(),
                                path,
                                header("host"),
                                header("x-request-id"),
                                header("x-forwarded-for"),
                            )
                        };
                        let body = req.into_body().collect().await?.to_bytes();

                        let text = format!(
                            "method={}\npath={}\nhost={}\nrequest_id={}\nforwarded_for={}\nbody={}\n",
                            method,
                            path,
                            host,
                            request_id,
                            forwarded_for,
                            String::from_utf8_lossy(&body)
                        );
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .header("x-upstream", "echo")
                                .body(Full::new(Bytes::from(text)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// Upstream that accepts connections and never answers
async fn spawn_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

/// Upstream that answers one upgrade request with `reply`, written in a single
/// call, and echoes bytes afterwards. The raw request head is sent back
/// through the channel.
async fn spawn_ws_upstream(reply: &'static [u8]) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (head_tx, head_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = head_tx.send(head);

        stream.write_all(reply).await.unwrap();

        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    (addr, head_rx)
}

/// Read from a stream until the end of an HTTP head
async fn read_head(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&data).contains("\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&data).into_owned()
}

async fn start_proxy(server: impl FnOnce(SocketAddr, watch::Receiver<bool>) -> ProxyServer) -> (SocketAddr, watch::Sender<bool>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = server(addr, shutdown_rx);
    let handle = tokio::spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });
    (addr, shutdown_tx, handle)
}

async fn start_proxy_with_table(table: ProxyTable) -> (SocketAddr, watch::Sender<bool>, JoinHandle<()>) {
    start_proxy(|addr, rx| ProxyServer::new(addr, Arc::new(table), rx)).await
}

fn api_rule(upstream: SocketAddr) -> ProxyRule {
    ProxyRule::new("/api", &format!("http://{}", upstream))
        .unwrap()
        .with_change_origin(true)
        .with_rewrite(PathRewrite::new("^/api", "").unwrap())
}

/// Send a raw HTTP/1.1 request and return the whole response
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("Connection: close\r\n\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(addr: SocketAddr, path: &str, host: &str) -> String {
    http_request(addr, "GET", path, &[("Host", host)], "").await
}

// ============================================================================
// Rule matching and rewriting
// ============================================================================

#[tokio::test]
async fn test_api_prefix_is_stripped() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_get(proxy, "/api/users/42", "localhost:5173").await;

    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response.contains("path=/users/42\n"), "Response: {}", response);
    assert!(response.to_lowercase().contains("x-upstream: echo"), "Response: {}", response);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_health_end_to_end() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_get(proxy, "/api/health", "localhost:5173").await;

    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response.contains("method=GET\n"), "Response: {}", response);
    assert!(response.contains("path=/health\n"), "Response: {}", response);
    assert!(response.contains("body=\n"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_unmatched_path_is_not_proxied() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    for path in ["/", "/index.html", "/src/api.ts"] {
        let response = http_get(proxy, path, "localhost:5173").await;
        assert!(response.contains("404"), "Response: {}", response);
        assert!(
            response.to_lowercase().contains("x-proxy-error: no_matching_rule"),
            "Response: {}",
            response
        );
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_query_string_is_forwarded() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_get(proxy, "/api/search?q=rust&page=2", "localhost:5173").await;
    assert!(response.contains("path=/search?q=rust&page=2\n"), "Response: {}", response);

    let response = http_get(proxy, "/api?page=3", "localhost:5173").await;
    assert!(response.contains("path=/?page=3\n"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    let (api_upstream, api_hits) = spawn_echo_upstream().await;
    let (auth_upstream, auth_hits) = spawn_echo_upstream().await;

    let auth_rule = ProxyRule::new("/api/auth", &format!("http://{}", auth_upstream))
        .unwrap()
        .with_rewrite(PathRewrite::new("^/api/auth", "/session").unwrap());
    let table = ProxyTable::new(vec![api_rule(api_upstream), auth_rule]);
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(table).await;

    let response = http_get(proxy, "/api/auth/login", "localhost:5173").await;
    assert!(response.contains("path=/session/login\n"), "Response: {}", response);

    let response = http_get(proxy, "/api/users", "localhost:5173").await;
    assert!(response.contains("path=/users\n"), "Response: {}", response);

    assert_eq!(auth_hits.load(Ordering::SeqCst), 1);
    assert_eq!(api_hits.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

// ============================================================================
// Header and body handling
// ============================================================================

#[tokio::test]
async fn test_change_origin_rewrites_host() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_get(proxy, "/api/users", "devserver.example:5173").await;

    assert!(
        response.contains(&format!("host={}\n", upstream)),
        "Response: {}",
        response
    );
    assert!(!response.contains("devserver.example"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_without_change_origin_host_is_preserved() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let rule = ProxyRule::new("/api", &format!("http://{}", upstream)).unwrap();
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![rule])).await;

    let response = http_get(proxy, "/api/users", "devserver.example:5173").await;

    assert!(response.contains("host=devserver.example:5173\n"), "Response: {}", response);
    assert!(response.contains("path=/api/users\n"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_method_and_body_are_preserved() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_request(
        proxy,
        "POST",
        "/api/users",
        &[("Host", "localhost:5173"), ("Content-Type", "application/json")],
        r#"{"name":"ada"}"#,
    )
    .await;

    assert!(response.contains("method=POST\n"), "Response: {}", response);
    assert!(response.contains(r#"body={"name":"ada"}"#), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_request(
        proxy,
        "GET",
        "/api/users",
        &[("Host", "localhost:5173"), ("X-Request-ID", "trace-123")],
        "",
    )
    .await;
    assert!(response.contains("request_id=trace-123\n"), "Response: {}", response);

    // Generated when the client sends none
    let response = http_get(proxy, "/api/users", "localhost:5173").await;
    let generated = response
        .lines()
        .find_map(|line| line.strip_prefix("request_id="))
        .unwrap();
    assert_eq!(generated.len(), 36, "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_forwarded_headers_only_with_xfwd() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let plain = api_rule(upstream);
    let xfwd = ProxyRule::new("/fwd", &format!("http://{}", upstream))
        .unwrap()
        .with_xfwd(true);
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![plain, xfwd])).await;

    let response = http_get(proxy, "/api/users", "localhost:5173").await;
    assert!(response.contains("forwarded_for=\n"), "Response: {}", response);

    let response = http_get(proxy, "/fwd/users", "localhost:5173").await;
    assert!(response.contains("forwarded_for=127.0.0.1\n"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_unreachable_upstream_returns_502() {
    // Reserve a port, then free it so nothing is listening there
    let unused = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(unused)])).await;

    let response = http_get(proxy, "/api/users", "localhost:5173").await;

    assert!(response.contains("502"), "Response: {}", response);
    assert!(
        response.to_lowercase().contains("x-proxy-error: connection_failed"),
        "Response: {}",
        response
    );
    assert!(response.contains("\"status\":502"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_request_timeout_returns_504() {
    let upstream = spawn_silent_upstream().await;
    let table = Arc::new(ProxyTable::new(vec![api_rule(upstream)]));

    let (proxy, shutdown_tx, handle) = start_proxy(|addr, rx| {
        ProxyServer::new(addr, table, rx).with_request_timeout(Duration::from_millis(200))
    })
    .await;

    let response = http_get(proxy, "/api/slow", "localhost:5173").await;

    assert!(response.contains("504"), "Response: {}", response);
    assert!(
        response.to_lowercase().contains("x-proxy-error: request_timeout"),
        "Response: {}",
        response
    );

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_pool_records_requests() {
    let (upstream, _hits) = spawn_echo_upstream().await;
    let table = Arc::new(ProxyTable::new(vec![api_rule(upstream)]));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(addr, table, shutdown_rx);
    let stats = server.pool().stats();
    let handle = tokio::spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });

    http_get(addr, "/api/a", "localhost:5173").await;
    http_get(addr, "/api/b", "localhost:5173").await;
    http_get(addr, "/not-proxied", "localhost:5173").await;

    assert_eq!(stats.get_total_requests(), 2);
    assert_eq!(stats.get_failed_requests(), 0);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

// ============================================================================
// WebSocket tunnelling
// ============================================================================

#[tokio::test]
async fn test_websocket_upgrade_is_tunnelled() {
    let (upstream, head_rx) = spawn_ws_upstream(SWITCHING_PROTOCOLS).await;
    let rule = api_rule(upstream).with_ws(true);
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![rule])).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            b"GET /api/socket HTTP/1.1\r\nHost: localhost:5173\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    let response_head = read_head(&mut client).await;
    assert!(response_head.contains("101"), "Response: {}", response_head);

    let upstream_head = head_rx.await.unwrap();
    assert!(
        upstream_head.starts_with("GET /socket HTTP/1.1\r\n"),
        "Upstream saw: {}",
        upstream_head
    );
    assert!(
        upstream_head.contains(&format!("Host: {}\r\n", upstream)),
        "Upstream saw: {}",
        upstream_head
    );

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_websocket_first_frame_after_handshake_is_relayed() {
    let (upstream, _head_rx) = spawn_ws_upstream(
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nhello",
    )
    .await;
    let rule = api_rule(upstream).with_ws(true);
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![rule])).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            b"GET /api/hmr HTTP/1.1\r\nHost: localhost:5173\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&data).contains("\r\n\r\nhello") {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&data).into_owned()
    })
    .await
    .unwrap();

    assert!(received.starts_with("HTTP/1.1 101"), "Received: {}", received);
    assert!(received.ends_with("\r\n\r\nhello"), "Received: {}", received);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_rejected_upgrade_relays_status_and_body() {
    let (upstream, _head_rx) =
        spawn_ws_upstream(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 9\r\nX-Reason: origin\r\n\r\nforbidden").await;
    let rule = api_rule(upstream).with_ws(true);
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![rule])).await;

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        http_request(
            proxy,
            "GET",
            "/api/socket",
            &[
                ("Host", "localhost:5173"),
                ("Connection", "Upgrade"),
                ("Upgrade", "websocket"),
            ],
            "",
        ),
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 403"), "Response: {}", response);
    assert!(response.to_lowercase().contains("content-length: 9\r\n"), "Response: {}", response);
    assert!(response.to_lowercase().contains("x-reason: origin\r\n"), "Response: {}", response);
    assert!(response.ends_with("\r\n\r\nforbidden"), "Response: {}", response);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn test_upgrade_without_ws_is_forwarded_as_plain_request() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(ProxyTable::new(vec![api_rule(upstream)])).await;

    let response = http_request(
        proxy,
        "GET",
        "/api/socket",
        &[
            ("Host", "localhost:5173"),
            ("Connection", "Upgrade"),
            ("Upgrade", "websocket"),
        ],
        "",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.contains("path=/socket\n"), "Response: {}", response);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

// ============================================================================
// Configuration-driven setup
// ============================================================================

#[tokio::test]
async fn test_proxy_from_config_file() {
    let (upstream, _hits) = spawn_echo_upstream().await;

    let toml = format!(
        r#"
plugins = ["react"]
base = "/frontproject-development-serviceApi/"

[worker]
format = "es"

[server.proxy."/api"]
target = "http://{}"
change_origin = true
rewrite = {{ pattern = "^/api", replacement = "" }}
"#,
        upstream
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devproxy.toml");
    std::fs::write(&path, toml).unwrap();

    let config = Config::load(&path).unwrap();
    let table = config.proxy_table().unwrap();
    let (proxy, shutdown_tx, handle) = start_proxy_with_table(table).await;

    let response = http_get(proxy, "/api/users/42", "localhost:5173").await;
    assert!(response.contains("path=/users/42\n"), "Response: {}", response);
    assert!(
        response.contains(&format!("host={}\n", upstream)),
        "Response: {}",
        response
    );

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}
