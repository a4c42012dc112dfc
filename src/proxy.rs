use crate::coordinator::Coordinator;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::render;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
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

/// State shared by every connection
struct Shared {
    coordinator: Arc<Coordinator>,
    pool: Arc<ConnectionPool>,
    notify_route: String,
}

/// Reverse proxy that gates every request on the coordinator
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        notify_route: impl Into<String>,
        coordinator: Arc<Coordinator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(
            bind_addr,
            notify_route,
            coordinator,
            shutdown_rx,
            PoolConfig::default(),
        )
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        notify_route: impl Into<String>,
        coordinator: Arc<Coordinator>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            shared: Arc::new(Shared {
                coordinator,
                pool,
                notify_route: notify_route.into(),
            }),
            shutdown_rx,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.shared.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            backend = %self.shared.coordinator.backend_addr(),
            notify_route = %self.shared.notify_route,
            pool_max_idle = self.shared.pool.config().max_idle_per_host,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared).await {
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

async fn handle_connection<S>(stream: S, addr: SocketAddr, shared: Arc<Shared>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

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
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.uri().path() == shared.notify_route {
        debug!(method = %req.method(), "Dirty notification received");
        shared.coordinator.mark_dirty().await;
        return Ok(empty_response(StatusCode::OK));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(method = %req.method(), uri = %req.uri(), request_id, "Serving request");

    if let Err(e) = shared.coordinator.ensure_ready().await {
        error!(uri = %req.uri(), request_id, error = %e, "Backend not ready");
        return Ok(render::error_response(&e.report()));
    }

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let backend_addr = shared.coordinator.backend_addr();

    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(req, backend_addr, &request_id).await);
    }

    debug!(uri = %req.uri(), backend = %backend_addr, request_id, "Proxying request");

    match shared.pool.send_request(req, backend_addr).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(backend = %backend_addr, request_id, error = %e, "Failed to forward request");
            Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Check if a request asks to switch protocols (WebSocket and friends)
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP/1.1 upgrade request sent to the backend
fn build_upgrade_request(req: &Request<Incoming>, backend_addr: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n\r\n", backend_addr));
    request.into_bytes()
}

/// Parse the status line and headers of the backend's response head
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Some((status, headers))
}

/// Read from the backend until the end of the response head.
///
/// Returns the head and whatever bytes arrived after it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok((buf, rest));
        }
        if buf.len() > 64 * 1024 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Relay an upgrade handshake to the backend and, on `101`, splice the two
/// connections together.
async fn handle_upgrade(
    req: Request<Incoming>,
    backend_addr: &str,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(backend = %backend_addr, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, backend_addr);

    let mut backend = match TcpStream::connect(backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(backend = %backend_addr, request_id, error = %e, "Failed to connect to backend for upgrade");
            return text_response(StatusCode::BAD_GATEWAY, "Failed to connect to backend");
        }
    };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(backend = %backend_addr, request_id, error = %e, "Failed to send upgrade request");
        return text_response(StatusCode::BAD_GATEWAY, "Failed to connect to backend");
    }

    let (head, leftover) = match read_response_head(&mut backend).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(backend = %backend_addr, request_id, error = %e, "Failed to read upgrade response");
            return text_response(StatusCode::BAD_GATEWAY, "Invalid upgrade response from backend");
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(backend = %backend_addr, request_id, "Failed to parse upgrade response");
        return text_response(StatusCode::BAD_GATEWAY, "Invalid upgrade response from backend");
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(backend = %backend_addr, request_id, status = %status, "Backend rejected upgrade request");
        let body = Full::new(Bytes::from(leftover)).map_err(|never| match never {}).boxed();
        return response.body(body).unwrap_or_else(|_| {
            text_response(StatusCode::BAD_GATEWAY, "Invalid upgrade response from backend")
        });
    }

    info!(backend = %backend_addr, request_id, upgrade_type, "Upgrade accepted by backend");

    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_bidirectional(upgraded, backend, leftover, &request_id).await,
            Err(e) => error!(request_id, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "Invalid upgrade response from backend"))
}

/// Copy bytes both ways until either side closes.
///
/// `early` holds backend bytes that arrived together with the response head.
async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, early: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(request_id, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
