//! Telling a running proxy that its inputs changed
//!
//! Used from a separate process (typically a file watcher) that shares no
//! memory with the proxy.

use crate::error::NotifyError;
use crate::waiter::{wait_reachable, Dialer};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{info, warn};

/// Wait for the proxy at `proxy_addr` to accept connections, then request
/// `route` on it.
///
/// A non-2xx answer is logged but not treated as a failure.
pub async fn notify_dirty(
    dialer: &dyn Dialer,
    proxy_addr: &str,
    route: &str,
    connect_timeout: Duration,
) -> Result<(), NotifyError> {
    wait_reachable(dialer, proxy_addr, connect_timeout).await?;

    let url = format!("http://{}{}", proxy_addr, route);
    let uri: Uri = url
        .parse()
        .map_err(|source| NotifyError::InvalidUrl { url: url.clone(), source })?;

    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let response = client.get(uri).await?;

    let status = response.status();
    if status.is_success() {
        info!(url = %url, %status, "Proxy notified");
    } else {
        warn!(url = %url, %status, "Proxy answered notification with an error status");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::TcpDialer;
    use async_trait::async_trait;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Unreachable;

    #[async_trait]
    impl Dialer for Unreachable {
        async fn dial(&self, _addr: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// Read a request head; `None` if the peer hung up without sending one.
    async fn read_head(stream: &mut TcpStream) -> Option<String> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        if buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
    }

    /// Answer the first connection that sends a request, skipping bare reachability checks.
    fn serve_one(listener: TcpListener, status_line: &'static str) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                if let Some(head) = read_head(&mut stream).await {
                    let response = format!(
                        "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status_line
                    );
                    stream.write_all(response.as_bytes()).await.unwrap();
                    return head;
                }
            }
        })
    }

    #[tokio::test]
    async fn test_notify_requests_route() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = serve_one(listener, "HTTP/1.1 200 OK");

        notify_dirty(&TcpDialer, &addr, "/__devgate/dirty", Duration::from_secs(2))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /__devgate/dirty HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = serve_one(listener, "HTTP/1.1 404 Not Found");

        notify_dirty(&TcpDialer, &addr, "/dirty", Duration::from_secs(2))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /dirty HTTP/1.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_proxy_times_out() {
        let err = notify_dirty(&Unreachable, "127.0.0.1:9", "/dirty", Duration::from_secs(3))
            .await
            .unwrap_err();

        assert!(matches!(err, NotifyError::Unreachable(_)));
        assert!(err.to_string().starts_with("failed to connect to proxy"));
    }
}
