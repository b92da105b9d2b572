//! HTTP transport for the station's realtime endpoint
use futures_util::future::BoxFuture;
use log::debug;
use reqwest::{redirect, Client};
use std::time::Duration;
use url::Url;

use crate::error::TransportError;
use crate::utils::preview;

const BODY_PREVIEW_CHARS: usize = 200;

/// Anything that can fetch one raw telemetry payload.
///
/// Implementations are stateless per call and never retry; retry policy
/// belongs to the poll orchestrator.
pub trait Transport: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>>;
}

/// Single GET against `endpoint`, bounded by `timeout`.
pub async fn fetch(
    client: &Client,
    endpoint: &Url,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let response = client
        .get(endpoint.clone())
        .timeout(timeout)
        .send()
        .await?;

    let status = response.status();
    if status.is_redirection() {
        return Err(TransportError::Protocol(format!(
            "unexpected redirect ({}) from {}",
            status, endpoint
        )));
    }
    if !status.is_success() {
        return Err(TransportError::HttpStatus(status.as_u16()));
    }

    let body = response.bytes().await?;
    debug!(
        "Response from {} (first {} chars): {}",
        endpoint,
        BODY_PREVIEW_CHARS,
        preview(&body, BODY_PREVIEW_CHARS)
    );
    Ok(body.to_vec())
}

/// reqwest-backed transport bound to one station.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, TransportError> {
        // Redirects surface as protocol errors instead of being followed.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
        Box::pin(fetch(&self.client, &self.endpoint, self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response on a random local port.
    async fn serve_once(response: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        Url::parse(&format!("http://{}/realtime/", addr)).unwrap()
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let url = serve_once(concat!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n",
            "content-length: 11\r\nconnection: close\r\n\r\n{\"pms\": {}}",
        ))
        .await;
        let transport = HttpTransport::new(url, Duration::from_secs(2)).unwrap();
        assert_eq!(transport.fetch().await.unwrap(), b"{\"pms\": {}}".to_vec());
    }

    #[tokio::test]
    async fn maps_non_success_status() {
        let url = serve_once(concat!(
            "HTTP/1.1 503 Service Unavailable\r\n",
            "content-length: 0\r\nconnection: close\r\n\r\n",
        ))
        .await;
        let transport = HttpTransport::new(url, Duration::from_secs(2)).unwrap();
        assert_eq!(transport.fetch().await, Err(TransportError::HttpStatus(503)));
    }

    #[tokio::test]
    async fn redirect_is_a_protocol_error() {
        let url = serve_once(concat!(
            "HTTP/1.1 302 Found\r\nlocation: http://example.com/\r\n",
            "content-length: 0\r\nconnection: close\r\n\r\n",
        ))
        .await;
        let transport = HttpTransport::new(url, Duration::from_secs(2)).unwrap();
        assert!(matches!(transport.fetch().await, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{}/realtime/", addr)).unwrap();
        let transport = HttpTransport::new(url, Duration::from_secs(2)).unwrap();
        assert!(matches!(transport.fetch().await, Err(TransportError::Unreachable(_))));
    }
}
