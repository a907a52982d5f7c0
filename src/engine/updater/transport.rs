//! HTTP Transport
//!
//! The engine talks to the network only through [`Transport`], so the update
//! flow can be driven by an in-memory implementation in tests. The
//! production implementation wraps `reqwest`.

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use futures_util::FutureExt;
use reqwest::header::RANGE;
use std::time::Duration;

use super::error::NetworkError;

const USER_AGENT: &str = concat!("fresh-updater/", env!("CARGO_PKG_VERSION"));

/// Outgoing GET request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Byte offset to resume from (`Range: bytes=<n>-`)
    pub range_start: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn range_from(mut self, offset: u64) -> Self {
        self.range_start = (offset > 0).then_some(offset);
        self
    }
}

/// Response head plus a streaming body
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, NetworkError>>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the whole body.
    pub async fn bytes(self) -> Result<Vec<u8>, NetworkError> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync + 'static {
    fn get(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, NetworkError>>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// `timeout` bounds connecting and each wait for body data, not the
    /// whole transfer, so a large package on a slow link still completes.
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, NetworkError>> {
        async move {
            let mut builder = self.client.get(&request.url);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(offset) = request.range_start {
                builder = builder.header(RANGE, format!("bytes={}-", offset));
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_length = response.content_length();
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(NetworkError::from))
                .boxed();

            Ok(HttpResponse {
                status,
                content_length,
                body,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::get("https://updates.example/manifest.json")
            .query("id", "app")
            .range_from(0);
        assert_eq!(request.query, vec![("id".to_string(), "app".to_string())]);
        assert_eq!(request.range_start, None);
        assert_eq!(HttpRequest::get("u").range_from(42).range_start, Some(42));
    }

    #[tokio::test]
    async fn test_response_bytes_collects_and_fails() {
        let ok = HttpResponse {
            status: 200,
            content_length: Some(6),
            body: stream::iter(vec![Ok(b"abc".to_vec()), Ok(b"def".to_vec())]).boxed(),
        };
        assert!(ok.is_success());
        assert_eq!(ok.bytes().await.unwrap(), b"abcdef");

        let broken = HttpResponse {
            status: 200,
            content_length: None,
            body: stream::iter(vec![
                Ok(b"abc".to_vec()),
                Err(NetworkError::IncompleteBody("cut".into())),
            ])
            .boxed(),
        };
        assert!(matches!(
            broken.bytes().await,
            Err(NetworkError::IncompleteBody(_))
        ));
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_slow_body_outlasting_timeout_completes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            for byte in b"abcdefgh" {
                tokio::time::sleep(Duration::from_millis(100)).await;
                socket.write_all(&[*byte]).await.unwrap();
                socket.flush().await.unwrap();
            }
        });

        // The body takes about 800ms in total, with 100ms between bytes.
        let transport = HttpTransport::new(Duration::from_millis(400)).unwrap();
        let response = transport
            .get(HttpRequest::get(format!("http://{}/bundle.zip", addr)))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.bytes().await.unwrap(), b"abcdefgh");
        server.await.unwrap();
    }
}
