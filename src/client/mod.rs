//! HTTP fetch transport.
//!
//! The coordinator only needs "give me the body of this URL as a chunk
//! stream"; [`Transport`] is that seam. [`HttpTransport`] is the built-in
//! implementation on top of a shared [`reqwest::Client`] (rustls, redirects
//! followed), with the body streamed to the caller as it arrives.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, redirect};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Maximum size of a response body we will accept (8 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Redirect hops followed before the request fails.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// `User-Agent` sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("slotfetch/", env!("CARGO_PKG_VERSION"));

/// A response body as an async sequence of byte chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Boxed future returned by [`Transport::get`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<FetchResponse, TransportError>> + Send + 'a>>;

/// Issues the network request for a URL.
///
/// Implementations must be `Send + Sync`: one transport is shared by the
/// coordinator and moved into the task that performs each fetch.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use slotfetch::client::{FetchResponse, Transport, TransportFuture};
///
/// struct Canned;
///
/// impl Transport for Canned {
///     fn get<'a>(&'a self, _url: &'a str) -> TransportFuture<'a> {
///         Box::pin(async { Ok(FetchResponse::from_chunks(vec![Bytes::from_static(b"[]")])) })
///     }
/// }
/// ```
pub trait Transport: Send + Sync {
    /// Sends a `GET` for `url` and returns once the response head is available.
    fn get<'a>(&'a self, url: &'a str) -> TransportFuture<'a>;
}

/// Status, headers and (possibly absent) body of a fetched resource.
pub struct FetchResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<BodyStream>,
}

impl FetchResponse {
    /// Assembles a response from its parts.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Option<BodyStream>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A `200 OK` whose body yields `chunks` in order.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let stream = tokio_stream::iter(chunks.into_iter().map(Ok::<Bytes, TransportError>));
        Self::new(StatusCode::OK, HeaderMap::new(), Some(Box::pin(stream)))
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Takes the body stream, leaving `None` behind.
    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body.take()
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Settings for [`HttpTransport`], applied to a [`reqwest::ClientBuilder`].
///
/// | Setting           | Default                     |
/// |-------------------|-----------------------------|
/// | `max_body_size`   | [`DEFAULT_MAX_BODY_SIZE`]   |
/// | `max_redirects`   | [`DEFAULT_MAX_REDIRECTS`]   |
/// | `user_agent`      | [`DEFAULT_USER_AGENT`]      |
/// | `timeout`         | none                        |
/// | `connect_timeout` | none                        |
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use slotfetch::client::{ClientConfig, HttpTransport};
///
/// let transport = HttpTransport::with_config(
///     ClientConfig::new()
///         .max_body_size(1024 * 1024)
///         .timeout(Duration::from_secs(5))
///         .user_agent("people-page/1.0"),
/// )
/// .unwrap();
/// assert_eq!(transport.config().max_body_size_limit(), 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    max_body_size: usize,
    max_redirects: usize,
    user_agent: String,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfig {
    /// Creates a configuration with the documented defaults.
    pub fn new() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: None,
            connect_timeout: None,
        }
    }

    /// Caps the number of body bytes accepted per response.
    #[must_use]
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Sets how many redirects are followed; `0` disables following.
    #[must_use]
    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.max_redirects = hops;
        self
    }

    /// Overrides the `User-Agent` header.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Bounds the whole request, body included.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bounds connection setup only.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Returns the configured body size cap.
    pub fn max_body_size_limit(&self) -> usize {
        self.max_body_size
    }

    fn build_client(&self) -> Result<Client, reqwest::Error> {
        let redirects = if self.max_redirects == 0 {
            redirect::Policy::none()
        } else {
            redirect::Policy::limited(self.max_redirects)
        };

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = Client::builder()
            .user_agent(self.user_agent.as_str())
            .default_headers(headers)
            .redirect(redirects);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder.build()
    }
}

/// [`Transport`] over a pooled `reqwest` client (http and https).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates a transport with `reqwest`'s stock client and the default
    /// [`ClientConfig`] body cap.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            config: ClientConfig::new(),
        }
    }

    /// Creates a transport with the given settings.
    ///
    /// # Errors
    ///
    /// [`TransportError::Client`] if the TLS backend cannot be initialized.
    pub fn with_config(config: ClientConfig) -> Result<Self, TransportError> {
        let client = config
            .build_client()
            .map_err(|e| TransportError::Client(e.into()))?;
        Ok(Self { client, config })
    }

    /// Returns the active settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(&self, url: &str) -> Result<FetchResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::from_request(url, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "non-success status");
        }

        let max_bytes = self.config.max_body_size;
        if response.content_length().is_some_and(|len| len > max_bytes as u64) {
            return Err(TransportError::BodyTooLarge { max_bytes });
        }
        debug!(url, status = status.as_u16(), final_url = %response.url(), "response head received");

        let headers = response.headers().clone();
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::new(status, headers, None));
        }

        let mut received = 0usize;
        let body = response.bytes_stream().map(move |chunk| {
            let chunk = chunk.map_err(|e| TransportError::Body(e.into()))?;
            received += chunk.len();
            if received > max_bytes {
                return Err(TransportError::BodyTooLarge { max_bytes });
            }
            Ok(chunk)
        });

        Ok(FetchResponse::new(status, headers, Some(Box::pin(body))))
    }
}

impl Transport for HttpTransport {
    fn get<'a>(&'a self, url: &'a str) -> TransportFuture<'a> {
        Box::pin(self.send(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_full;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `responses` in order, one per connection, split at `split_at`.
    async fn serve(responses: Vec<Vec<u8>>, split_at: Vec<usize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let mut start = 0;
                for end in split_at
                    .iter()
                    .copied()
                    .filter(|&end| end < response.len())
                    .chain(std::iter::once(response.len()))
                {
                    socket.write_all(&response[start..end]).await.unwrap();
                    socket.flush().await.unwrap();
                    tokio::task::yield_now().await;
                    start = end;
                }
            }
        });
        format!("http://{addr}")
    }

    async fn fetch_text(url: &str, transport: &HttpTransport) -> Result<String, TransportError> {
        let mut response = transport.get(url).await?;
        decode_full(url, response.take_body()).await
    }

    #[tokio::test]
    async fn content_length_body() {
        let raw =
            b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\nConnection: close\r\n\r\n[{\"first\":1}]"
                .to_vec();
        let base = serve(vec![raw], vec![20, 60]).await;
        let text = fetch_text(&format!("{base}/people"), &HttpTransport::new())
            .await
            .unwrap();
        assert_eq!(text, "[{\"first\":1}]");
    }

    #[tokio::test]
    async fn chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\n[{\"a\r\n5\r\n\":1}]\r\n0\r\n\r\n"
            .to_vec();
        let base = serve(vec![raw], vec![70]).await;
        let text = fetch_text(&format!("{base}/people"), &HttpTransport::new())
            .await
            .unwrap();
        assert_eq!(text, "[{\"a\":1}]");
    }

    #[tokio::test]
    async fn follows_redirects() {
        let moved = b"HTTP/1.1 302 Found\r\nLocation: /people/v2\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let ok = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]".to_vec();
        let base = serve(vec![moved, ok], vec![]).await;
        let mut response = HttpTransport::new()
            .get(&format!("{base}/people"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = decode_full("u", response.take_body()).await.unwrap();
        assert_eq!(text, "[]");
    }

    #[tokio::test]
    async fn redirects_disabled_returns_redirect_status() {
        let moved = b"HTTP/1.1 302 Found\r\nLocation: /people/v2\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let base = serve(vec![moved], vec![]).await;
        let transport = HttpTransport::with_config(ClientConfig::new().max_redirects(0)).unwrap();
        let response = transport.get(&format!("{base}/people")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn interim_continue_is_skipped() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]"
            .to_vec();
        let base = serve(vec![raw], vec![25]).await;
        let mut response = HttpTransport::new().get(&base).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = decode_full("u", response.take_body()).await.unwrap();
        assert_eq!(text, "[]");
    }

    #[tokio::test]
    async fn no_content_has_no_body() {
        let raw = b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_vec();
        let base = serve(vec![raw], vec![]).await;
        let mut response = HttpTransport::new().get(&base).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.take_body().is_none());
    }

    #[tokio::test]
    async fn non_success_status_still_has_body() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}".to_vec();
        let base = serve(vec![raw], vec![]).await;
        let mut response = HttpTransport::new().get(&base).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = decode_full("u", response.take_body()).await.unwrap();
        assert_eq!(text, "{}");
    }

    #[tokio::test]
    async fn declared_oversized_body_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\nConnection: close\r\n\r\n".to_vec();
        let base = serve(vec![raw], vec![]).await;
        let transport = HttpTransport::with_config(ClientConfig::new().max_body_size(16)).unwrap();
        let err = transport.get(&base).await.unwrap_err();
        assert!(matches!(err, TransportError::BodyTooLarge { max_bytes: 16 }));
    }

    #[tokio::test]
    async fn streamed_oversized_body_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n10\r\n0123456789abcdef\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n"
            .to_vec();
        let base = serve(vec![raw], vec![]).await;
        let transport = HttpTransport::with_config(ClientConfig::new().max_body_size(20)).unwrap();
        let err = fetch_text(&base, &transport).await.unwrap_err();
        assert!(matches!(err, TransportError::BodyTooLarge { max_bytes: 20 }));
    }

    #[tokio::test]
    async fn connection_refused_is_connect_error() {
        // Bind then drop to obtain a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let url = format!("http://{addr}/");
        let err = HttpTransport::new().get(&url).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { url: u, .. } if u == url));
    }

    #[tokio::test]
    async fn https_urls_are_attempted_over_tls() {
        // A plain-text peer cannot complete a TLS handshake, but the request
        // must get as far as trying one.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
        });

        let url = format!("https://{addr}/people");
        let err = HttpTransport::new().get(&url).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Request { .. }
        ));
    }

    #[test]
    fn config_builder() {
        let config = ClientConfig::new()
            .max_body_size(10)
            .max_redirects(3)
            .connect_timeout(Duration::from_millis(250))
            .user_agent("ua");
        assert_eq!(config.max_body_size_limit(), 10);
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.user_agent, "ua");
        assert!(HttpTransport::with_config(config).is_ok());
    }
}
