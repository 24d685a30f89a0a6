//! HTTP transport to the control plane and the local backend.
//!
//! The SDK talks to the network only through the [`Transport`] trait so that
//! lifecycle and input logic can be exercised without a server. The
//! production implementation is [`HttpTransport`]; [`RecordingTransport`]
//! answers from a script and records every request.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// HTTP method of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Delete => Self::DELETE,
        }
    }
}

/// A single request to the control plane or the local backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL, including any query string.
    pub url: String,
    /// Optional JSON body.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Create a request without a body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Issues requests and returns raw response bodies.
///
/// Implementations map any non-2xx response to [`Error::Remote`] carrying the
/// status code and body, and any failure to obtain a response to
/// [`Error::Transport`]. They never retry.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send a request and return the response body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` for non-success statuses and `Error::Transport`
    /// when no response was received.
    async fn send(&self, request: ApiRequest) -> Result<Vec<u8>>;
}

/// Typed helpers over a shared [`Transport`].
#[derive(Debug, Clone)]
pub(crate) struct Api {
    transport: Arc<dyn Transport>,
}

impl Api {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn send(&self, request: ApiRequest) -> Result<Vec<u8>> {
        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        self.transport.send(request).await
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let bytes = self.send(ApiRequest::new(Method::Get, url)).await?;
        decode(&bytes)
    }

    pub(crate) async fn get_bytes(&self, url: String) -> Result<Vec<u8>> {
        self.send(ApiRequest::new(Method::Get, url)).await
    }

    pub(crate) async fn post<T: DeserializeOwned>(&self, url: String, body: Option<Value>) -> Result<T> {
        let mut request = ApiRequest::new(Method::Post, url);
        request.body = body;
        let bytes = self.send(request).await?;
        decode(&bytes)
    }

    pub(crate) async fn post_discard(&self, url: String, body: Value) -> Result<()> {
        let request = ApiRequest::new(Method::Post, url).with_body(body);
        self.send(request).await.map(drop)
    }

    pub(crate) async fn put(&self, url: String) -> Result<()> {
        self.send(ApiRequest::new(Method::Put, url)).await.map(drop)
    }

    pub(crate) async fn delete(&self, url: String) -> Result<()> {
        self.send(ApiRequest::new(Method::Delete, url)).await.map(drop)
    }
}

/// Decode a JSON body; an empty body decodes as `null`.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_value(Value::Null).map_err(Error::from);
    }
    serde_json::from_slice(bytes).map_err(Error::from)
}

/// Production transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport from the client configuration.
    ///
    /// The API key, if any, is sent as a bearer token on every request.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the key is not a valid header value or the
    /// HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| Error::Config(format!("invalid API key: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Create a transport with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<Vec<u8>> {
        let mut builder = self.client.request(request.method.into(), &request.url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            Ok(bytes.to_vec())
        } else {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            tracing::debug!(
                method = %request.method,
                url = %request.url,
                status = status.as_u16(),
                "Request rejected"
            );
            Err(Error::Remote {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// A scripted reply for [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// 2xx with a JSON body.
    Json(Value),
    /// 2xx with a raw body.
    Bytes(Vec<u8>),
    /// Non-2xx with the given status and body.
    Status(u16, String),
}

/// A request observed by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The request as sent.
    pub request: ApiRequest,
    /// When the transport received it.
    pub at: Instant,
}

impl RecordedCall {
    /// The URL path with the query string removed.
    #[must_use]
    pub fn path(&self) -> &str {
        path_of(&self.request.url)
    }
}

fn path_of(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

#[derive(Debug)]
struct Route {
    method: Method,
    suffix: String,
    replies: VecDeque<Reply>,
}

#[derive(Debug, Default)]
struct RecordingState {
    routes: Vec<Route>,
    calls: Vec<RecordedCall>,
}

/// An in-memory transport that replays scripted replies and records requests.
///
/// Routes match on method and URL path suffix (query ignored). Each route
/// pops its replies in order and keeps repeating the last one. Unmatched
/// requests succeed with an empty body.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the replies for `method` requests whose path ends with `suffix`.
    #[must_use]
    pub fn on(self, method: Method, suffix: impl Into<String>, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.state.lock().routes.push(Route {
            method,
            suffix: suffix.into(),
            replies: replies.into_iter().collect(),
        });
        self
    }

    /// All requests received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Requests whose method matches and whose path ends with `suffix`.
    #[must_use]
    pub fn calls_to(&self, method: Method, suffix: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.request.method == method && c.path().ends_with(suffix))
            .cloned()
            .collect()
    }

    /// Forget recorded requests, keeping the script.
    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: ApiRequest) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let reply = state
            .routes
            .iter_mut()
            .find(|r| r.method == request.method && path_of(&request.url).ends_with(&r.suffix))
            .and_then(|route| {
                if route.replies.len() > 1 {
                    route.replies.pop_front()
                } else {
                    route.replies.front().cloned()
                }
            });
        state.calls.push(RecordedCall {
            request,
            at: Instant::now(),
        });
        drop(state);

        match reply {
            None => Ok(Vec::new()),
            Some(Reply::Json(value)) => Ok(serde_json::to_vec(&value)?),
            Some(Reply::Bytes(bytes)) => Ok(bytes),
            Some(Reply::Status(status, body)) => Err(Error::Remote { status, body }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decode_empty_body_as_null() {
        decode::<()>(b"").unwrap();
        let value: Value = decode(b"  \n").unwrap();
        assert_eq!(value, Value::Null);
        let err = decode::<Vec<u32>>(b"{}").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn http_transport_rejects_bad_key() {
        let config = ClientConfig::default().with_api_key("bad\nkey");
        assert!(matches!(HttpTransport::new(&config), Err(Error::Config(_))));
        assert!(HttpTransport::new(&ClientConfig::default()).is_ok());
    }

    #[test]
    fn path_ignores_query() {
        assert_eq!(path_of("http://h/vms/1/key?connection_id=c"), "http://h/vms/1/key");
        assert_eq!(path_of("http://h/vms/1"), "http://h/vms/1");
    }

    #[tokio::test]
    async fn recording_transport_replays_in_order() {
        let transport = RecordingTransport::new().on(
            Method::Get,
            "/vms/1",
            [
                Reply::Json(json!({"pause_bots": true})),
                Reply::Json(json!({"pause_bots": false})),
            ],
        );
        let api = Api::new(Arc::new(transport.clone()));

        let first: Value = api.get_json("http://h/vms/1".into()).await.unwrap();
        let second: Value = api.get_json("http://h/vms/1".into()).await.unwrap();
        let third: Value = api.get_json("http://h/vms/1".into()).await.unwrap();

        assert_eq!(first["pause_bots"], true);
        assert_eq!(second["pause_bots"], false);
        assert_eq!(third["pause_bots"], false);
        assert_eq!(transport.calls_to(Method::Get, "/vms/1").len(), 3);
    }

    #[tokio::test]
    async fn recording_transport_maps_status_replies() {
        let transport = RecordingTransport::new().on(
            Method::Put,
            "/start",
            [Reply::Status(409, "terminated".into())],
        );
        let api = Api::new(Arc::new(transport));

        let err = api.put("http://h/vms/1/start".into()).await.unwrap_err();
        assert_eq!(err.status_code(), Some(409));
        assert!(api.delete("http://h/vms/1".into()).await.is_ok());
    }
}
