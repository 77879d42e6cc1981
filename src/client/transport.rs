//! How the driver reaches a server.
//!
//! [`HttpTransport`] talks to a real server with `reqwest`.
//! [`LocalTransport`] calls an in-process [`UploadEngine`] and renders its
//! results exactly as the HTTP handlers do, which also lets it deliver the
//! provisional announcement that interim HTTP responses would carry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use reqwest::Url;
use tokio::sync::oneshot;

use super::source::SourceStream;
use crate::engine::{BodyStream, CreateRequest, Provisional, UploadEngine, UploadOutcome};
use crate::handlers::uploads::{failure, respond};
use crate::protocol::{idempotency_key, parse_offset, ProtocolVersion};

pub type ReplyFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<ServerReply>> + Send + 'a>>;

/// A final response as the driver sees it.
#[derive(Debug, Clone)]
pub struct ServerReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ServerReply {
    /// Body as text, for error reporting.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A creation request in flight.
///
/// `provisional` yields at most once, before `response` resolves, if the
/// transport can observe interim responses.  It closes without a value
/// otherwise.
pub struct Exchange<'a> {
    pub provisional: oneshot::Receiver<Provisional>,
    pub response: ReplyFuture<'a>,
}

/// The four protocol requests.  `location` is the upload URL learned from
/// a creation response.
pub trait Transport: Send + Sync {
    fn create(&self, headers: HeaderMap, body: SourceStream) -> Exchange<'_>;

    fn append(&self, location: &str, headers: HeaderMap, body: SourceStream) -> ReplyFuture<'_>;

    fn query(&self, location: &str, headers: HeaderMap) -> ReplyFuture<'_>;

    fn cancel(&self, location: &str, headers: HeaderMap) -> ReplyFuture<'_>;
}

// -- HTTP ---------------------------------------------------------------------

/// Transport over real HTTP.
///
/// `reqwest` (through hyper) consumes 1xx responses internally, so the
/// provisional channel of its exchanges always closes empty and the
/// driver relies on the final `Location` and the idempotency key instead.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    /// `endpoint` is the URL creation requests are posted to.
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid endpoint URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
        })
    }

    /// Resolve an upload location against the endpoint; relative
    /// locations are allowed.
    fn resolve(&self, location: &str) -> anyhow::Result<Url> {
        self.endpoint
            .join(location)
            .with_context(|| format!("invalid upload location {location:?}"))
    }

    async fn send(request: reqwest::RequestBuilder) -> anyhow::Result<ServerReply> {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(ServerReply {
            status,
            headers,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn create(&self, headers: HeaderMap, body: SourceStream) -> Exchange<'_> {
        // The sender is dropped right away: there is nothing to forward.
        let (_, provisional) = oneshot::channel();
        let request = self
            .http
            .post(self.endpoint.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body));
        Exchange {
            provisional,
            response: Box::pin(Self::send(request)),
        }
    }

    fn append(&self, location: &str, headers: HeaderMap, body: SourceStream) -> ReplyFuture<'_> {
        let url = self.resolve(location);
        Box::pin(async move {
            let request = self
                .http
                .patch(url?)
                .headers(headers)
                .header("content-type", "application/offset+octet-stream")
                .body(reqwest::Body::wrap_stream(body));
            Self::send(request).await
        })
    }

    fn query(&self, location: &str, headers: HeaderMap) -> ReplyFuture<'_> {
        let url = self.resolve(location);
        Box::pin(async move { Self::send(self.http.head(url?).headers(headers)).await })
    }

    fn cancel(&self, location: &str, headers: HeaderMap) -> ReplyFuture<'_> {
        let url = self.resolve(location);
        Box::pin(async move { Self::send(self.http.delete(url?).headers(headers)).await })
    }
}

// -- In-process ---------------------------------------------------------------

/// Transport that drives an [`UploadEngine`] in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    engine: Arc<UploadEngine>,
    default_version: ProtocolVersion,
}

impl LocalTransport {
    pub fn new(engine: Arc<UploadEngine>, default_version: ProtocolVersion) -> Self {
        Self {
            engine,
            default_version,
        }
    }

    fn version(&self, headers: &HeaderMap) -> ProtocolVersion {
        ProtocolVersion::detect(headers, self.default_version)
    }
}

/// The upload id is the last path segment of its location.
fn upload_id(location: &str) -> &str {
    location.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn engine_body(body: SourceStream) -> BodyStream {
    body
}

async fn into_reply(response: Response) -> anyhow::Result<ServerReply> {
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await?;
    Ok(ServerReply {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

impl Transport for LocalTransport {
    fn create(&self, headers: HeaderMap, body: SourceStream) -> Exchange<'_> {
        let version = self.version(&headers);
        let request = CreateRequest {
            idempotency_key: idempotency_key(&headers),
            complete: version.declares_complete(&headers),
            version,
        };
        let (tx, provisional) = oneshot::channel();
        let response = Box::pin(async move {
            let result = self
                .engine
                .create(request, engine_body(body), Some(tx))
                .await;
            into_reply(respond("create", version, result)).await
        });
        Exchange {
            provisional,
            response,
        }
    }

    fn append(&self, location: &str, headers: HeaderMap, body: SourceStream) -> ReplyFuture<'_> {
        let id = upload_id(location).to_string();
        Box::pin(async move {
            let version = self.version(&headers);
            let result = self
                .engine
                .append(
                    &id,
                    parse_offset(&headers),
                    version.declares_complete(&headers),
                    engine_body(body),
                )
                .await;
            into_reply(respond("append", version, result)).await
        })
    }

    fn query(&self, location: &str, headers: HeaderMap) -> ReplyFuture<'_> {
        let id = upload_id(location).to_string();
        Box::pin(async move {
            let version = self.version(&headers);
            let result = self
                .engine
                .query_offset(&id)
                .await
                .map(|state| UploadOutcome {
                    status: StatusCode::OK,
                    location: None,
                    state,
                });
            into_reply(respond("query", version, result)).await
        })
    }

    fn cancel(&self, location: &str, headers: HeaderMap) -> ReplyFuture<'_> {
        let id = upload_id(location).to_string();
        Box::pin(async move {
            let version = self.version(&headers);
            let response = match self.engine.cancel(&id).await {
                Ok(()) => Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(axum::body::Body::empty())?,
                Err(err) => failure("cancel", version, err),
            };
            into_reply(response).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_from_location() {
        assert_eq!(upload_id("http://localhost:8080/uploads/abc-123"), "abc-123");
        assert_eq!(upload_id("/uploads/abc-123/"), "abc-123");
    }

    #[test]
    fn test_http_transport_resolves_relative_locations() {
        let transport = HttpTransport::new("http://localhost:8080/").unwrap();
        assert_eq!(
            transport.resolve("/uploads/abc").unwrap().as_str(),
            "http://localhost:8080/uploads/abc"
        );
        assert_eq!(
            transport
                .resolve("https://other.example/uploads/abc")
                .unwrap()
                .as_str(),
            "https://other.example/uploads/abc"
        );
    }

    #[test]
    fn test_http_transport_rejects_bad_endpoint() {
        assert!(HttpTransport::new("not a url").is_err());
    }
}
