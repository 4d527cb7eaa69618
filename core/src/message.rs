//! Request and response values exchanged with the desktop shell.
//!
//! # Design
//! `InterceptedRequest` is what the shell's scheme handler receives: method,
//! absolute URL, headers and an optional body stream. It is read-only once
//! built. `BridgedResponse` is what the bridge hands back: status, reason
//! phrase and headers fixed at header-commit time, plus a body the shell can
//! start reading before the embedded handler has finished writing it.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{self, Stream};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::BridgeError;
use crate::response::ResponseBody;

/// Byte stream carrying an intercepted request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A request captured by the shell's scheme handler.
pub struct InterceptedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<BodyStream>,
}

impl InterceptedRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Parse `url` and build a bodiless `GET`.
    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    /// Append a header, keeping any earlier values for the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.with_body_stream(stream::once(async move { Ok(body) }))
    }

    pub fn with_body_stream<S>(mut self, body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        self.body = Some(Box::pin(body));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn into_parts(self) -> (Method, Url, HeaderMap, Option<BodyStream>) {
        (self.method, self.url, self.headers, self.body)
    }
}

impl fmt::Debug for InterceptedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Status line and headers captured at the header-commit instant.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
}

/// The response returned to the shell for one intercepted request.
#[derive(Debug)]
pub struct BridgedResponse {
    head: ResponseHead,
    body: ResponseBody,
}

impl BridgedResponse {
    pub(crate) fn from_parts(head: ResponseHead, body: ResponseBody) -> Self {
        Self { head, body }
    }

    /// A 500 response whose body is `message`, used for every converted failure.
    pub fn error(message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        Self {
            head: ResponseHead {
                status,
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
            },
            body: ResponseBody::full(Bytes::from(message.into())),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn status_text(&self) -> &str {
        &self.head.status_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_parts(self) -> (ResponseHead, ResponseBody) {
        (self.head, self.body)
    }

    /// Drain the body into a single buffer.
    pub async fn bytes(self) -> Result<Bytes, BridgeError> {
        self.body.collect().await
    }

    /// Drain the body and decode it as UTF-8, replacing invalid sequences.
    pub async fn text(self) -> Result<String, BridgeError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
