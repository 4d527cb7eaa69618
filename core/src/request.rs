//! Synthetic request construction.
//!
//! # Design
//! The embedded server must see a request as if it had arrived on its own
//! socket: a path-and-query target (never scheme, host or port, which the
//! server's own URL normalisation would turn into a routing loop), the
//! caller's headers, and a body that is already complete.
//!
//! The `Cookie` header is always rebuilt from the jar. Whatever the caller
//! sent is discarded, never merged, because the jar is authoritative.
//!
//! Request bodies are buffered in full before the handler runs. That caps
//! upload size at available memory, which the same-machine interactive
//! workload tolerates.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{HeaderValue, COOKIE};
use http::{HeaderMap, Method};

use crate::connection::PlaceholderConnection;
use crate::cookie;
use crate::error::{BridgeError, CookieError};
use crate::jar::{CookieJar, CookieQuery};
use crate::message::{BodyStream, InterceptedRequest};

/// The request handed to the embedded handler.
#[derive(Debug)]
pub struct SyntheticRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    complete: bool,
    connection: Arc<PlaceholderConnection>,
}

impl SyntheticRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Request target as the server would read it off the wire: `/path?query`.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// True once the whole body is buffered; always the case after `build`.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn connection(&self) -> &Arc<PlaceholderConnection> {
        &self.connection
    }

    pub fn parsed_url(&self) -> ParsedUrl {
        ParsedUrl::new(&self.path, self.query.as_deref())
    }

    /// Convert into an `http::Request`, the placeholder connection attached
    /// as an extension.
    pub fn into_http(self) -> Result<http::Request<Bytes>, http::Error> {
        let target = self.url();
        let mut request = http::Request::builder()
            .method(self.method)
            .uri(target)
            .extension(self.connection)
            .body(self.body)?;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

/// Path and decoded query of a synthetic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub pathname: String,
    /// Raw query string including the leading `?`, if any.
    pub search: Option<String>,
    pub query: Vec<(String, String)>,
}

impl ParsedUrl {
    pub fn new(pathname: &str, query: Option<&str>) -> Self {
        Self {
            pathname: pathname.to_string(),
            search: query.map(|query| format!("?{query}")),
            query: query
                .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
                .unwrap_or_default(),
        }
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Build the synthetic request for `request`, taking cookies from `jar`.
///
/// A jar failure aborts the request; it never proceeds cookieless.
pub async fn build(
    request: InterceptedRequest,
    jar: &dyn CookieJar,
    connection: Arc<PlaceholderConnection>,
) -> Result<SyntheticRequest, BridgeError> {
    let (method, url, mut headers, body) = request.into_parts();

    headers.remove(COOKIE);
    let cookies = jar
        .get(&CookieQuery::for_url(url.clone()))
        .await
        .map_err(BridgeError::CookieJar)?;
    if let Some(header) = cookie::outbound_header(&cookies).map_err(BridgeError::CookieHeader)? {
        let value = HeaderValue::from_str(&header)
            .map_err(|_| BridgeError::CookieHeader(CookieError::InvalidValue("Cookie".into())))?;
        headers.insert(COOKIE, value);
    }

    let body = match body {
        Some(stream) => read_body(stream).await.map_err(BridgeError::RequestBody)?,
        None => Bytes::new(),
    };

    Ok(SyntheticRequest {
        method,
        path: url.path().to_string(),
        query: url.query().map(str::to_string),
        headers,
        body,
        complete: true,
        connection,
    })
}

async fn read_body(mut stream: BodyStream) -> Result<Bytes, std::io::Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream;
    use http::header::{HeaderName, ACCEPT};
    use url::Url;

    use super::*;
    use crate::config::Origin;
    use crate::cookie::CookieRecord;
    use crate::error::JarError;
    use crate::jar::MemoryCookieJar;

    struct BrokenJar;

    #[async_trait]
    impl CookieJar for BrokenJar {
        async fn get(&self, _query: &CookieQuery) -> Result<Vec<CookieRecord>, JarError> {
            Err(JarError::new("jar unavailable"))
        }

        async fn set(&self, _url: &Url, _record: CookieRecord) -> Result<(), JarError> {
            Err(JarError::new("jar unavailable"))
        }

        async fn remove(&self, _url: &Url, _name: &str) -> Result<(), JarError> {
            Err(JarError::new("jar unavailable"))
        }
    }

    fn connection() -> Arc<PlaceholderConnection> {
        Arc::new(PlaceholderConnection::new(&Origin::new("http", "localhost", 3000)))
    }

    #[tokio::test]
    async fn keeps_only_path_and_query() {
        let request = InterceptedRequest::get("http://localhost:3000/api/items?page=2&sort=asc#top").unwrap();
        let synthetic = build(request, &MemoryCookieJar::new(), connection()).await.unwrap();
        assert_eq!(synthetic.url(), "/api/items?page=2&sort=asc");
        assert_eq!(synthetic.path(), "/api/items");
        assert_eq!(synthetic.query(), Some("page=2&sort=asc"));
        assert!(!synthetic.url().contains("localhost"));
    }

    #[tokio::test]
    async fn root_url_becomes_slash() {
        let request = InterceptedRequest::get("http://localhost:3000").unwrap();
        let synthetic = build(request, &MemoryCookieJar::new(), connection()).await.unwrap();
        assert_eq!(synthetic.url(), "/");
        assert_eq!(synthetic.parsed_url().search, None);
    }

    #[tokio::test]
    async fn cookie_header_comes_from_jar_only() {
        let jar = MemoryCookieJar::new();
        let origin = Url::parse("http://localhost:3000/").unwrap();
        jar.set(&origin, CookieRecord::new("sid", "from-jar").with_path("/"))
            .await
            .unwrap();

        let request = InterceptedRequest::get("http://localhost:3000/me")
            .unwrap()
            .with_header(COOKIE, HeaderValue::from_static("sid=forged; extra=1"))
            .with_header(ACCEPT, HeaderValue::from_static("application/json"));
        let synthetic = build(request, &jar, connection()).await.unwrap();

        let cookies: Vec<_> = synthetic.headers().get_all(COOKIE).iter().collect();
        assert_eq!(cookies, ["sid=from-jar"]);
        assert_eq!(synthetic.headers()[ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn empty_jar_drops_caller_cookie_header() {
        let request = InterceptedRequest::get("http://localhost:3000/")
            .unwrap()
            .with_header(COOKIE, HeaderValue::from_static("sid=forged"));
        let synthetic = build(request, &MemoryCookieJar::new(), connection()).await.unwrap();
        assert!(synthetic.headers().get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn jar_failure_is_fatal() {
        let request = InterceptedRequest::get("http://localhost:3000/").unwrap();
        let err = build(request, &BrokenJar, connection()).await.unwrap_err();
        assert!(matches!(err, BridgeError::CookieJar(_)));
        assert_eq!(err.to_string(), "failed to read cookies: jar unavailable");
    }

    #[tokio::test]
    async fn body_is_fully_buffered() {
        let chunks = vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let request = InterceptedRequest::new(Method::POST, Url::parse("http://localhost:3000/echo").unwrap())
            .with_header(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain"))
            .with_body_stream(stream::iter(chunks));
        let synthetic = build(request, &MemoryCookieJar::new(), connection()).await.unwrap();
        assert!(synthetic.is_complete());
        assert_eq!(synthetic.body(), &Bytes::from("hello world"));
        assert_eq!(*synthetic.method(), Method::POST);
    }

    #[tokio::test]
    async fn body_stream_error_aborts() {
        let chunks = vec![
            Ok(Bytes::from("partial")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "upload aborted")),
        ];
        let request = InterceptedRequest::new(Method::PUT, Url::parse("http://localhost:3000/").unwrap())
            .with_body_stream(stream::iter(chunks));
        let err = build(request, &MemoryCookieJar::new(), connection()).await.unwrap_err();
        assert!(matches!(err, BridgeError::RequestBody(_)));
    }

    #[test]
    fn parsed_url_decodes_query() {
        let parsed = ParsedUrl::new("/search", Some("q=rust%20lang&tag=a&tag=b"));
        assert_eq!(parsed.pathname, "/search");
        assert_eq!(parsed.search.as_deref(), Some("?q=rust%20lang&tag=a&tag=b"));
        assert_eq!(parsed.get("q"), Some("rust lang"));
        assert_eq!(parsed.get("tag"), Some("a"));
        assert_eq!(parsed.query.len(), 3);
        assert_eq!(parsed.get("missing"), None);
    }

    #[tokio::test]
    async fn into_http_carries_target_headers_and_connection() {
        let request = InterceptedRequest::get("http://localhost:3000/a?b=c")
            .unwrap()
            .with_header(ACCEPT, HeaderValue::from_static("text/html"));
        let synthetic = build(request, &MemoryCookieJar::new(), connection()).await.unwrap();
        let http_request = synthetic.into_http().unwrap();
        assert_eq!(http_request.uri(), "/a?b=c");
        assert_eq!(http_request.headers()[ACCEPT], "text/html");
        assert!(http_request.extensions().get::<Arc<PlaceholderConnection>>().is_some());
    }
}
