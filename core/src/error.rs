//! Error types for the protocol bridge.
//!
//! # Design
//! `BridgeError` is the orchestrator-level taxonomy: every variant renders a
//! message suitable for the body of the synthetic 500 response the
//! interceptor hands back to the desktop shell. Collaborator failures
//! (`JarError`, `RegistryError`) stay opaque strings because the bridge never
//! inspects them, only wraps and reports them.
//!
//! `CookieError` and `SinkError` are narrower: the first belongs to the
//! cookie translator, the second is what the embedded handler sees when it
//! misuses or outlives its response sink.

use thiserror::Error;

/// Failure reported by a `CookieJar` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct JarError(pub String);

impl JarError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure reported by a `SchemeRegistry` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The scheme already has a handler attached.
    #[error("scheme `{0}` is already handled")]
    AlreadyHandled(String),

    /// No handler is attached for the request's scheme.
    #[error("no handler for scheme `{0}`")]
    NotHandled(String),

    /// The shell refused to register the scheme.
    #[error("cannot register scheme `{scheme}`: {reason}")]
    Rejected { scheme: String, reason: String },
}

/// Errors produced while translating cookies in either direction.
#[derive(Debug, Error)]
pub enum CookieError {
    /// A jar record whose name cannot appear in a `Cookie` header.
    #[error("invalid cookie name `{0}`")]
    InvalidName(String),

    /// A jar record whose value cannot appear in a `Cookie` header.
    #[error("invalid value for cookie `{0}`")]
    InvalidValue(String),

    /// A `Set-Cookie` header value that is not visible ASCII. Aborts the batch.
    #[error("unreadable Set-Cookie header: {0}")]
    InvalidHeader(#[from] http::header::ToStrError),

    /// A single cookie string without a usable `name=value` pair.
    #[error("malformed cookie string `{0}`")]
    Malformed(String),
}

/// Errors returned to the embedded handler by its `ResponseSink`.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Status and headers are fixed once the first byte has been committed.
    #[error("headers already committed")]
    HeadersCommitted,

    /// `end` has already been called.
    #[error("response already completed")]
    Completed,

    /// The consumer of the response went away (request cancelled or body dropped).
    #[error("response consumer closed")]
    Closed,

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Errors raised while bridging one intercepted request.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The request URL is outside the bridge's local origin. Never retried.
    #[error("request origin `{actual}` does not match bridge origin `{expected}`")]
    OriginMismatch { expected: String, actual: String },

    /// `install` was called for a scheme that already has an interceptor.
    #[error("an interceptor is already installed for scheme `{0}`")]
    AlreadyInstalled(String),

    /// Querying the cookie jar for the outbound `Cookie` header failed.
    #[error("failed to read cookies: {0}")]
    CookieJar(#[source] JarError),

    /// Translating or persisting response cookies failed.
    #[error("failed to set cookies: {0}")]
    CookieSync(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Building the outbound `Cookie` header failed.
    #[error("failed to serialize cookies: {0}")]
    CookieHeader(#[source] CookieError),

    /// Buffering the intercepted request body failed.
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] std::io::Error),

    /// The embedded handler reported an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The response sink was dropped before `end` was called.
    #[error("response sink dropped before the response was completed")]
    SinkDropped,

    /// The request was cancelled before headers were committed.
    #[error("request cancelled before headers were committed")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors loading or validating a `BridgeConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
