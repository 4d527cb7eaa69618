//! Bridge between a desktop shell's custom URL-scheme handler and an embedded
//! web-application server.
//!
//! # Overview
//! The shell intercepts requests for the bridge's local origin and hands them
//! to [`Bridge`]. Each request is rebuilt as a [`SyntheticRequest`] carrying
//! only path and query plus the cookies the jar holds for that URL, handed to
//! the embedded handler together with a [`ResponseSink`], and the handler's
//! output is captured as a streaming [`BridgedResponse`]. Cookies the handler
//! set are written back to the shell's jar before the response is returned.
//!
//! # Design
//! - The shell's networking layer and cookie store are reached only through
//!   the [`SchemeRegistry`] and [`CookieJar`] traits; in-memory versions of both
//!   ship with the crate for headless use and tests.
//! - Installation returns an owned [`InterceptorHandle`]; `uninstall` is the
//!   only way to release the scheme and the shared placeholder connection.
//! - Failures after origin validation never reach the shell as transport
//!   errors: they become a 500 response whose body is the error message.

pub mod config;
pub mod connection;
pub mod cookie;
pub mod error;
pub mod interceptor;
pub mod jar;
pub mod message;
pub mod registry;
pub mod request;
pub mod response;

pub use config::{BridgeConfig, Origin};
pub use connection::PlaceholderConnection;
pub use cookie::CookieRecord;
pub use error::{BridgeError, ConfigError, CookieError, JarError, RegistryError, SinkError};
pub use interceptor::{handler_fn, Bridge, EmbeddedHandler, HandlerError, HandlerFn, InterceptorHandle};
pub use jar::{CookieJar, CookieQuery, MemoryCookieJar};
pub use message::{BodyStream, BridgedResponse, InterceptedRequest, ResponseHead};
pub use registry::{MemoryRegistry, SchemeHandler, SchemePrivileges, SchemeRegistry};
pub use request::{ParsedUrl, SyntheticRequest};
pub use response::{response_channel, PendingResponse, ResponseBody, ResponseSink};
