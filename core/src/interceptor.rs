//! The protocol interceptor: install, per-request orchestration, uninstall.
//!
//! # Design
//! `Bridge::install` registers a `BridgeService` as the one handler for the
//! configured origin's scheme and returns an `InterceptorHandle`. The handle is
//! the only way to release the scheme and the placeholder connection.
//!
//! Each intercepted request moves through four stages:
//!
//! ```text
//! receiving --build--> dispatched --head--> cookie-syncing --> responding
//! ```
//!
//! The embedded handler runs on its own task so that a slow or stuck handler
//! only holds up its own request. The task reports how the handler call ended
//! (return value or panic) through the sink's supervisor, so a failing handler
//! rejects the pending response instead of leaving it hanging. Until headers
//! are committed the task is aborted if the request is dropped.
//!
//! Every failure after the scheme handler is entered becomes a 500 response
//! whose body is the error message; nothing is propagated to the shell.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use http::header::SET_COOKIE;
use http::HeaderMap;
use tokio::task::AbortHandle;
use tracing::{debug, debug_span, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::config::{BridgeConfig, Origin};
use crate::connection::PlaceholderConnection;
use crate::cookie;
use crate::error::{BridgeError, RegistryError};
use crate::jar::CookieJar;
use crate::message::{BridgedResponse, InterceptedRequest};
use crate::registry::{SchemeHandler, SchemePrivileges, SchemeRegistry};
use crate::request::{self, ParsedUrl, SyntheticRequest};
use crate::response::{response_channel, ResponseSink};

/// Error type embedded handlers report.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The embedded web-application server, seen through the one call the bridge
/// makes on it.
///
/// The handler owns `response` and completes the exchange through it:
/// committing headers, writing chunks and calling `end`. Returning `Ok` is not
/// a completion signal; a handler may hand the sink to another task and
/// return early.
#[async_trait]
pub trait EmbeddedHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: SyntheticRequest,
        response: ResponseSink,
        url: ParsedUrl,
    ) -> Result<(), HandlerError>;
}

/// An `EmbeddedHandler` backed by a closure. Built by [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as an `EmbeddedHandler`.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(SyntheticRequest, ResponseSink, ParsedUrl) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EmbeddedHandler for HandlerFn<F>
where
    F: Fn(SyntheticRequest, ResponseSink, ParsedUrl) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        request: SyntheticRequest,
        response: ResponseSink,
        url: ParsedUrl,
    ) -> Result<(), HandlerError> {
        (self.f)(request, response, url).await
    }
}

/// An interceptor ready to be installed.
pub struct Bridge {
    config: BridgeConfig,
    handler: Arc<dyn EmbeddedHandler>,
    jar: Arc<dyn CookieJar>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, handler: Arc<dyn EmbeddedHandler>, jar: Arc<dyn CookieJar>) -> Self {
        Self { config, handler, jar }
    }

    /// Register as the exclusive handler for the configured origin's scheme.
    ///
    /// In development mode nothing is registered and the returned handle is
    /// inactive. Installing on a scheme that already has a handler fails with
    /// `BridgeError::AlreadyInstalled`.
    pub fn install(self, registry: Arc<dyn SchemeRegistry>) -> Result<InterceptorHandle, BridgeError> {
        self.config.validate()?;
        let origin = self.config.origin();

        if self.config.dev {
            info!(%origin, "development mode, interception disabled");
            return Ok(InterceptorHandle { origin, active: None });
        }

        let scheme = origin.scheme().to_string();
        if registry.is_handled(&scheme) {
            return Err(BridgeError::AlreadyInstalled(scheme));
        }
        registry.register_scheme(&scheme, SchemePrivileges::bridge());

        let connection = Arc::new(PlaceholderConnection::new(&origin));
        let service = BridgeService {
            origin: origin.clone(),
            debug: self.config.debug,
            high_water_mark: self.config.high_water_mark,
            handler: self.handler,
            jar: self.jar,
            connection: Arc::clone(&connection),
        };
        registry
            .handle(&scheme, Arc::new(service))
            .map_err(|err| match err {
                RegistryError::AlreadyHandled(scheme) => BridgeError::AlreadyInstalled(scheme),
                other => BridgeError::Registry(other),
            })?;

        info!(%origin, connection = %connection.id(), "interceptor installed");
        Ok(InterceptorHandle {
            origin,
            active: Some(Installed { registry, connection }),
        })
    }
}

struct Installed {
    registry: Arc<dyn SchemeRegistry>,
    connection: Arc<PlaceholderConnection>,
}

/// Owns an installed interceptor. `uninstall` is the only way to release it.
#[must_use = "the interceptor stays installed until `uninstall` is called"]
pub struct InterceptorHandle {
    origin: Origin,
    active: Option<Installed>,
}

impl InterceptorHandle {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// False for a development-mode handle.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn connection(&self) -> Option<&Arc<PlaceholderConnection>> {
        self.active.as_ref().map(|installed| &installed.connection)
    }

    /// Deregister the scheme handler and close the placeholder connection.
    pub fn uninstall(mut self) -> Result<(), BridgeError> {
        let Some(installed) = self.active.take() else {
            return Ok(());
        };
        let result = installed.registry.unhandle(self.origin.scheme());
        installed.connection.close();
        info!(origin = %self.origin, "interceptor uninstalled");
        result.map_err(BridgeError::Registry)
    }
}

impl Drop for InterceptorHandle {
    fn drop(&mut self) {
        if self.active.is_some() {
            warn!(origin = %self.origin, "interceptor handle dropped while installed");
        }
    }
}

impl std::fmt::Debug for InterceptorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorHandle")
            .field("origin", &self.origin)
            .field("active", &self.is_active())
            .finish()
    }
}

struct BridgeService {
    origin: Origin,
    debug: bool,
    high_water_mark: usize,
    handler: Arc<dyn EmbeddedHandler>,
    jar: Arc<dyn CookieJar>,
    connection: Arc<PlaceholderConnection>,
}

impl BridgeService {
    async fn serve(&self, request: InterceptedRequest) -> Result<BridgedResponse, BridgeError> {
        let url = request.url().clone();
        self.origin.check(&url)?;

        debug!(stage = "receiving", "building synthetic request");
        let synthetic = request::build(request, self.jar.as_ref(), Arc::clone(&self.connection)).await?;
        let parsed = synthetic.parsed_url();

        let (sink, pending) = response_channel(self.high_water_mark);
        let supervisor = sink.supervise();
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(
            async move {
                let outcome = match AssertUnwindSafe(handler.handle(synthetic, sink, parsed))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(BridgeError::Handler(err.to_string())),
                    Err(panic) => Err(BridgeError::Handler(panic_message(panic.as_ref()))),
                };
                supervisor.finish(outcome);
            }
            .in_current_span(),
        );
        let guard = AbortOnDrop(Some(task.abort_handle()));

        debug!(stage = "dispatched", "awaiting response head");
        let response = pending.await_response().await?;
        guard.disarm();

        debug!(stage = "cookie-syncing", status = response.status().as_u16());
        self.sync_cookies(&url, response.headers()).await?;

        debug!(stage = "responding", status = response.status().as_u16());
        if self.debug {
            info!(%url, status = response.status().as_u16(), "handled request");
        }
        Ok(response)
    }

    /// Persist every `Set-Cookie` of the response, removing expired ones.
    /// All jar calls complete before the response is returned.
    async fn sync_cookies(&self, url: &Url, headers: &HeaderMap) -> Result<(), BridgeError> {
        let now = Utc::now();
        let records = cookie::inbound_records(headers.get_all(SET_COOKIE), now)
            .map_err(|err| BridgeError::CookieSync(Box::new(err)))?;
        for record in records {
            let result = if record.is_expired(now) {
                debug!(name = %record.name, "removing expired cookie");
                self.jar.remove(url, &record.name).await
            } else {
                self.jar.set(url, record).await
            };
            result.map_err(|err| BridgeError::CookieSync(Box::new(err)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SchemeHandler for BridgeService {
    async fn handle(&self, request: InterceptedRequest) -> BridgedResponse {
        let span = debug_span!(
            "bridge_request",
            request_id = %Uuid::new_v4(),
            method = %request.method(),
            path = request.url().path(),
        );
        async move {
            match self.serve(request).await {
                Ok(response) => response,
                Err(err) => {
                    if self.debug {
                        warn!(error = %err, "request failed");
                    } else {
                        debug!(error = %err, "request failed");
                    }
                    BridgedResponse::error(err.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Aborts the handler task if the request is dropped before its head arrives.
struct AbortOnDrop(Option<AbortHandle>);

impl AbortOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            debug!("request dropped before response head, aborting handler");
            handle.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
