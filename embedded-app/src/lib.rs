//! A small axum application embedded behind the protocol bridge.
//!
//! # Design
//! `app()` is an ordinary router: a cookie-backed session, an echo endpoint
//! and a chunked stream. It knows nothing about the bridge and is served
//! over TCP by the development binary. `RouterHandler` adapts any `Router`
//! to the bridge's `EmbeddedHandler` contract, so the same routes answer
//! intercepted requests in production.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use protocol_bridge::{EmbeddedHandler, HandlerError, ParsedUrl, PlaceholderConnection, ResponseSink, SyntheticRequest};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use tower::ServiceExt;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "sid";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user: String,
}

#[derive(Deserialize)]
pub struct Login {
    pub user: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub bridged: bool,
    pub encrypted: bool,
    pub target: String,
}

#[derive(Deserialize)]
pub struct StreamParams {
    #[serde(default = "default_chunks")]
    pub chunks: usize,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_chunks() -> usize {
    3
}

pub type Sessions = Arc<RwLock<HashMap<Uuid, Session>>>;

pub fn app() -> Router {
    let sessions: Sessions = Arc::new(RwLock::new(HashMap::new()));
    Router::new()
        .route("/session", get(current_session).post(login).delete(logout))
        .route("/echo", post(echo))
        .route("/stream", get(stream))
        .route("/connection", get(connection))
        .with_state(sessions)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

/// Value of the session cookie in a request `Cookie` header, if any.
pub fn session_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value).ok())
}

async fn login(State(sessions): State<Sessions>, Json(input): Json<Login>) -> Response {
    let session = Session {
        id: Uuid::new_v4(),
        user: input.user,
    };
    sessions.write().await.insert(session.id, session.clone());
    let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", session.id);
    (StatusCode::CREATED, [(header::SET_COOKIE, cookie)], Json(session)).into_response()
}

async fn current_session(
    State(sessions): State<Sessions>,
    headers: HeaderMap,
) -> Result<Json<Session>, StatusCode> {
    let id = session_id(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let sessions = sessions.read().await;
    sessions.get(&id).cloned().map(Json).ok_or(StatusCode::UNAUTHORIZED)
}

async fn logout(State(sessions): State<Sessions>, headers: HeaderMap) -> Response {
    if let Some(id) = session_id(&headers) {
        sessions.write().await.remove(&id);
    }
    let expired = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0");
    (StatusCode::NO_CONTENT, [(header::SET_COOKIE, expired)]).into_response()
}

async fn echo(headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn stream(Query(params): Query<StreamParams>) -> Response {
    let delay = Duration::from_millis(params.delay_ms);
    let chunks = futures::stream::iter(0..params.chunks).then(move |index| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(Bytes::from(format!("chunk {index}\n")))
    });
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response()
}

/// Reports how the request reached the app. Bridged requests carry the
/// placeholder connection as an extension.
async fn connection(request: Request) -> Json<ConnectionInfo> {
    let placeholder = request.extensions().get::<Arc<PlaceholderConnection>>();
    Json(ConnectionInfo {
        bridged: placeholder.is_some(),
        encrypted: placeholder.is_some_and(|connection| connection.encrypted()),
        target: request.uri().to_string(),
    })
}

/// Drives an axum `Router` from the bridge.
///
/// The router's response head is committed as soon as the router returns,
/// then each body frame is forwarded to the sink as it is produced, so
/// streamed responses stay streamed.
#[derive(Clone)]
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EmbeddedHandler for RouterHandler {
    async fn handle(
        &self,
        request: SyntheticRequest,
        mut sink: ResponseSink,
        _url: ParsedUrl,
    ) -> Result<(), HandlerError> {
        let request = request.into_http()?.map(Body::from);
        let response = self.router.clone().oneshot(request).await?;
        let (parts, mut body) = response.into_parts();

        sink.set_head(parts.status, parts.headers)?;
        sink.write_head()?;
        while let Some(frame) = body.frame().await {
            // Trailers have no equivalent in a bridged response.
            if let Ok(data) = frame?.into_data() {
                if !data.is_empty() {
                    sink.write(data).await?;
                }
            }
        }
        sink.end(None).await?;
        Ok(())
    }
}
