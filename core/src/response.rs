//! Streaming response capture.
//!
//! # Design
//! `response_channel` splits one response into two halves. The embedded
//! handler gets the `ResponseSink`; the bridge keeps the `PendingResponse`.
//!
//! The sink is an explicit state machine:
//!
//! ```text
//! Pending --commit--> Committed --end--> Complete
//!    |                    |
//!    +-------fail/drop----+---------> Failed
//! ```
//!
//! Status and headers are only mutable while `Pending`. Committing (explicitly
//! via `write_head`, or implicitly on the first `write`/`end`) snapshots them
//! into a `ResponseHead` and resolves the pending half through a oneshot, so
//! `await_response` resolves exactly once and always with the commit-time
//! head. Body chunks travel over a bounded channel whose receiver is only
//! reachable through the resolved `BridgedResponse`; no chunk can be observed
//! before the head.
//!
//! The channel bound is the flow-control signal: when the consumer falls
//! behind, `write` suspends and `is_paused` reports true until the consumer
//! pulls another chunk.
//!
//! A sink that fails or is dropped before `end` resolves the pending half with
//! an error (before commit) or leaves a terminal error for the body stream
//! (after commit), so neither side can hang on an abandoned sink.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, SinkError};
use crate::message::{BridgedResponse, ResponseHead};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Pending,
    Committed,
    Complete,
    /// Dropped while a supervisor is watching; the supervisor decides the error.
    Abandoned,
    Failed,
}

type HeadResult = Result<ResponseHead, BridgeError>;

struct Shared {
    state: SinkState,
    head_tx: Option<oneshot::Sender<HeadResult>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
    error: Option<BridgeError>,
    supervised: bool,
}

impl Shared {
    fn fail(&mut self, error: BridgeError) {
        if matches!(self.state, SinkState::Complete | SinkState::Failed) {
            return;
        }
        match self.head_tx.take() {
            Some(head_tx) => {
                let _ = head_tx.send(Err(error));
            }
            None => self.error = Some(error),
        }
        self.state = SinkState::Failed;
        self.body_tx = None;
    }
}

/// Create a connected sink/pending pair. `high_water_mark` is the number of
/// chunks buffered before the sink pauses (at least one).
pub fn response_channel(high_water_mark: usize) -> (ResponseSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(high_water_mark.max(1));
    let shared = Arc::new(Mutex::new(Shared {
        state: SinkState::Pending,
        head_tx: Some(head_tx),
        body_tx: Some(body_tx),
        error: None,
        supervised: false,
    }));
    let sink = ResponseSink {
        status: StatusCode::OK,
        status_text: None,
        headers: HeaderMap::new(),
        shared: Arc::clone(&shared),
    };
    let pending = PendingResponse {
        head_rx,
        body_rx,
        shared,
    };
    (sink, pending)
}

/// Handler-facing half: set status and headers, then write the body.
pub struct ResponseSink {
    status: StatusCode,
    status_text: Option<String>,
    headers: HeaderMap,
    shared: Arc<Mutex<Shared>>,
}

impl ResponseSink {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), SinkError> {
        self.ensure_pending()?;
        self.status = status;
        Ok(())
    }

    /// Override the reason phrase sent with the status code.
    pub fn set_status_text(&mut self, text: impl Into<String>) -> Result<(), SinkError> {
        self.ensure_pending()?;
        self.status_text = Some(text.into());
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replace every value of `name` with `value`.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), SinkError> {
        self.ensure_pending()?;
        let (name, value) = parse_header(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Add a value for `name`, keeping earlier ones (e.g. several `Set-Cookie`).
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), SinkError> {
        self.ensure_pending()?;
        let (name, value) = parse_header(name, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), SinkError> {
        self.ensure_pending()?;
        self.headers.remove(name);
        Ok(())
    }

    /// Replace status and headers wholesale while still pending.
    pub fn set_head(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), SinkError> {
        self.ensure_pending()?;
        self.status = status;
        self.headers = headers;
        Ok(())
    }

    pub fn headers_committed(&self) -> bool {
        self.shared.lock().state != SinkState::Pending
    }

    /// Commit status and headers now, before any body byte.
    pub fn write_head(&mut self) -> Result<(), SinkError> {
        self.commit()
    }

    /// Write one body chunk, committing headers first if still pending.
    ///
    /// Suspends while the consumer is behind by `high_water_mark` chunks.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), SinkError> {
        self.commit()?;
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let body_tx = self.body_sender()?;
        body_tx.send(chunk).await.map_err(|_| SinkError::Closed)
    }

    /// True while the body buffer is full and writes would suspend.
    pub fn is_paused(&self) -> bool {
        self.shared
            .lock()
            .body_tx
            .as_ref()
            .is_some_and(|body_tx| body_tx.capacity() == 0)
    }

    /// Wait until a write would not suspend.
    pub async fn ready(&self) -> Result<(), SinkError> {
        let body_tx = self.body_sender()?;
        body_tx.reserve().await.map(drop).map_err(|_| SinkError::Closed)
    }

    /// True once nobody is left to read the response.
    pub fn is_closed(&self) -> bool {
        let shared = self.shared.lock();
        match (&shared.head_tx, &shared.body_tx) {
            (Some(head_tx), _) => head_tx.is_closed(),
            (None, Some(body_tx)) => body_tx.is_closed(),
            (None, None) => true,
        }
    }

    /// Finish the response, optionally writing a last chunk.
    ///
    /// When headers are still pending and the handler set neither
    /// `content-length` nor `transfer-encoding`, the length of `chunk` becomes
    /// the `content-length`.
    pub async fn end(mut self, chunk: Option<Bytes>) -> Result<(), SinkError> {
        if !self.headers_committed()
            && !self.headers.contains_key(CONTENT_LENGTH)
            && !self.headers.contains_key(TRANSFER_ENCODING)
        {
            let length = chunk.as_ref().map_or(0, Bytes::len);
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        if let Some(chunk) = chunk {
            self.write(chunk).await?;
        } else {
            self.commit()?;
        }
        let mut shared = self.shared.lock();
        shared.state = SinkState::Complete;
        shared.body_tx = None;
        Ok(())
    }

    /// Abort the response. Before commit the pending half rejects with
    /// `error`; after commit the body stream ends with it.
    pub fn fail(self, error: BridgeError) {
        self.shared.lock().fail(error);
    }

    /// Hand failure reporting for this sink to a supervisor that outlives the
    /// handler call.
    pub(crate) fn supervise(&self) -> SinkSupervisor {
        self.shared.lock().supervised = true;
        SinkSupervisor {
            shared: Arc::clone(&self.shared),
            finished: false,
        }
    }

    fn ensure_pending(&self) -> Result<(), SinkError> {
        match self.shared.lock().state {
            SinkState::Pending => Ok(()),
            SinkState::Committed => Err(SinkError::HeadersCommitted),
            SinkState::Complete => Err(SinkError::Completed),
            SinkState::Abandoned | SinkState::Failed => Err(SinkError::Closed),
        }
    }

    fn commit(&mut self) -> Result<(), SinkError> {
        let mut shared = self.shared.lock();
        match shared.state {
            SinkState::Pending => {}
            SinkState::Committed => return Ok(()),
            SinkState::Complete => return Err(SinkError::Completed),
            SinkState::Abandoned | SinkState::Failed => return Err(SinkError::Closed),
        }
        let head = ResponseHead {
            status: self.status,
            status_text: self.status_text.clone().unwrap_or_else(|| {
                self.status.canonical_reason().unwrap_or_default().to_string()
            }),
            headers: self.headers.clone(),
        };
        let Some(head_tx) = shared.head_tx.take() else {
            shared.state = SinkState::Failed;
            return Err(SinkError::Closed);
        };
        if head_tx.send(Ok(head)).is_err() {
            shared.state = SinkState::Failed;
            shared.body_tx = None;
            return Err(SinkError::Closed);
        }
        shared.state = SinkState::Committed;
        Ok(())
    }

    fn body_sender(&self) -> Result<mpsc::Sender<Bytes>, SinkError> {
        self.shared.lock().body_tx.clone().ok_or(SinkError::Closed)
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        if matches!(shared.state, SinkState::Pending | SinkState::Committed) {
            if shared.supervised {
                shared.state = SinkState::Abandoned;
            } else {
                shared.fail(BridgeError::SinkDropped);
            }
        }
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("state", &self.shared.lock().state)
            .finish()
    }
}

/// Reports how the handler call that owned a sink ended.
pub(crate) struct SinkSupervisor {
    shared: Arc<Mutex<Shared>>,
    finished: bool,
}

impl SinkSupervisor {
    pub(crate) fn finish(mut self, outcome: Result<(), BridgeError>) {
        self.finished = true;
        let mut shared = self.shared.lock();
        match outcome {
            Err(error) => shared.fail(error),
            Ok(()) if shared.state == SinkState::Abandoned => shared.fail(BridgeError::SinkDropped),
            // The handler handed the sink on; its own drop reports from here.
            Ok(()) => shared.supervised = false,
        }
    }
}

impl Drop for SinkSupervisor {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut shared = self.shared.lock();
        shared.supervised = false;
        if shared.state == SinkState::Abandoned {
            shared.fail(BridgeError::Cancelled);
        }
    }
}

/// Bridge-facing half: resolves once the handler commits headers.
pub struct PendingResponse {
    head_rx: oneshot::Receiver<HeadResult>,
    body_rx: mpsc::Receiver<Bytes>,
    shared: Arc<Mutex<Shared>>,
}

impl PendingResponse {
    /// Wait for header-commit. Rejects if the sink fails or is dropped first.
    pub async fn await_response(self) -> Result<BridgedResponse, BridgeError> {
        let head = self.head_rx.await.map_err(|_| BridgeError::SinkDropped)??;
        let body = ResponseBody {
            body_rx: self.body_rx,
            shared: Some(self.shared),
            done: false,
        };
        Ok(BridgedResponse::from_parts(head, body))
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse").finish_non_exhaustive()
    }
}

/// Body of a `BridgedResponse`, yielded chunk by chunk as the handler writes.
///
/// Ends with `None` after `end`, or with one `Err` if the sink failed or was
/// dropped mid-body. Dropping it tells the sink the consumer is gone.
pub struct ResponseBody {
    body_rx: mpsc::Receiver<Bytes>,
    shared: Option<Arc<Mutex<Shared>>>,
    done: bool,
}

impl ResponseBody {
    /// A body that yields `bytes` once, then ends.
    pub fn full(bytes: Bytes) -> Self {
        let (body_tx, body_rx) = mpsc::channel(1);
        if !bytes.is_empty() {
            let _ = body_tx.try_send(bytes);
        }
        Self {
            body_rx,
            shared: None,
            done: false,
        }
    }

    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    /// Drain every remaining chunk into one buffer.
    pub async fn collect(mut self) -> Result<Bytes, BridgeError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, BridgeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.body_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                this.done = true;
                let error = this.shared.as_ref().and_then(|shared| shared.lock().error.take());
                Poll::Ready(error.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").field("done", &self.done).finish()
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), SinkError> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| SinkError::InvalidHeader(name.to_string()))?;
    let header_value =
        HeaderValue::from_str(value).map_err(|_| SinkError::InvalidHeader(name.to_string()))?;
    Ok((header_name, header_value))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn head_reflects_commit_time_state() {
        let (mut sink, pending) = response_channel(4);
        sink.set_status(StatusCode::CREATED).unwrap();
        sink.set_header("x-stage", "commit").unwrap();
        sink.write("first").await.unwrap();

        assert!(matches!(
            sink.set_header("x-stage", "late"),
            Err(SinkError::HeadersCommitted)
        ));
        assert!(matches!(
            sink.set_status(StatusCode::ACCEPTED),
            Err(SinkError::HeadersCommitted)
        ));
        sink.write("second").await.unwrap();
        sink.end(None).await.unwrap();

        let response = pending.await_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.status_text(), "Created");
        assert_eq!(response.headers()["x-stage"], "commit");

        let mut body = response.into_parts().1;
        assert_eq!(body.next().await.unwrap().unwrap(), "first");
        assert_eq!(body.next().await.unwrap().unwrap(), "second");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn end_without_body_sets_zero_content_length() {
        let (sink, pending) = response_channel(4);
        sink.end(None).await.unwrap();
        let response = pending.await_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "0");
        assert!(response.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_with_chunk_sets_content_length() {
        let (sink, pending) = response_channel(4);
        sink.end(Some(Bytes::from_static(b"hello"))).await.unwrap();
        let response = pending.await_response().await.unwrap();
        assert_eq!(response.headers()[CONTENT_LENGTH], "5");
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn explicit_content_length_is_kept() {
        let (mut sink, pending) = response_channel(4);
        sink.set_header("transfer-encoding", "chunked").unwrap();
        sink.end(Some(Bytes::from_static(b"abc"))).await.unwrap();
        let response = pending.await_response().await.unwrap();
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn custom_status_text_is_reported() {
        let (mut sink, pending) = response_channel(4);
        sink.set_status(StatusCode::IM_A_TEAPOT).unwrap();
        sink.set_status_text("Short And Stout").unwrap();
        sink.write_head().unwrap();
        assert!(sink.headers_committed());
        let response = pending.await_response().await.unwrap();
        assert_eq!(response.status_text(), "Short And Stout");
        drop(sink);
    }

    #[tokio::test]
    async fn dropping_sink_before_commit_rejects() {
        let (sink, pending) = response_channel(4);
        drop(sink);
        let err = pending.await_response().await.unwrap_err();
        assert!(matches!(err, BridgeError::SinkDropped));
    }

    #[tokio::test]
    async fn failing_sink_before_commit_rejects_with_cause() {
        let (sink, pending) = response_channel(4);
        sink.fail(BridgeError::Handler("render failed".into()));
        let err = pending.await_response().await.unwrap_err();
        assert_eq!(err.to_string(), "handler failed: render failed");
    }

    #[tokio::test]
    async fn dropping_sink_mid_body_ends_stream_with_error() {
        let (mut sink, pending) = response_channel(4);
        sink.write("partial").await.unwrap();
        drop(sink);
        let response = pending.await_response().await.unwrap();
        let mut body = response.into_parts().1;
        assert_eq!(body.next().await.unwrap().unwrap(), "partial");
        assert!(matches!(body.next().await, Some(Err(BridgeError::SinkDropped))));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn full_buffer_pauses_until_consumer_pulls() {
        let (mut sink, pending) = response_channel(1);
        sink.write("a").await.unwrap();
        assert!(sink.is_paused());

        let response = pending.await_response().await.unwrap();
        let mut body = response.into_parts().1;

        let blocked = tokio::time::timeout(Duration::from_millis(50), sink.write("b")).await;
        assert!(blocked.is_err(), "write should suspend while paused");

        assert_eq!(body.next().await.unwrap().unwrap(), "a");
        assert!(!sink.is_paused());
        sink.ready().await.unwrap();
        sink.write("c").await.unwrap();
        assert_eq!(body.next().await.unwrap().unwrap(), "c");
    }

    #[tokio::test]
    async fn dropped_consumer_closes_sink() {
        let (mut sink, pending) = response_channel(4);
        drop(pending);
        assert!(sink.is_closed());
        assert!(matches!(sink.write("x").await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn dropped_body_closes_sink_after_commit() {
        let (mut sink, pending) = response_channel(4);
        sink.write_head().unwrap();
        let response = pending.await_response().await.unwrap();
        drop(response);
        assert!(sink.is_closed());
        assert!(matches!(sink.write("x").await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn supervisor_reports_handler_error_after_sink_drop() {
        let (sink, pending) = response_channel(4);
        let supervisor = sink.supervise();
        drop(sink);
        supervisor.finish(Err(BridgeError::Handler("db offline".into())));
        let err = pending.await_response().await.unwrap_err();
        assert_eq!(err.to_string(), "handler failed: db offline");
    }

    #[tokio::test]
    async fn supervisor_reports_drop_when_handler_returned_ok() {
        let (sink, pending) = response_channel(4);
        let supervisor = sink.supervise();
        drop(sink);
        supervisor.finish(Ok(()));
        assert!(matches!(
            pending.await_response().await,
            Err(BridgeError::SinkDropped)
        ));
    }

    #[tokio::test]
    async fn supervisor_releases_sink_handed_elsewhere() {
        let (sink, pending) = response_channel(4);
        let supervisor = sink.supervise();
        supervisor.finish(Ok(()));
        sink.end(Some(Bytes::from_static(b"later"))).await.unwrap();
        let response = pending.await_response().await.unwrap();
        assert_eq!(response.text().await.unwrap(), "later");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let (mut sink, _pending) = response_channel(1);
        assert!(matches!(
            sink.set_header("bad header", "x"),
            Err(SinkError::InvalidHeader(_))
        ));
    }
}
