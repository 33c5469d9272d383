//! A single REST call and the future its caller holds.

use super::route::CompiledRoute;
use crate::error::{ConnectorError, Result};
use log::{trace, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

/// A file sent as one part of a multipart body.
#[derive(Debug, Clone)]
pub struct FileAttachment {
    pub filename: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    /// `payload_json` plus files; rebuilt for every attempt.
    Multipart {
        payload: Option<Value>,
        files: Vec<FileAttachment>,
    },
}

type Precondition = Box<dyn Fn() -> bool + Send + Sync>;

/// One HTTP call, consumed exactly once by the rate limiter and requester.
///
/// Dropping a request that never delivered a result delivers
/// [`ConnectorError::RequestAborted`], so the caller is never left waiting.
pub struct Request {
    id: Uuid,
    route: CompiledRoute,
    body: RequestBody,
    headers: HeaderMap,
    reason: Option<String>,
    cancelled: Arc<AtomicBool>,
    precondition: Option<Precondition>,
    fail_on_rate_limit: bool,
    responder: Option<oneshot::Sender<Result<RestResponse>>>,
}

impl Request {
    pub fn new(route: CompiledRoute) -> Self {
        Self {
            id: Uuid::new_v4(),
            route,
            body: RequestBody::Empty,
            headers: HeaderMap::new(),
            reason: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            precondition: None,
            fail_on_rate_limit: false,
            responder: None,
        }
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Audit-log reason, sent URL-encoded in `X-Audit-Log-Reason`.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Runs right before the request is sent; `false` fails it locally.
    pub fn precondition(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.precondition = Some(Box::new(check));
        self
    }

    /// Surface a 429 as [`ConnectorError::RateLimited`] instead of requeueing.
    pub fn fail_on_rate_limit(mut self, fail: bool) -> Self {
        self.fail_on_rate_limit = fail;
        self
    }

    /// Attaches the result channel and returns the caller's future.
    pub(crate) fn into_future_pair(mut self) -> (Self, RestFuture) {
        let (tx, rx) = oneshot::channel();
        self.responder = Some(tx);
        let future = RestFuture {
            state: FutureState::Pending(rx),
            cancelled: Some(Arc::clone(&self.cancelled)),
        };
        (self, future)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn route(&self) -> &CompiledRoute {
        &self.route
    }

    pub fn request_body(&self) -> &RequestBody {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn audit_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn fails_on_rate_limit(&self) -> bool {
        self.fail_on_rate_limit
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Runs the precondition, if any. A check that panics counts as failed.
    pub fn check_precondition(&self) -> bool {
        let Some(check) = self.precondition.as_ref() else {
            return true;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| check())) {
            Ok(passed) => passed,
            Err(_) => {
                warn!("Precondition of request {} panicked", self.id);
                false
            }
        }
    }

    pub fn succeed(mut self, response: RestResponse) {
        self.deliver(Ok(response));
    }

    pub fn fail(mut self, error: ConnectorError) {
        self.deliver(Err(error));
    }

    fn deliver(&mut self, result: Result<RestResponse>) {
        if let Some(tx) = self.responder.take() {
            if tx.send(result).is_err() {
                trace!("Request {} result dropped: caller went away", self.id);
            }
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.responder.is_some() {
            self.deliver(Err(ConnectorError::RequestAborted));
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("reason", &self.reason)
            .field("cancelled", &self.is_cancelled())
            .field("fail_on_rate_limit", &self.fail_on_rate_limit)
            .finish()
    }
}

/// A fully read HTTP response; nothing borrowed from the connection.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Trace identifiers (`cf-ray`, `x-request-id`) of every attempt, oldest first.
    pub trace_ids: Vec<String>,
}

impl RestResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            trace_ids: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as JSON, `None` when empty or not JSON.
    pub fn json_value(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

enum FutureState {
    Pending(oneshot::Receiver<Result<RestResponse>>),
    Ready(Option<Result<RestResponse>>),
}

/// The caller's handle on an enqueued request.
///
/// Await it, wait on it from synchronous code with [`RestFuture::blocking_wait`],
/// or register a callback with [`RestFuture::on_complete`].
pub struct RestFuture {
    state: FutureState,
    cancelled: Option<Arc<AtomicBool>>,
}

impl RestFuture {
    /// A future that resolves immediately, without touching the network.
    pub fn completed(result: Result<RestResponse>) -> Self {
        Self {
            state: FutureState::Ready(Some(result)),
            cancelled: None,
        }
    }

    /// Marks the request cancelled. Takes effect if it has not been dequeued yet.
    pub fn cancel(&self) {
        if let Some(flag) = &self.cancelled {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Blocks the current thread until the result arrives. Must not be called
    /// from inside an async context.
    pub fn blocking_wait(self) -> Result<RestResponse> {
        match self.state {
            FutureState::Ready(result) => result.unwrap_or(Err(ConnectorError::RequestAborted)),
            FutureState::Pending(rx) => rx
                .blocking_recv()
                .unwrap_or(Err(ConnectorError::RequestAborted)),
        }
    }

    /// Runs `callback` with the result on the Tokio runtime.
    pub fn on_complete<F>(self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Result<RestResponse>) + Send + 'static,
    {
        tokio::spawn(async move {
            callback(self.await);
        })
    }

    /// Awaits the result and deserializes a successful body.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        self.await?.json()
    }
}

impl Future for RestFuture {
    type Output = Result<RestResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            FutureState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(ConnectorError::RequestAborted)))
            }
            FutureState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ConnectorError::RequestAborted)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for RestFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            FutureState::Pending(_) => "pending",
            FutureState::Ready(_) => "ready",
        };
        f.debug_struct("RestFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::route::routes::GET_MESSAGE;

    fn request() -> Request {
        Request::new(GET_MESSAGE.compile(&["1", "2"]).unwrap())
    }

    #[tokio::test]
    async fn test_success_is_delivered_once() {
        let (request, future) = request().into_future_pair();
        request.succeed(RestResponse::new(StatusCode::OK, HeaderMap::new(), b"{}".to_vec()));
        let response = future.await.expect("should succeed");
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_dropped_request_aborts_future() {
        let (request, future) = request().into_future_pair();
        drop(request);
        assert!(matches!(future.await, Err(ConnectorError::RequestAborted)));
    }

    #[tokio::test]
    async fn test_cancel_from_future_flags_request() {
        let (request, future) = request().into_future_pair();
        assert!(!request.is_cancelled());
        future.cancel();
        assert!(request.is_cancelled());
    }

    #[test]
    fn test_precondition() {
        let request = request();
        assert!(request.check_precondition());
        let request = request.precondition(|| false);
        assert!(!request.check_precondition());
    }

    #[test]
    fn test_completed_future_blocking_wait() {
        let future = RestFuture::completed(Err(ConnectorError::Cancelled));
        tokio_test::assert_err!(future.blocking_wait());

        let ok = RestFuture::completed(Ok(RestResponse::new(
            StatusCode::NO_CONTENT,
            HeaderMap::new(),
            Vec::new(),
        )));
        let response = tokio_test::assert_ok!(ok.blocking_wait());
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_on_complete_runs_callback() {
        let (request, future) = request().into_future_pair();
        let (tx, rx) = oneshot::channel();
        let handle = future.on_complete(move |result| {
            let _ = tx.send(result.is_err());
        });
        request.fail(ConnectorError::PreconditionFailed);
        handle.await.unwrap();
        assert!(rx.await.unwrap());
    }
}
