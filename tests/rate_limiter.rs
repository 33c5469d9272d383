// tests/rate_limiter.rs
//
// Drives the limiter with an in-process executor and paused Tokio time, so
// every wait is observable on the virtual clock.

use async_trait::async_trait;
use chat_connector_rs::rest::bucket::MAX_RATE_LIMIT_WAIT;
use chat_connector_rs::rest::requester::complete;
use chat_connector_rs::rest::{
    routes, ExecuteOutcome, RateLimiter, Request, RequestExecutor, RestFuture, RestResponse,
};
use chat_connector_rs::ConnectorError;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Call {
    path: String,
    body: Option<Value>,
    at: Instant,
}

type Responder = Box<dyn Fn(usize, &Request) -> RestResponse + Send + Sync>;

struct FakeServer {
    calls: Mutex<Vec<Call>>,
    respond: Responder,
}

impl FakeServer {
    fn new(respond: impl Fn(usize, &Request) -> RestResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestExecutor for FakeServer {
    async fn execute(&self, request: Request, limiter: &RateLimiter) -> ExecuteOutcome {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let body = match request.request_body() {
                chat_connector_rs::rest::RequestBody::Json(value) => Some(value.clone()),
                _ => None,
            };
            calls.push(Call {
                path: request.route().path(),
                body,
                at: Instant::now(),
            });
            calls.len() - 1
        };
        let response = (self.respond)(index, &request);
        complete(request, response, limiter)
    }
}

fn response(status: u16, headers: &[(&'static str, String)], body: Value) -> RestResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    RestResponse::new(
        StatusCode::from_u16(status).unwrap(),
        map,
        body.to_string().into_bytes(),
    )
}

fn limited(limit: u32, remaining: u32, reset_after_secs: u64) -> RestResponse {
    response(
        200,
        &[
            ("x-ratelimit-limit", limit.to_string()),
            ("x-ratelimit-remaining", remaining.to_string()),
            ("x-ratelimit-reset-after", reset_after_secs.to_string()),
        ],
        json!({}),
    )
}

fn too_many(retry_after_secs: u64, global: bool) -> RestResponse {
    response(
        429,
        &[("retry-after", retry_after_secs.to_string())],
        json!({"message": "You are being rate limited.", "retry_after": retry_after_secs, "global": global}),
    )
}

fn message_request(channel: &str) -> Request {
    Request::new(routes::GET_MESSAGE.compile(&[channel, "1"]).unwrap())
}

fn limiter_for(server: &Arc<FakeServer>) -> RateLimiter {
    RateLimiter::new(server.clone(), Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn test_five_per_ten_seconds_window() {
    let window: Mutex<Option<(Instant, u32)>> = Mutex::new(None);
    let server = FakeServer::new(move |_, _| {
        let now = Instant::now();
        let mut window = window.lock().unwrap();
        let (start, used) = match *window {
            Some((start, used)) if now < start + Duration::from_secs(10) => (start, used),
            _ => (now, 0),
        };
        if used >= 5 {
            return too_many(10, false);
        }
        *window = Some((start, used + 1));
        let reset_after = (start + Duration::from_secs(10) - now).as_secs();
        limited(5, 5 - (used + 1), reset_after)
    });
    let limiter = limiter_for(&server);
    let start = Instant::now();

    let futures: Vec<RestFuture> = (0..6)
        .map(|_| limiter.submit(message_request("100")))
        .collect();
    for future in futures {
        let response = future.await.expect("request should succeed");
        assert_eq!(response.status, StatusCode::OK);
    }

    let calls = server.calls();
    assert_eq!(calls.len(), 6, "no request should have been rejected with 429");
    for call in &calls[..5] {
        assert!(call.at - start < Duration::from_secs(1));
    }
    assert!(calls[5].at - start >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_fifo_within_bucket() {
    let server = FakeServer::new(|_, _| limited(2, 1, 1));
    let limiter = limiter_for(&server);

    let futures: Vec<RestFuture> = (0..8)
        .map(|n| limiter.submit(message_request("7").json(&json!({ "n": n })).unwrap()))
        .collect();
    for future in futures {
        future.await.unwrap();
    }

    let order: Vec<i64> = server
        .calls()
        .iter()
        .map(|call| call.body.as_ref().unwrap()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..8).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_major_parameters_partition_buckets() {
    let server = FakeServer::new(|_, request| {
        if request.route().path().starts_with("channels/1/") {
            limited(1, 0, 30)
        } else {
            limited(5, 4, 30)
        }
    });
    let limiter = limiter_for(&server);
    let start = Instant::now();

    limiter.submit(message_request("1")).await.unwrap();
    let exhausted = message_request("1");
    assert!(limiter.is_rate_limited(exhausted.route()));
    assert!(!limiter.is_rate_limited(message_request("2").route()));

    let blocked = limiter.submit(exhausted);
    limiter.submit(message_request("2")).await.unwrap();
    let other = server.calls().last().unwrap().clone();
    assert_eq!(other.path, "channels/2/messages/1");
    assert!(other.at - start < Duration::from_secs(1));

    blocked.await.unwrap();
    let last = server.calls().last().unwrap().clone();
    assert_eq!(last.path, "channels/1/messages/1");
    assert!(last.at - start >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_429_retry_after_is_honored() {
    let server = FakeServer::new(|index, _| {
        if index == 0 {
            too_many(3, false)
        } else {
            limited(5, 4, 5)
        }
    });
    let limiter = limiter_for(&server);

    let response = limiter.submit(message_request("9")).await.unwrap();
    assert!(response.is_success());

    let calls = server.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_global_429_blocks_every_bucket() {
    let server = FakeServer::new(|index, _| {
        if index == 0 {
            too_many(4, true)
        } else {
            limited(5, 4, 5)
        }
    });
    let limiter = limiter_for(&server);
    let start = Instant::now();

    let first = limiter.submit(message_request("1"));
    // Let the first request hit the global limit before the second is queued.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    let second = limiter.submit(message_request("2"));
    first.await.unwrap();
    second.await.unwrap();

    let calls = server.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls[1..] {
        assert!(call.at - start >= Duration::from_secs(4));
    }
}

#[tokio::test(start_paused = true)]
async fn test_fail_on_rate_limit_surfaces_error() {
    let server = FakeServer::new(|_, _| too_many(2, false));
    let limiter = limiter_for(&server);

    let result = limiter
        .submit(message_request("3").fail_on_rate_limit(true))
        .await;
    match result {
        Err(ConnectorError::RateLimited {
            retry_after, global, ..
        }) => {
            assert_eq!(retry_after, Duration::from_secs(2));
            assert!(!global);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_dequeue_makes_no_call() {
    let server = FakeServer::new(|_, _| limited(1, 0, 5));
    let limiter = limiter_for(&server);

    let first = limiter.submit(message_request("5"));
    let second = limiter.submit(message_request("5"));
    second.cancel();

    first.await.unwrap();
    let result = second.await;
    assert!(matches!(result, Err(ConnectorError::Cancelled)));
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_precondition_makes_no_call() {
    let server = FakeServer::new(|_, _| limited(5, 4, 5));
    let limiter = limiter_for(&server);

    let result = limiter
        .submit(message_request("5").precondition(|| false))
        .await;
    assert!(matches!(result, Err(ConnectorError::PreconditionFailed)));
    assert!(server.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_routes_without_headers_only_obey_global_limit() {
    let server = FakeServer::new(|_, _| response(200, &[], json!({})));
    let limiter = limiter_for(&server);
    let start = Instant::now();

    let futures: Vec<RestFuture> = (0..10)
        .map(|_| limiter.submit(message_request("11")))
        .collect();
    for future in futures {
        future.await.unwrap();
    }
    assert!(server
        .calls()
        .iter()
        .all(|call| call.at - start < Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_queued_requests_and_rejects_new_ones() {
    let server = FakeServer::new(|_, _| limited(1, 0, 60));
    let limiter = limiter_for(&server);

    limiter.submit(message_request("8")).await.unwrap();
    let queued = limiter.submit(message_request("8"));

    limiter.shutdown(Duration::from_secs(1)).await;
    assert!(limiter.is_shutdown());
    assert!(matches!(queued.await, Err(ConnectorError::Shutdown)));

    let rejected = limiter.submit(message_request("8")).await;
    assert!(matches!(rejected, Err(ConnectorError::Shutdown)));
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_buckets_are_evicted() {
    let server = FakeServer::new(|_, _| limited(5, 4, 1));
    let limiter = limiter_for(&server);

    limiter.submit(message_request("1")).await.unwrap();
    limiter.submit(message_request("2")).await.unwrap();
    assert_eq!(limiter.bucket_count(), 2);

    tokio::time::advance(Duration::from_secs(2)).await;
    // Let the workers observe their empty queues.
    tokio::task::yield_now().await;
    assert_eq!(limiter.evict_idle_buckets(), 2);
    assert_eq!(limiter.bucket_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_precondition_fails_only_that_request() {
    let server = FakeServer::new(|_, _| limited(5, 4, 5));
    let limiter = limiter_for(&server);

    let result = limiter
        .submit(message_request("6").precondition(|| panic!("precondition blew up")))
        .await;
    assert!(matches!(result, Err(ConnectorError::PreconditionFailed)));

    limiter.submit(message_request("6")).await.unwrap();
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_precondition_may_query_the_limiter() {
    let server = FakeServer::new(|_, _| limited(5, 4, 5));
    let limiter = limiter_for(&server);

    let checker = limiter.clone();
    let route = message_request("12").route().clone();
    let request = message_request("12").precondition(move || !checker.is_rate_limited(&route));

    let result = tokio::time::timeout(Duration::from_secs(5), limiter.submit(request)).await;
    assert!(result.expect("request never resolved").is_ok());
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_enormous_retry_after_is_clamped() {
    let server = FakeServer::new(|index, _| {
        if index == 0 {
            response(
                429,
                &[("retry-after", "1e300".to_string())],
                json!({"message": "You are being rate limited."}),
            )
        } else {
            limited(5, 4, 5)
        }
    });
    let limiter = limiter_for(&server);
    let start = Instant::now();

    let result = limiter
        .submit(message_request("13").fail_on_rate_limit(true))
        .await;
    match result {
        Err(ConnectorError::RateLimited { retry_after, .. }) => {
            assert_eq!(retry_after, MAX_RATE_LIMIT_WAIT)
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    // The bucket still works; the next request waits out the clamped limit.
    limiter.submit(message_request("13")).await.unwrap();
    let calls = server.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - start >= MAX_RATE_LIMIT_WAIT);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_worker_releases_its_bucket() {
    let server = FakeServer::new(|index, _| {
        if index == 0 {
            panic!("executor crashed");
        }
        limited(5, 4, 5)
    });
    let limiter = limiter_for(&server);

    let first = limiter.submit(message_request("14"));
    let queued = limiter.submit(message_request("14"));
    assert!(matches!(first.await, Err(ConnectorError::RequestAborted)));
    assert!(matches!(queued.await, Err(ConnectorError::RequestAborted)));

    limiter.submit(message_request("14")).await.unwrap();
    assert_eq!(server.calls().len(), 2);

    // No worker is left counted as active.
    tokio::time::timeout(
        Duration::from_millis(10),
        limiter.shutdown(Duration::from_secs(60)),
    )
    .await
    .expect("shutdown waited on a dead worker");
}
