//! REST side of the connector: route compilation, per-bucket rate limiting
//! and the HTTP requester behind it.

pub mod bucket;
pub mod client;
pub mod ratelimit;
pub mod request;
pub mod requester;
pub mod route;

pub use bucket::{RateLimitBucket, RateLimitHeaders};
pub use client::RestClient;
pub use ratelimit::{ExecuteOutcome, RateLimiter, RequestExecutor};
pub use request::{FileAttachment, Request, RequestBody, RestFuture, RestResponse};
pub use requester::Requester;
pub use route::{routes, BucketKey, CompiledRoute, Route};
