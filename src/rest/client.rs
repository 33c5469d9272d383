use super::ratelimit::RateLimiter;
use super::request::{Request, RestFuture};
use super::requester::Requester;
use super::route::{routes, CompiledRoute};
use crate::auth::Token;
use crate::config::{ClientConfig, RestConfig};
use crate::error::Result;
use crate::types::GatewayInfo;
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// A rate-limited client for the platform's REST API.
///
/// Requests are queued per rate-limit bucket and sent by background workers;
/// `enqueue` returns immediately with a [`RestFuture`] for the result.
///
/// # Examples
///
/// ```no_run
/// use chat_connector_rs::config::ClientConfig;
/// use chat_connector_rs::rest::{routes, Request, RestClient};
///
/// #[tokio::main]
/// async fn main() {
///     let config = ClientConfig::from_env().expect("CHAT_TOKEN not set");
///     let client = RestClient::new(&config).expect("Failed to create client");
///
///     let route = routes::GET_MESSAGE.compile(&["123", "456"]).expect("bad route");
///     let message = client.enqueue(Request::new(route)).await;
///     println!("Message: {:?}", message.map(|r| r.text()));
/// }
/// ```
#[derive(Clone)]
pub struct RestClient {
    limiter: RateLimiter,
    requester: Arc<Requester>,
}

impl RestClient {
    /// Creates a client from `config`. Must be called within a Tokio runtime
    /// before requests are enqueued.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_rest_config(&config.rest, config.token()?)
    }

    pub fn with_rest_config(config: &RestConfig, token: Token) -> Result<Self> {
        let requester = Arc::new(Requester::new(config, token)?);
        let limiter = RateLimiter::new(requester.clone(), config.default_retry_after());
        info!("REST client ready for {}", requester.base_url());
        Ok(Self { limiter, requester })
    }

    /// Creates a client pointed at an arbitrary base URL, mainly for testing
    /// against a mock server.
    pub fn with_base_url(base_url: &str, token: &str, timeout_sec: Option<u64>) -> Result<Self> {
        let mut config = RestConfig {
            api_url: base_url.to_string(),
            ..RestConfig::default()
        };
        if let Some(timeout) = timeout_sec {
            config.timeout_secs = timeout;
        }
        Self::with_rest_config(&config, Token::parse(token)?)
    }

    /// Queues `request` behind its bucket and returns its future.
    pub fn enqueue(&self, request: Request) -> RestFuture {
        self.limiter.submit(request)
    }

    /// Whether a request to `route` would have to wait right now.
    pub fn is_rate_limited(&self, route: &CompiledRoute) -> bool {
        self.limiter.is_rate_limited(route)
    }

    pub fn get_rate_limit(&self, route: &CompiledRoute) -> Option<Duration> {
        self.limiter.get_rate_limit(route)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn base_url(&self) -> &url::Url {
        self.requester.base_url()
    }

    /// Stops accepting requests and drains queued ones for up to `drain_timeout`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.limiter.shutdown(drain_timeout).await;
    }

    /// Fails everything queued or in flight immediately.
    pub fn force_shutdown(&self) {
        self.limiter.force_shutdown();
    }

    /// Fetches the gateway URL, recommended shard count and session start limit.
    pub async fn get_gateway_info(&self) -> Result<GatewayInfo> {
        let route = routes::GET_GATEWAY_BOT.compile(&[])?;
        self.enqueue(Request::new(route)).json().await
    }
}
