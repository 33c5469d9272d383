use super::bucket::RateLimitHeaders;
use super::ratelimit::{is_global_limit, ExecuteOutcome, RateLimiter, RequestExecutor};
use super::request::{Request, RequestBody, RestResponse};
use crate::auth::{self, Token};
use crate::config::RestConfig;
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use log::{debug, error, trace, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, StatusCode};
use std::time::Duration;
use url::Url;

const TRACE_HEADERS: &[&str] = &["cf-ray", "x-request-id"];

/// Performs one physical HTTP exchange per request, with bounded retries on
/// 5xx responses and timeouts.
pub struct Requester {
    /// The underlying HTTP client used for making requests.
    http_client: HttpClient,
    /// API base URL; compiled route paths are joined onto it.
    base_url: Url,
    token: Token,
    user_agent: HeaderValue,
    max_server_retries: u32,
    server_retry_backoff: Duration,
    retry_on_timeout: bool,
}

impl Requester {
    pub fn new(config: &RestConfig, token: Token) -> Result<Self> {
        let mut base = config.api_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;

        // gzip is advertised and decoded by reqwest itself.
        let http_client = HttpClient::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            http_client,
            base_url,
            token,
            user_agent: HeaderValue::from_str(&config.user_agent)?,
            max_server_retries: config.max_server_retries,
            server_retry_backoff: config.server_retry_backoff(),
            retry_on_timeout: config.retry_on_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds the reqwest request for one attempt. Multipart bodies are rebuilt
    /// every time because a form can only be sent once.
    fn build_request(&self, request: &Request) -> Result<reqwest::Request> {
        let url = self.base_url.join(&request.route().path())?;

        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::AUTHORIZATION, self.token.authorization_header()?);
        headers.insert(reqwest::header::USER_AGENT, self.user_agent.clone());
        if let Some(reason) = request.audit_reason() {
            headers.insert(
                HeaderName::from_static("x-audit-log-reason"),
                HeaderValue::from_str(&auth::encode_audit_reason(reason))?,
            );
        }
        for (name, value) in request.headers() {
            headers.insert(name.clone(), value.clone());
        }

        let mut builder = self
            .http_client
            .request(request.route().method().clone(), url)
            .headers(headers);

        builder = match request.request_body() {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart { payload, files } => {
                let mut form = Form::new();
                if let Some(payload) = payload {
                    form = form.text("payload_json", serde_json::to_string(payload)?);
                }
                for (index, file) in files.iter().enumerate() {
                    let mut part = Part::bytes(file.data.clone()).file_name(file.filename.clone());
                    if let Some(content_type) = &file.content_type {
                        part = part.mime_str(content_type)?;
                    }
                    form = form.part(format!("files[{}]", index), part);
                }
                builder.multipart(form)
            }
        };

        Ok(builder.build()?)
    }

    /// Sends the request, retrying 5xx responses with linear backoff and a
    /// timed-out attempt once when enabled. Returns the final response fully read.
    async fn send_with_retries(&self, request: &Request) -> Result<RestResponse> {
        let mut trace_ids = Vec::new();
        let mut server_retries = 0;
        let mut timeout_retried = false;

        loop {
            let http_request = self.build_request(request)?;
            trace!("Sending {} (request {})", request.route(), request.id());

            let response = match self.http_client.execute(http_request).await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    if self.retry_on_timeout && !timeout_retried {
                        timeout_retried = true;
                        warn!("Request {} to {} timed out; retrying once", request.id(), request.route());
                        continue;
                    }
                    return Err(ConnectorError::Timeout);
                }
                Err(e) => return Err(ConnectorError::ReqwestError(e)),
            };

            let status = response.status();
            collect_trace_ids(response.headers(), &mut trace_ids);

            if status.is_server_error() && server_retries < self.max_server_retries {
                server_retries += 1;
                // Drop the unread body so the connection goes back to the pool.
                drop(response);
                let backoff = self.server_retry_backoff * server_retries;
                debug!(
                    "Request {} to {} returned {}; retry {}/{} in {:?}",
                    request.id(),
                    request.route(),
                    status,
                    server_retries,
                    self.max_server_retries,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            let headers = response.headers().clone();
            let body = response.bytes().await?.to_vec();
            if !trace_ids.is_empty() {
                debug!("Request {} trace ids: {}", request.id(), trace_ids.join(", "));
            }

            let mut rest_response = RestResponse::new(status, headers, body);
            rest_response.trace_ids = trace_ids;
            return Ok(rest_response);
        }
    }

    /// Turns a non-success response into the error delivered to the caller.
    fn error_from_response(response: &RestResponse) -> ConnectorError {
        let status = response.status;
        let header = response.headers.clone();
        let error_body = response.json_value();

        let (code, message, data) = match &error_body {
            Some(body) => (
                body["code"].as_i64().unwrap_or(0),
                body["message"]
                    .as_str()
                    .unwrap_or("Unknown error message")
                    .to_string(),
                body.get("errors").cloned(),
            ),
            None => (
                0,
                format!(
                    "Request failed with status {} (could not parse error body)",
                    status
                ),
                None,
            ),
        };

        if status.is_client_error() {
            ConnectorError::ClientError {
                status,
                code,
                message,
                data,
                header,
            }
        } else {
            ConnectorError::ServerError {
                status,
                code,
                message,
                header,
            }
        }
    }
}

#[async_trait]
impl RequestExecutor for Requester {
    async fn execute(&self, request: Request, limiter: &RateLimiter) -> ExecuteOutcome {
        if request.is_cancelled() {
            request.fail(ConnectorError::Cancelled);
            return ExecuteOutcome::Done;
        }

        let response = match self.send_with_retries(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request {} to {} failed: {}", request.id(), request.route(), e);
                request.fail(e);
                return ExecuteOutcome::Done;
            }
        };

        complete(request, response, limiter)
    }
}

/// Feeds `response` to the limiter and settles `request`: requeue on a 429
/// unless the request opted out, otherwise deliver success or failure.
pub fn complete(request: Request, response: RestResponse, limiter: &RateLimiter) -> ExecuteOutcome {
    if let Some(retry_after) = limiter.handle_response(request.route(), &response) {
        if request.fails_on_rate_limit() {
            let headers = RateLimitHeaders::parse(&response.headers);
            let global = is_global_limit(&headers, response.json_value().as_ref());
            let route = request.route().to_string();
            request.fail(ConnectorError::RateLimited {
                route,
                retry_after,
                global,
            });
            return ExecuteOutcome::Done;
        }
        return ExecuteOutcome::RateLimited {
            request,
            retry_after,
        };
    }

    if response.is_success() || response.status == StatusCode::NOT_MODIFIED {
        request.succeed(response);
    } else {
        request.fail(Requester::error_from_response(&response));
    }
    ExecuteOutcome::Done
}

fn collect_trace_ids(headers: &HeaderMap, trace_ids: &mut Vec<String>) {
    for name in TRACE_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            trace_ids.push(format!("{}={}", name, value));
        }
    }
}
