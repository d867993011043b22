//! REST pipeline: per-account token bucket, response rate-limit headers,
//! linear retry backoff, and a distinguished abort sentinel so cancellation
//! is never confused with failure.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{Channel, Message, MessageId, ReactionKind, User};
use crate::rate_limit::RateLimiter;

pub const API_BASE: &str = "https://discord.com/api/v9";

/// History pages and reactor pages both use the API maximum.
pub const PAGE_LIMIT: usize = 100;

const BACKOFF_STEP: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RestError {
    /// Ambient cancellation. Not an error condition; unwinds the caller.
    #[error("operation aborted")]
    Aborted,
    /// HTTP 401: the account's credentials no longer work.
    #[error("credentials rejected")]
    AuthFailed,
    /// HTTP 403/404 during backfill. Callers park on this until a
    /// permission-change event aborts and reassigns the operation.
    #[error("access denied (status {0})")]
    Denied(u16),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("malformed response body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Completion gate derived from one response's rate-limit headers. Callers
/// await `ready()` before the next request on the same endpoint.
#[derive(Debug)]
pub struct ResetGate {
    until: Option<Instant>,
}

impl ResetGate {
    pub fn immediate() -> Self {
        ResetGate { until: None }
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        let remaining = header_str(headers, "x-ratelimit-remaining");
        if remaining.as_deref() == Some("0") {
            let reset_after = header_str(headers, "x-ratelimit-reset-after")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(1.0);
            return ResetGate {
                until: Some(Instant::now() + Duration::from_secs_f64(reset_after.max(0.0))),
            };
        }
        ResetGate { until: None }
    }

    pub async fn ready(&self) {
        if let Some(until) = self.until {
            tokio::time::sleep_until(until).await;
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Linear backoff: starts at zero, grows by 2 s per failure, capped at 60 s.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Backoff {
            delay: Duration::ZERO,
        }
    }

    async fn wait(&mut self, abort: &CancellationToken) -> Result<(), RestError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = abort.cancelled() => return Err(RestError::Aborted),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.delay = (self.delay + BACKOFF_STEP).min(BACKOFF_CAP);
        Ok(())
    }
}

pub struct RestResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub reset: ResetGate,
}

/// One page of an archived-thread listing.
#[derive(Debug, serde::Deserialize)]
pub struct ThreadListPage {
    #[serde(default)]
    pub threads: Vec<Channel>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivedThreadKind {
    Public,
    Private,
    JoinedPrivate,
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl RestClient {
    pub fn new(token: &str) -> Result<Self, RestError> {
        Self::with_base_url(token, API_BASE)
    }

    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(RestClient {
            http,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(RateLimiter::rest_global()),
        })
    }

    /// Issue one request, retrying transient failures forever (or until
    /// aborted). Only terminal conditions surface as errors.
    ///
    /// With `abort_on_failure`, a non-2xx response is returned bare without
    /// consuming the body; the in-flight transfer is dropped.
    pub async fn request(
        &self,
        method: Method,
        route: &str,
        abort: &CancellationToken,
        abort_on_failure: bool,
    ) -> Result<RestResponse, RestError> {
        let url = format!("{}{}", self.base_url, route);
        let mut backoff = Backoff::new();

        loop {
            tokio::select! {
                _ = abort.cancelled() => return Err(RestError::Aborted),
                _ = self.limiter.acquire() => {}
            }

            let send = self
                .http
                .request(method.clone(), &url)
                .header(AUTHORIZATION, &self.token)
                .send();
            let response = tokio::select! {
                _ = abort.cancelled() => return Err(RestError::Aborted),
                r = send => r,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(route, error = %e, "transport failure, retrying");
                    backoff.wait(abort).await?;
                    continue;
                }
            };

            let status = response.status();
            let reset = ResetGate::from_headers(response.headers());

            if status == StatusCode::TOO_MANY_REQUESTS {
                let scope = header_str(response.headers(), "x-ratelimit-scope")
                    .unwrap_or_else(|| "unknown".into());
                let retry_after = header_str(response.headers(), "retry-after")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(1.0);
                debug!(route, %scope, retry_after, "rate limited");
                tokio::select! {
                    _ = abort.cancelled() => return Err(RestError::Aborted),
                    _ = tokio::time::sleep(Duration::from_secs_f64(retry_after.max(0.0))) => {}
                }
                continue;
            }

            if status.is_server_error() {
                warn!(route, status = status.as_u16(), "server error, retrying");
                backoff.wait(abort).await?;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                return Err(RestError::AuthFailed);
            }

            if !status.is_success() {
                if abort_on_failure {
                    // Drop the transfer without reading the body.
                    return Ok(RestResponse {
                        status: status.as_u16(),
                        body: serde_json::Value::Null,
                        reset,
                    });
                }
                return Err(match status.as_u16() {
                    403 | 404 => RestError::Denied(status.as_u16()),
                    other => RestError::Status(other),
                });
            }

            let body = tokio::select! {
                _ = abort.cancelled() => return Err(RestError::Aborted),
                b = response.json::<serde_json::Value>() => b,
            };
            match body {
                Ok(body) => {
                    return Ok(RestResponse {
                        status: status.as_u16(),
                        body,
                        reset,
                    });
                }
                Err(e) => {
                    warn!(route, error = %e, "body read failed, retrying");
                    backoff.wait(abort).await?;
                }
            }
        }
    }

    /// One page of channel history, newest-first as the platform returns it.
    pub async fn get_channel_messages(
        &self,
        channel_id: u64,
        after: MessageId,
        abort: &CancellationToken,
    ) -> Result<(Vec<Message>, ResetGate), RestError> {
        let route = format!("/channels/{channel_id}/messages?after={after}&limit={PAGE_LIMIT}");
        let response = self.request(Method::GET, &route, abort, false).await?;
        let messages = serde_json::from_value(response.body)?;
        Ok((messages, response.reset))
    }

    /// One page of users who placed `emoji` on a message, ascending by id.
    pub async fn get_reaction_users(
        &self,
        channel_id: u64,
        message_id: MessageId,
        emoji_route: &str,
        kind: ReactionKind,
        after: u64,
        abort: &CancellationToken,
    ) -> Result<(Vec<User>, ResetGate), RestError> {
        let route = format!(
            "/channels/{channel_id}/messages/{message_id}/reactions/{emoji_route}?type={}&after={after}&limit={PAGE_LIMIT}",
            kind.as_query()
        );
        let response = self.request(Method::GET, &route, abort, false).await?;
        let users = serde_json::from_value(response.body)?;
        Ok((users, response.reset))
    }

    /// One page of an archived-thread listing.
    pub async fn list_archived_threads(
        &self,
        channel_id: u64,
        kind: ArchivedThreadKind,
        before: Option<&str>,
        abort: &CancellationToken,
    ) -> Result<(ThreadListPage, ResetGate), RestError> {
        let path = match kind {
            ArchivedThreadKind::Public => format!("/channels/{channel_id}/threads/archived/public"),
            ArchivedThreadKind::Private => {
                format!("/channels/{channel_id}/threads/archived/private")
            }
            ArchivedThreadKind::JoinedPrivate => {
                format!("/channels/{channel_id}/users/@me/threads/archived/private")
            }
        };
        let route = match before {
            Some(before) => format!("{path}?before={before}&limit={PAGE_LIMIT}"),
            None => format!("{path}?limit={PAGE_LIMIT}"),
        };
        let response = self.request(Method::GET, &route, abort, false).await?;
        let page = serde_json::from_value(response.body)?;
        Ok((page, response.reset))
    }
}
