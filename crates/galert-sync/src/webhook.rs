use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use tracing::debug;

use crate::notify::{AlertNotification, DispatchError, Dispatcher};

/// How many times a delivery is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0 = the first retry). Doubles each
    /// time up to `ceiling`.
    pub fn pause_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }

    /// Per-request client timeout that lets every attempt, and the pauses
    /// between them, fit inside `budget`. Never below one second.
    pub fn request_timeout(&self, budget: Duration) -> Duration {
        let attempts = self.attempts.max(1);
        let pauses: Duration = (0..attempts - 1).map(|r| self.pause_before(r)).sum();
        let per_attempt = budget.saturating_sub(pauses) / attempts;
        per_attempt.max(MIN_REQUEST_TIMEOUT)
    }

    /// A server-provided `Retry-After` wins when it is shorter than the
    /// ceiling.
    fn pause_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.ceiling),
            None => self.pause_before(retry),
        }
    }
}

fn worth_retrying(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
        )
}

/// Bodies that never reached the receiver can be sent again safely.
fn transport_worth_retrying(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Only the delay-seconds form; HTTP dates fall back to the policy.
fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// POSTs each notification as JSON to a delivery service.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(
        url: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("galert/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
            retry,
        })
    }

    async fn attempt(&self, notification: &AlertNotification) -> Attempt {
        match self.client.post(&self.url).json(notification).send().await {
            Ok(resp) if resp.status().is_success() => Attempt::Delivered,
            Ok(resp) => {
                let status = resp.status();
                let hint = retry_after(&resp);
                let err = DispatchError::HttpStatus {
                    status: status.as_u16(),
                    url: self.url.clone(),
                };
                if worth_retrying(status) {
                    Attempt::Again(err, hint)
                } else {
                    Attempt::GiveUp(err)
                }
            }
            Err(err) if transport_worth_retrying(&err) => {
                Attempt::Again(DispatchError::Request(err), None)
            }
            Err(err) => Attempt::GiveUp(DispatchError::Request(err)),
        }
    }
}

enum Attempt {
    Delivered,
    Again(DispatchError, Option<Duration>),
    GiveUp(DispatchError),
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn dispatch(&self, notification: &AlertNotification) -> Result<(), DispatchError> {
        let attempts = self.retry.attempts.max(1);
        let mut retry = 0;
        loop {
            match self.attempt(notification).await {
                Attempt::Delivered => return Ok(()),
                Attempt::GiveUp(err) => return Err(err),
                Attempt::Again(err, _) if retry + 1 >= attempts => return Err(err),
                Attempt::Again(err, hint) => {
                    let pause = self.retry.pause_for(retry, hint);
                    debug!(
                        alert_id = notification.alert_id,
                        retry,
                        ?pause,
                        error = %err,
                        "webhook delivery failed; retrying"
                    );
                    tokio::time::sleep(pause).await;
                    retry += 1;
                }
            }
        }
    }
}
