use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use alloy::{
    providers::{ProviderBuilder, RootProvider},
    rpc::{
        client::ClientBuilder,
        json_rpc::{ErrorPayload, RequestPacket, Response, ResponsePacket, ResponsePayload},
    },
    transports::{RpcError, TransportError},
};
use tokio::time::Duration;
use tower::{retry::Policy, Layer, Service};
use tracing::warn;

/// HTTP status and JSON-RPC error code nodes use for rate limiting.
const RATE_LIMITED: i64 = 429;

/// Cap on the backoff multiplier, `2^MAX_BACKOFF_EXPONENT`.
const MAX_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Duration,
    retries: u32,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            retries: 0,
            max_retries,
        }
    }

    /// Doubles with every attempt, up to `2^MAX_BACKOFF_EXPONENT` times the
    /// base backoff.
    pub fn current_backoff(&self) -> Duration {
        self.backoff
            .saturating_mul(1 << self.retries.min(MAX_BACKOFF_EXPONENT))
    }

    pub fn backoff(&self) -> tokio::time::Sleep {
        tokio::time::sleep(self.current_backoff())
    }
}

fn is_rate_limited<E>(payload: &ErrorPayload<E>) -> bool {
    payload.code == RATE_LIMITED || payload.message.to_lowercase().contains("rate limit")
}

/// Transport failures and rate limiting are worth another attempt. Any other
/// error response is an answer.
fn is_retryable(result: Result<&ResponsePacket, &TransportError>) -> bool {
    match result {
        Err(RpcError::Transport(_)) => true,
        Err(RpcError::ErrorResp(payload)) => is_rate_limited(payload),
        Ok(ResponsePacket::Single(Response {
            payload: ResponsePayload::Failure(payload),
            ..
        })) => is_rate_limited(payload),
        _ => false,
    }
}

impl Policy<RequestPacket, ResponsePacket, TransportError> for RetryPolicy {
    type Future = Pin<Box<dyn Future<Output = Self> + Send + 'static>>;

    fn retry(
        &self,
        _req: &RequestPacket,
        result: Result<&ResponsePacket, &TransportError>,
    ) -> Option<Self::Future> {
        if is_retryable(result) && self.retries < self.max_retries {
            let mut policy = self.clone();
            Some(Box::pin(async move {
                policy.backoff().await;
                policy.retries += 1;
                policy
            }))
        } else {
            None
        }
    }

    fn clone_request(&self, req: &RequestPacket) -> Option<RequestPacket> {
        Some(req.clone())
    }
}

/// Wraps a transport so every request goes through a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

/// Names a request in retry warnings.
fn describe(req: &RequestPacket) -> String {
    match req {
        RequestPacket::Single(req) => req.method().to_owned(),
        RequestPacket::Batch(reqs) => format!("batch of {} requests", reqs.len()),
    }
}

impl<S> Service<RequestPacket> for RetryService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Send
        + 'static
        + Clone,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        // The service that was polled ready handles this request.
        let fresh = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, fresh);
        let mut policy = self.policy.clone();

        Box::pin(async move {
            loop {
                let result = inner.call(req.clone()).await;
                let Some(next) = policy.retry(&req, result.as_ref()) else {
                    return result;
                };
                warn!(
                    "{} failed, retrying in {:?} (attempt {}/{})",
                    describe(&req),
                    policy.current_backoff(),
                    policy.retries + 1,
                    policy.max_retries
                );
                policy = next.await;
            }
        })
    }
}

/// HTTP provider whose requests are retried per [`RetryPolicy`]. `backoff` is
/// the first delay, in milliseconds.
pub fn build_http_retry_provider(
    rpc_url: url::Url,
    backoff: u64,
    max_retries: u32,
) -> RootProvider<RetryService<alloy::transports::http::ReqwestTransport>> {
    let retry_policy = RetryLayer::new(RetryPolicy::new(
        Duration::from_millis(backoff),
        max_retries,
    ));
    let client = ClientBuilder::default().layer(retry_policy).http(rpc_url);
    ProviderBuilder::new().on_client(client)
}

#[cfg(test)]
mod tests {
    use alloy::transports::TransportErrorKind;

    use super::*;

    fn error_resp(code: i64, message: &str) -> TransportError {
        TransportError::ErrorResp(ErrorPayload {
            code,
            message: message.to_owned().into(),
            data: None,
        })
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100), 10);
        assert_eq!(policy.current_backoff(), Duration::from_millis(100));
        policy.retries = 1;
        assert_eq!(policy.current_backoff(), Duration::from_millis(200));
        policy.retries = 3;
        assert_eq!(policy.current_backoff(), Duration::from_millis(800));
        policy.retries = 9;
        assert_eq!(policy.current_backoff(), Duration::from_millis(3200));
    }

    #[test]
    fn retries_transport_failures_and_rate_limits_only() {
        let transport = TransportErrorKind::custom_str("connection reset");
        assert!(is_retryable(Err(&transport)));
        assert!(is_retryable(Err(&error_resp(429, "too many requests"))));
        assert!(is_retryable(Err(&error_resp(-32005, "Rate limit exceeded"))));
        assert!(!is_retryable(Err(&error_resp(-32000, "header not found"))));
        assert!(!is_retryable(Err(&TransportError::NullResp)));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy::new(Duration::from_millis(10), 2);
        let req = RequestPacket::Batch(vec![]);
        assert_eq!(describe(&req), "batch of 0 requests");
        let err = TransportErrorKind::custom_str("down");

        let policy = policy.retry(&req, Err(&err)).unwrap().await;
        let policy = policy.retry(&req, Err(&err)).unwrap().await;
        assert_eq!(policy.retries, 2);
        assert!(policy.retry(&req, Err(&err)).is_none());
    }
}
