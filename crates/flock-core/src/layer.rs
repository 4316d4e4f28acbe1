//! Tower middleware wiring a [`Group`] in front of a service.

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::group::Group;
use crate::policy::CoalescePolicy;

/// Layer applying request coalescing to the wrapped service.
#[derive(Clone)]
pub struct CoalesceLayer {
    group: Arc<Group>,
    policy: Arc<CoalescePolicy>,
}

impl CoalesceLayer {
    /// Creates a layer coalescing requests admitted by `policy` within `group`.
    pub fn new(group: Arc<Group>, policy: CoalescePolicy) -> Self {
        if !policy.is_enabled() {
            tracing::warn!(
                header_name = %policy.header_name,
                "Coalescing policy is incomplete, requests will pass through"
            );
        }

        Self {
            group,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for CoalesceLayer {
    type Service = Coalesce<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Coalesce {
            inner,
            group: Arc::clone(&self.group),
            policy: Arc::clone(&self.policy),
        }
    }
}

/// Service that forwards admitted duplicate requests to `inner` only once.
///
/// Behaves exactly like `inner` for requests the policy does not admit.
/// Coalescing failures surface as JSON error responses, never as service
/// errors.
#[derive(Clone)]
pub struct Coalesce<S> {
    inner: S,
    group: Arc<Group>,
    policy: Arc<CoalescePolicy>,
}

impl<S> Service<Request> for Coalesce<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let group = Arc::clone(&self.group);
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            let forward = move |request: Request| async move {
                match inner.call(request).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                }
            };

            let response = match group.coalesce(&policy, request, forward).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            };
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(group: &Arc<Group>, policy: CoalescePolicy, hits: Arc<AtomicU32>) -> Router {
        Router::new().route(
            "/echo",
            post(move |body: String| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                format!("got {body}")
            })
            .layer(group.layer(policy)),
        )
    }

    fn echo(body: &'static str, flag: &'static str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/echo")
            .header("x-fly", flag)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_preserves_handler_behaviour() {
        let group = Arc::new(Group::with_defaults());
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&group, CoalescePolicy::header("x-fly", "on"), Arc::clone(&hits));

        let response = app.oneshot(echo("plain", "off")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, "got plain");
        assert_eq!(group.stats().bypassed_requests, 1);
    }

    #[tokio::test]
    async fn test_admitted_request_sees_original_body() {
        let group = Arc::new(Group::with_defaults());
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&group, CoalescePolicy::header("x-fly", "on"), Arc::clone(&hits));

        let response = app.oneshot(echo("buffered", "on")).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, "got buffered");
        assert_eq!(group.stats().new_fetches, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coalesce_error_becomes_response() {
        let group = Arc::new(Group::new(crate::CoalescerConfig {
            max_body_bytes: 2,
            ..Default::default()
        }));
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&group, CoalescePolicy::header("x-fly", "on"), Arc::clone(&hits));

        let response = app.oneshot(echo("too big", "on")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
