//! Tower middleware running any service through a [`Guard`].

use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::{Layer, Service, ServiceExt};

use crate::config::schema::CallPolicy;
use crate::guard::pipeline::Guard;
use crate::guard::types::{GuardError, Outcome};
use crate::resilience::classify::CallError;
use crate::resilience::timeouts::Deadline;

/// Applies one call policy to every request of the wrapped service.
#[derive(Debug, Clone)]
pub struct GuardLayer {
    guard: Guard,
    policy: Arc<CallPolicy>,
    deadline_ms: u64,
}

impl GuardLayer {
    pub fn new(guard: Guard, policy: CallPolicy) -> Self {
        Self {
            guard,
            policy: Arc::new(policy),
            deadline_ms: 0,
        }
    }

    /// Deadline for each request (0 = none).
    pub fn with_deadline_ms(mut self, ms: u64) -> Self {
        self.deadline_ms = ms;
        self
    }
}

impl<S> Layer<S> for GuardLayer {
    type Service = GuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GuardService {
            inner,
            guard: self.guard.clone(),
            policy: Arc::clone(&self.policy),
            deadline_ms: self.deadline_ms,
        }
    }
}

/// Service produced by [`GuardLayer`].
///
/// Requests must be `Clone` so retries can resend them.
#[derive(Debug, Clone)]
pub struct GuardService<S> {
    inner: S,
    guard: Guard,
    policy: Arc<CallPolicy>,
    deadline_ms: u64,
}

impl<S, Req> Service<Req> for GuardService<S>
where
    S: Service<Req> + Clone + Send + Sync + 'static,
    S::Response: Serialize + DeserializeOwned + Send + 'static,
    S::Error: Into<CallError>,
    S::Future: Send + 'static,
    Req: Clone + Send + Sync + 'static,
{
    type Response = Outcome<S::Response>;
    type Error = GuardError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is awaited per attempt inside the call.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let guard = self.guard.clone();
        let policy = Arc::clone(&self.policy);
        let deadline = Deadline::from_millis(self.deadline_ms);
        let inner = self.inner.clone();

        Box::pin(async move {
            let call = move || {
                let svc = inner.clone();
                let req = req.clone();
                async move { svc.oneshot(req).await.map_err(Into::<CallError>::into) }
            };
            guard.execute(&policy, deadline, call).await
        })
    }
}
