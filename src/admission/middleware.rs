use super::{AdmissionGuard, ClientKey};
use crate::error::AdmissionError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that rejects requests from blocked clients before they reach the
/// wrapped service.
///
/// `extract` maps a request to its [`ClientKey`]; use
/// [`ClientKey::from_peer`] so requests without a peer address share the
/// `"unknown"` key. The layer only checks; failures are reported by calling
/// [`AdmissionGuard::record_failed_attempt`] wherever authorization fails.
pub struct AdmissionLayer<F> {
    guard: AdmissionGuard,
    extract: Arc<F>,
}

impl<F> AdmissionLayer<F> {
    pub fn new(guard: AdmissionGuard, extract: F) -> Self {
        Self { guard, extract: Arc::new(extract) }
    }
}

impl<F> Clone for AdmissionLayer<F> {
    fn clone(&self) -> Self {
        Self { guard: self.guard.clone(), extract: self.extract.clone() }
    }
}

impl<F> fmt::Debug for AdmissionLayer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").field("guard", &self.guard).finish_non_exhaustive()
    }
}

impl<S, F> Layer<S> for AdmissionLayer<F> {
    type Service = AdmissionService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, guard: self.guard.clone(), extract: self.extract.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, F> {
    inner: S,
    guard: AdmissionGuard,
    extract: Arc<F>,
}

impl<S: Clone, F> Clone for AdmissionService<S, F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), guard: self.guard.clone(), extract: self.extract.clone() }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for AdmissionService<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl<S, F, Req> Service<Req> for AdmissionService<S, F>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
    F: Fn(&Req) -> ClientKey,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.extract)(&req);
        if self.guard.is_blocked(&key) {
            let remaining_seconds = self.guard.block_info(&key).remaining_seconds;
            tracing::debug!(
                target: "holdfast::admission",
                key = %key,
                remaining_seconds,
                "request rejected"
            );
            return Box::pin(async move {
                Err(AdmissionError::Blocked { key: key.to_string(), remaining_seconds })
            });
        }

        let fut = self.inner.call(req);
        Box::pin(async move { fut.await.map_err(AdmissionError::Inner) })
    }
}
