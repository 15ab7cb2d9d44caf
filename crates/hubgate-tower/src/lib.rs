//! Tower integration for hubgate admission control.
//!
//! `hubgate-tower` exposes a layer that:
//! - extracts a [`Priority`] from each request
//! - waits for admission before calling the inner service
//! - skips the inner call for requests superseded by a fresher one
//! - withdraws the ticket when the response future is dropped early
//!
//! # Example
//!
//! ```rust,no_run
//! use hubgate_tower::{HubGate, Priority, PriorityPolicy};
//! use std::convert::Infallible;
//! use std::future::Ready;
//! use std::task::{Context, Poll};
//! use tower::{Service, ServiceBuilder};
//!
//! #[derive(Clone)]
//! struct Command {
//!     refresh: bool,
//!     body: String,
//! }
//!
//! #[derive(Clone)]
//! struct Hub;
//!
//! impl Service<Command> for Hub {
//!     type Response = String;
//!     type Error = Infallible;
//!     type Future = Ready<Result<Self::Response, Self::Error>>;
//!     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
//!         Poll::Ready(Ok(()))
//!     }
//!     fn call(&mut self, cmd: Command) -> Self::Future {
//!         std::future::ready(Ok(cmd.body))
//!     }
//! }
//!
//! let layer = HubGate::new()
//!     .with_priority(Priority::POLLING, PriorityPolicy::default().latest_only())
//!     .build(|cmd: &Command| {
//!         if cmd.refresh { Priority::POLLING } else { Priority::EVENT }
//!     })
//!     .unwrap();
//! let _svc = ServiceBuilder::new().layer(layer).service(Hub);
//! ```

mod builder;
pub use builder::HubGate;
pub use hubgate_async::{
    self, AsyncLimiter, Limiter, LimiterConfig, LimiterStats, Outcome, Priority, PriorityPolicy,
};

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower_service::Service;
use tracing::trace;

/// Response of an admitted service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission<R> {
    /// The request was granted and the inner service answered.
    Completed(R),
    /// A fresher request of the same latest-only priority replaced this one;
    /// the inner service was never called.
    Superseded,
}

impl<R> Admission<R> {
    pub fn into_completed(self) -> Option<R> {
        match self {
            Admission::Completed(response) => Some(response),
            Admission::Superseded => None,
        }
    }
}

/// Layer/service error type.
#[derive(Debug)]
pub enum AdmissionError<E> {
    /// Error returned by the wrapped inner service.
    Service(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Service(e) => write!(f, "Service error: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdmissionError::Service(e) => Some(e),
        }
    }
}

pub trait PriorityExtractor<Request>: Clone {
    /// Picks the admission priority of an incoming request.
    fn extract(&self, req: &Request) -> Priority;
}

impl<F, Request> PriorityExtractor<Request> for F
where
    F: Fn(&Request) -> Priority + Clone,
{
    fn extract(&self, req: &Request) -> Priority {
        (self)(req)
    }
}

/// Tower `Layer` admitting requests through a shared [`AsyncLimiter`].
pub struct AdmissionLayer<Request, P> {
    limiter: AsyncLimiter,
    extractor: P,
    _marker: PhantomData<fn(Request)>,
}

impl<Request, P: Clone> Clone for AdmissionLayer<Request, P> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Request, P> AdmissionLayer<Request, P> {
    pub fn new(limiter: AsyncLimiter, extractor: P) -> Self {
        Self {
            limiter,
            extractor,
            _marker: PhantomData,
        }
    }

    pub fn limiter(&self) -> &AsyncLimiter {
        &self.limiter
    }
}

impl<Request> AdmissionLayer<Request, ()> {
    /// Returns the `HubGate` builder.
    pub fn builder() -> HubGate {
        HubGate::new()
    }
}

impl<S, Request, P> tower::Layer<S> for AdmissionLayer<Request, P>
where
    P: PriorityExtractor<Request>,
{
    type Service = AdmissionService<S, P, Request>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            _marker: PhantomData,
        }
    }
}

/// Tower `Service` produced by [`AdmissionLayer`].
pub struct AdmissionService<S, P, Request> {
    inner: S,
    limiter: AsyncLimiter,
    extractor: P,
    _marker: PhantomData<fn(Request)>,
}

impl<S, P, Request> Clone for AdmissionService<S, P, Request>
where
    S: Clone,
    P: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S, P, Request> Service<Request> for AdmissionService<S, P, Request>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send + 'static,
    P: PriorityExtractor<Request>,
    Request: Send + 'static,
{
    type Response = Admission<S::Response>;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Service)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let priority = self.extractor.extract(&req);
        let limiter = self.limiter.clone();
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.acquire(priority).await {
                Outcome::Granted => {
                    let response = inner.call(req).await.map_err(AdmissionError::Service)?;
                    Ok(Admission::Completed(response))
                }
                Outcome::Superseded => {
                    trace!(%priority, "request superseded before dispatch");
                    Ok(Admission::Superseded)
                }
            }
        })
    }
}
