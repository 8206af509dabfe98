//! # Interceptors
//!
//! Every event a connection raises (connect, message, close, error, outgoing message) is
//! delivered through a chain: an ordered list of [`Interceptor`]s wrapped around a terminal
//! [`Handler`]. Each interceptor receives the event arguments, the rest of the chain as a
//! [`Next`], and the connection's cancellation token. It decides whether and when to call
//! `next`, so it can rewrite arguments, observe results or short-circuit the event.
//!
//! A chain is composed once, when the connection is set up, by folding the list from the
//! last interceptor to the first. Interceptors therefore run in the order they were added.
//!
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use wsengine::interceptor::{Chain, Next, Pipeline};
//!
//! # async fn run() {
//! let terminal: Chain<u32, u32> = Arc::new(|n: u32, _cancel: CancellationToken| async move { n + 1 });
//! let chain = Pipeline::<u32, u32>::new()
//!     .with(|n: u32, next: Next<u32, u32>, cancel: CancellationToken| async move {
//!         next.run(n * 10, cancel).await
//!     })
//!     .build(terminal);
//!
//! assert_eq!(chain.call(4, CancellationToken::new()).await, 41);
//! # }
//! ```
use std::{future::Future, pin::Pin, sync::Arc};

use tokio_util::sync::CancellationToken;

/// Type alias for the boxed futures returned by handlers and interceptors.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A composed chain, callable like a single handler.
pub type Chain<A, R> = Arc<dyn Handler<A, R>>;

/// The end of a chain, or any link of it.
///
/// Implemented for every `Fn(A, CancellationToken) -> impl Future<Output = R>`.
pub trait Handler<A, R>: Send + Sync {
    fn call(&self, args: A, cancel: CancellationToken) -> BoxFuture<'_, R>;
}

impl<A, R, F, Fut> Handler<A, R> for F
where
    F: Fn(A, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
{
    fn call(&self, args: A, cancel: CancellationToken) -> BoxFuture<'_, R> {
        Box::pin(self(args, cancel))
    }
}

/// Wraps the rest of a chain.
///
/// Implemented for every `Fn(A, Next<A, R>, CancellationToken) -> impl Future<Output = R>`.
pub trait Interceptor<A, R>: Send + Sync {
    fn intercept(&self, args: A, next: Next<A, R>, cancel: CancellationToken)
        -> BoxFuture<'_, R>;
}

impl<A, R, F, Fut> Interceptor<A, R> for F
where
    F: Fn(A, Next<A, R>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
{
    fn intercept(
        &self,
        args: A,
        next: Next<A, R>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, R> {
        Box::pin(self(args, next, cancel))
    }
}

/// The remainder of a chain, as seen by an interceptor.
pub struct Next<A, R> {
    inner: Chain<A, R>,
}

impl<A, R> Clone for Next<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> Next<A, R> {
    /// Passes `args` down the chain.
    pub async fn run(self, args: A, cancel: CancellationToken) -> R {
        self.inner.call(args, cancel).await
    }
}

struct Link<A, R> {
    interceptor: Arc<dyn Interceptor<A, R>>,
    next: Chain<A, R>,
}

impl<A, R> Handler<A, R> for Link<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn call(&self, args: A, cancel: CancellationToken) -> BoxFuture<'_, R> {
        let next = Next {
            inner: Arc::clone(&self.next),
        };
        self.interceptor.intercept(args, next, cancel)
    }
}

/// Composes `interceptors` around `terminal`.
///
/// The first interceptor is the outermost one. With no interceptors `terminal` is returned
/// unchanged.
pub fn build<A, R>(
    terminal: Chain<A, R>,
    interceptors: &[Arc<dyn Interceptor<A, R>>],
) -> Chain<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    interceptors.iter().rev().fold(terminal, |next, interceptor| {
        Arc::new(Link {
            interceptor: Arc::clone(interceptor),
            next,
        })
    })
}

/// Ordered list of interceptors for one kind of event.
pub struct Pipeline<A, R> {
    interceptors: Vec<Arc<dyn Interceptor<A, R>>>,
}

impl<A, R> Default for Pipeline<A, R> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<A, R> Clone for Pipeline<A, R> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<A, R> Pipeline<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Create a new empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor, which runs after the ones already added.
    pub fn with<I: Interceptor<A, R> + 'static>(mut self, interceptor: I) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push<I: Interceptor<A, R> + 'static>(&mut self, interceptor: I) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Composes the pipeline around `terminal`. See [`build`].
    pub fn build(&self, terminal: Chain<A, R>) -> Chain<A, R> {
        build(terminal, &self.interceptors)
    }
}
