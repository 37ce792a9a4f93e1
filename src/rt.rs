//! Runtime components
//!
//! By default, Poppy runs its callback thread pool and timers on
//! [tokio](https://tokio.rs). If the `runtime` feature is disabled, the
//! [`Executor`] trait here can be used to plug in another async runtime.

/// An executor of futures, used to run user completion callbacks off the
/// connection's read/write task (spec §5).
///
/// # Example
///
/// ```
/// # use poppy::rt::Executor;
/// # use std::future::Future;
/// #[derive(Clone)]
/// struct TokioExecutor;
///
/// impl<F> Executor<F> for TokioExecutor
/// where
///     F: Future + Send + 'static,
///     F::Output: Send + 'static,
/// {
///     fn execute(&self, future: F) {
///         tokio::spawn(future);
///     }
/// }
/// ```
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}
