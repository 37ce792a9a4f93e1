use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::rt::Executor;

pub(crate) type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wraps the user-supplied [`Executor`], or defaults to [`tokio::spawn`]
/// when the `runtime` feature is enabled.
///
/// Every user completion callback (a response landing on a channel, a
/// method landing on the server) is handed to an `Exec` rather than run
/// inline, so that a slow callback can never stall the connection's
/// read/write loop (spec §5, "Scheduling model").
#[derive(Clone)]
pub(crate) enum Exec {
    #[cfg(feature = "runtime")]
    Default,
    Executor(Arc<dyn Executor<BoxSendFuture> + Send + Sync>),
}

impl Exec {
    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            #[cfg(feature = "runtime")]
            Exec::Default => {
                tokio::spawn(fut);
            }
            Exec::Executor(e) => {
                e.execute(Box::pin(fut));
            }
        }
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec").finish()
    }
}

impl Default for Exec {
    fn default() -> Exec {
        #[cfg(feature = "runtime")]
        {
            Exec::Default
        }
        #[cfg(not(feature = "runtime"))]
        {
            panic!("an Executor must be provided when the `runtime` feature is disabled")
        }
    }
}
