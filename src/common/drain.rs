//! A graceful-shutdown signal, used by [`crate::channel::Channel::shutdown`]
//! and [`crate::server::Server::stop`].
//!
//! Adapted from the `Signal`/`Watch` pair hyper uses to coordinate
//! connection drain, reworked for `async`/`await` on top of
//! `tokio::sync::watch` instead of a `futures` 0.1 shared oneshot.

use tokio::sync::watch;

/// The draining side: call [`Signal::drain`] to begin shutdown, then await
/// the returned future until every `Watch` clone has observed it and been
/// dropped.
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

/// A cloneable handle that resolves once [`Signal::drain`] has been called.
#[derive(Clone)]
pub(crate) struct Watch {
    rx: watch::Receiver<bool>,
}

pub(crate) fn channel() -> (Signal, Watch) {
    let (tx, rx) = watch::channel(false);
    (Signal { tx }, Watch { rx })
}

impl Signal {
    /// Trip the signal. All `Watch::signaled` futures resolve once polled
    /// again; this does not itself wait for in-flight work to finish.
    pub(crate) fn drain(self) {
        let _ = self.tx.send(true);
    }
}

impl Watch {
    /// Resolves once `drain` has been called.
    pub(crate) async fn signaled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Signal was dropped without draining; treat as drained so
                // watchers don't wait forever on an abandoned channel.
                return;
            }
        }
    }

    pub(crate) fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}
