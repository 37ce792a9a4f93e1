use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::time::Duration;

use tokio::time::{sleep_until, Instant, Sleep};

/// A single rearmable deadline, built on `tokio::time::Sleep`.
///
/// [`RequestQueue`](crate::queue::RequestQueue) keeps exactly one of these
/// per queue (armed at the nearest in-flight request's deadline) and every
/// queued stream packet keeps one too (spec §4.2, §4.5 "Per-packet
/// timeout"). Only ever one `Sleep` is polled at a time; rearming in place
/// avoids reallocating a timer on every deadline change.
pub(crate) struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        Deadline { sleep: None }
    }

    /// Arm (or rearm) the timer to fire at `at`.
    pub(crate) fn arm_at(&mut self, at: Instant) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(at),
            None => self.sleep = Some(Box::pin(sleep_until(at))),
        }
    }

    /// Disarm the timer; `poll_elapsed` will never wake until `arm_at` is
    /// called again.
    pub(crate) fn disarm(&mut self) {
        self.sleep = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    pub(crate) fn poll_elapsed(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

/// Round a millisecond duration up to the nearest 32 ms, per spec §4.2
/// ("rounded to 32 ms") so that many requests arriving within the same
/// tick share one timer wakeup instead of rearming constantly.
pub(crate) fn round_up_32ms(d: Duration) -> Duration {
    const GRANULARITY_MS: u128 = 32;
    let ms = d.as_millis();
    let rounded = ((ms + GRANULARITY_MS - 1) / GRANULARITY_MS) * GRANULARITY_MS;
    Duration::from_millis(rounded as u64)
}
