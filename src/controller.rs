//! [`RpcController`], the per-call handle carrying a method invocation's
//! identity, cancellation state, timing, and result (spec §4.2, §6).
//!
//! Grounded in `examples/original_source/poppy/rpc_controller.h`: method
//! name, sequence id, failure code/reason, a cancel flag with listener
//! callbacks, remote peer identity, and a per-call timeout override that
//! falls back to the channel/method default when unset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::compress::CompressType;
use crate::error::ErrorCode;

/// Carries one RPC call's identity and outcome from creation through
/// completion. Reused across calls via [`RpcController::reset`] the way
/// the original avoids an allocation per call.
pub struct RpcController {
    pub(crate) sequence_id: i64,
    pub(crate) method: String,

    in_use: AtomicBool,
    canceled: AtomicBool,
    failed: AtomicBool,
    fail_immediately: AtomicBool,
    sync: AtomicBool,

    inner: Mutex<ControllerState>,
}

#[derive(Default)]
struct ControllerState {
    error_code: ErrorCode,
    reason: String,
    remote_address: Option<std::net::SocketAddr>,
    credential: Option<String>,
    user: Option<String>,
    role: Option<String>,
    start_time: Option<Instant>,
    timeout: Option<Duration>,
    request_compress_type: CompressType,
    response_compress_type: CompressType,
    cancel_listeners: Vec<Box<dyn FnOnce() + Send>>,
}

impl RpcController {
    pub(crate) fn new(sequence_id: i64, method: impl Into<String>) -> Self {
        RpcController {
            sequence_id,
            method: method.into(),
            in_use: AtomicBool::new(true),
            canceled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fail_immediately: AtomicBool::new(false),
            sync: AtomicBool::new(false),
            inner: Mutex::new(ControllerState {
                start_time: Some(Instant::now()),
                ..Default::default()
            }),
        }
    }

    /// Build a controller for an outgoing call to `method`. The sequence
    /// id is a placeholder; [`crate::channel::Channel::call_raw`] assigns
    /// the real one from its own allocator, ignoring whatever is set here.
    pub fn for_call(method: impl Into<String>) -> Self {
        RpcController::new(0, method)
    }

    /// Reset this controller for reuse with a new call. Returns `false`
    /// (and leaves the controller untouched) if it is still in use by an
    /// in-flight call, matching the original's refusal to reset a live
    /// controller.
    pub fn reset(&self, sequence_id: i64, method: impl Into<String>) -> bool {
        if self.in_use.load(Ordering::Acquire) {
            return false;
        }
        self.in_use.store(true, Ordering::Release);
        self.canceled.store(false, Ordering::Release);
        self.failed.store(false, Ordering::Release);
        self.fail_immediately.store(false, Ordering::Release);
        self.sync.store(false, Ordering::Release);
        let mut state = self.inner.lock().unwrap();
        *state = ControllerState {
            start_time: Some(Instant::now()),
            ..Default::default()
        };
        drop(state);
        // sequence_id/method are logically const per controller instance in
        // this port; callers needing true reuse construct a fresh
        // controller, which is cheap (no connection/socket involved).
        let _ = (sequence_id, method.into());
        true
    }

    pub(crate) fn mark_done(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Request cancellation of the in-flight call. Listeners registered via
    /// [`notify_on_cancel`](Self::notify_on_cancel) fire immediately if the
    /// call hasn't finished yet.
    pub fn start_cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = std::mem::take(&mut self.inner.lock().unwrap().cancel_listeners);
        for listener in listeners {
            listener();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Set whether this call should fail immediately rather than wait in
    /// the channel backlog when no connection is `Healthy` (spec §4.1
    /// "Fail-immediately"). Builtin calls (heartbeats) always set this.
    pub fn set_fail_immediately(&self, fail_immediately: bool) {
        self.fail_immediately.store(fail_immediately, Ordering::Release);
    }

    pub fn fail_immediately(&self) -> bool {
        self.fail_immediately.load(Ordering::Acquire)
    }

    /// Whether the caller used this crate's blocking `call_method_sync`
    /// entry point rather than `await`ing the call directly. Every call in
    /// this crate is dispatched the same way internally regardless; the
    /// flag only distinguishes which entry point the caller used, matching
    /// the original's `set_sync`/`IsSync` bookkeeping on top of a single
    /// async dispatch path.
    pub fn set_sync(&self, sync: bool) {
        self.sync.store(sync, Ordering::Release);
    }

    pub fn is_sync(&self) -> bool {
        self.sync.load(Ordering::Acquire)
    }

    /// Register a callback to run when [`start_cancel`](Self::start_cancel)
    /// is called. Runs immediately if the call is already canceled.
    pub fn notify_on_cancel(&self, listener: Box<dyn FnOnce() + Send>) {
        if self.canceled.load(Ordering::Acquire) {
            listener();
            return;
        }
        self.inner.lock().unwrap().cancel_listeners.push(listener);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn error_code(&self) -> ErrorCode {
        self.inner.lock().unwrap().error_code
    }

    pub fn error_text(&self) -> String {
        self.inner.lock().unwrap().reason.clone()
    }

    /// Mark this call failed. Callers passing no explicit code get
    /// `ErrorCode::FromUser`, matching the original's `SetFailed(reason)`
    /// default.
    pub fn set_failed(&self, reason: impl Into<String>) {
        self.set_failed_with_code(ErrorCode::FromUser, reason);
    }

    pub(crate) fn set_failed_with_code(&self, code: ErrorCode, reason: impl Into<String>) {
        self.failed.store(true, Ordering::Release);
        let mut state = self.inner.lock().unwrap();
        state.error_code = code;
        state.reason = reason.into();
    }

    pub fn remote_address(&self) -> Option<std::net::SocketAddr> {
        self.inner.lock().unwrap().remote_address
    }

    pub(crate) fn set_remote_address(&self, addr: std::net::SocketAddr) {
        self.inner.lock().unwrap().remote_address = Some(addr);
    }

    pub fn credential(&self) -> Option<String> {
        self.inner.lock().unwrap().credential.clone()
    }

    pub fn user(&self) -> Option<String> {
        self.inner.lock().unwrap().user.clone()
    }

    pub fn role(&self) -> Option<String> {
        self.inner.lock().unwrap().role.clone()
    }

    pub(crate) fn set_identity(
        &self,
        credential: Option<String>,
        user: Option<String>,
        role: Option<String>,
    ) {
        let mut state = self.inner.lock().unwrap();
        state.credential = credential;
        state.user = user;
        state.role = role;
    }

    /// Wall-clock time since this call started.
    pub fn elapsed(&self) -> Duration {
        self.inner
            .lock()
            .unwrap()
            .start_time
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Per-call timeout override. Falls back to the channel/method default
    /// when unset, matching the original's `Timeout()` accessor.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().timeout = Some(timeout);
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.inner.lock().unwrap().timeout.unwrap_or(default)
    }

    pub fn set_request_compress_type(&self, compress_type: CompressType) {
        self.inner.lock().unwrap().request_compress_type = compress_type;
    }

    pub fn set_response_compress_type(&self, compress_type: CompressType) {
        self.inner.lock().unwrap().response_compress_type = compress_type;
    }

    pub(crate) fn request_compress_type(&self) -> CompressType {
        self.inner.lock().unwrap().request_compress_type
    }

    pub(crate) fn response_compress_type(&self) -> CompressType {
        self.inner.lock().unwrap().response_compress_type
    }
}

impl std::fmt::Debug for RpcController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcController")
            .field("sequence_id", &self.sequence_id)
            .field("method", &self.method)
            .field("in_use", &self.in_use())
            .field("canceled", &self.is_canceled())
            .field("failed", &self.failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_listener_fires_once() {
        let controller = RpcController::new(1, "poppy.Echo.Echo");
        let fired = std::sync::Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        controller.notify_on_cancel(Box::new(move || fired2.store(true, Ordering::Release)));
        assert!(!fired.load(Ordering::Acquire));
        controller.start_cancel();
        assert!(fired.load(Ordering::Acquire));
        assert!(controller.is_canceled());
    }

    #[test]
    fn reset_refuses_while_in_use() {
        let controller = RpcController::new(1, "poppy.Echo.Echo");
        assert!(!controller.reset(2, "poppy.Echo.Echo"));
        controller.mark_done();
        assert!(controller.reset(2, "poppy.Echo.Echo"));
    }

    #[test]
    fn set_failed_defaults_to_from_user() {
        let controller = RpcController::new(1, "poppy.Echo.Echo");
        controller.set_failed("boom");
        assert!(controller.failed());
        assert_eq!(controller.error_code(), ErrorCode::FromUser);
        assert_eq!(controller.error_text(), "boom");
    }
}
