//! The per-connection request queue and deadline scheduler (spec §4.2).
//!
//! Pending requests live in a `HashMap` keyed by sequence id, with a side
//! min-heap keyed by absolute deadline. Exactly one [`Deadline`] timer is
//! armed at a time, at the heap's head, the same rearm-in-place idiom as
//! hyper's `common::timeout::Timeout` generalized from a single fixed
//! duration to a wheel of many independent deadlines.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;

use crate::common::timeout::{round_up_32ms, Deadline};
use crate::controller::RpcController;
use crate::error::ErrorCode;

/// Why a pending request left the queue, for workload accounting (spec
/// §4.2 `RemoveAndConfirm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveReason {
    Response,
    Canceled,
    Timeout,
    TakeAway,
}

/// A request waiting for its response.
pub(crate) struct PendingRequest {
    pub(crate) sequence_id: i64,
    pub(crate) controller: Arc<RpcController>,
    /// `Some` until the completion callback has run exactly once.
    pub(crate) complete: Option<Box<dyn FnOnce(Result<Bytes, ErrorCode>) + Send>>,
    /// A heartbeat or other builtin-service call; excluded from workload
    /// counters per spec §9's open question resolution (see `DESIGN.md`).
    pub(crate) is_builtin: bool,
    pub(crate) deadline: Instant,
    /// Fully qualified method name and original (uncompressed) body, kept
    /// so `take_all` can hand a stranded request back to the channel for
    /// redispatch onto another connection without the caller re-encoding
    /// anything (spec §4.1 "redispatch work from dead connections onto
    /// live ones").
    pub(crate) method: String,
    pub(crate) body: Bytes,
}

struct HeapEntry {
    deadline: Instant,
    sequence_id: i64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // to the top.
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Cumulative counters for one queue, linked `connection → channel →
/// global` per spec §4.2 "Workload counters".
#[derive(Debug, Default)]
pub(crate) struct Workload {
    pub(crate) request_count: AtomicU64,
    pub(crate) response_count: AtomicU64,
    pub(crate) canceled_count: AtomicU64,
    pub(crate) timeout_count: AtomicU64,
    pub(crate) takeaway_count: AtomicU64,
    pub(crate) pending_count: AtomicU64,
    last_use_time: Mutex<Option<Instant>>,
}

impl Workload {
    pub(crate) fn record_request(&self, is_builtin: bool) {
        if is_builtin {
            return;
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        *self.last_use_time.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn record_removal(&self, reason: RemoveReason, is_builtin: bool) {
        if is_builtin {
            return;
        }
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
        match reason {
            RemoveReason::Response => self.response_count.fetch_add(1, Ordering::Relaxed),
            RemoveReason::Canceled => self.canceled_count.fetch_add(1, Ordering::Relaxed),
            RemoveReason::Timeout => self.timeout_count.fetch_add(1, Ordering::Relaxed),
            RemoveReason::TakeAway => self.takeaway_count.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn pending_count(&self) -> u64 {
        self.pending_count.load(Ordering::Relaxed)
    }
}

/// A queue of in-flight requests on one connection, with one rearming
/// deadline timer.
pub(crate) struct RequestQueue {
    pending: HashMap<i64, PendingRequest>,
    heap: BinaryHeap<HeapEntry>,
    timer: Deadline,
    pub(crate) workload: Arc<Workload>,
    /// Propagated up to the owning channel's aggregate counters.
    parent_workload: Option<Arc<Workload>>,
}

impl RequestQueue {
    pub(crate) fn new(parent_workload: Option<Arc<Workload>>) -> Self {
        RequestQueue {
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
            timer: Deadline::new(),
            workload: Arc::new(Workload::default()),
            parent_workload,
        }
    }

    /// Insert a request with a relative timeout. Duplicate sequence ids are
    /// a programmer error (spec §4.2: "a fatal programmer error") since
    /// sequence ids are always allocated by this queue's channel.
    pub(crate) fn add(&mut self, mut req: PendingRequest, timeout: std::time::Duration) {
        let deadline = Instant::now() + round_up_32ms(timeout);
        req.deadline = deadline;
        let sequence_id = req.sequence_id;
        if self.pending.insert(sequence_id, req).is_some() {
            panic!("duplicate sequence id {} in request queue", sequence_id);
        }
        self.heap.push(HeapEntry { deadline, sequence_id });
        self.workload.record_request(self.pending[&sequence_id].is_builtin);
        if let Some(parent) = &self.parent_workload {
            parent.record_request(self.pending[&sequence_id].is_builtin);
        }
        self.rearm();
    }

    /// Remove a pending request by sequence id, if present, tagging the
    /// removal reason for workload accounting.
    pub(crate) fn remove(&mut self, sequence_id: i64, reason: RemoveReason) -> Option<PendingRequest> {
        let req = self.pending.remove(&sequence_id)?;
        self.workload.record_removal(reason, req.is_builtin);
        if let Some(parent) = &self.parent_workload {
            parent.record_removal(reason, req.is_builtin);
        }
        Some(req)
    }

    /// Cancel and remove every pending request, invoking each completion
    /// callback with `code`. Used on channel shutdown, where there is no
    /// live connection left to redispatch onto.
    pub(crate) fn remove_all(&mut self, code: ErrorCode) {
        let sequence_ids: Vec<i64> = self.pending.keys().copied().collect();
        for sequence_id in sequence_ids {
            if let Some(mut req) = self.remove(sequence_id, RemoveReason::TakeAway) {
                req.controller.set_failed_with_code(code, code.reason());
                if let Some(complete) = req.complete.take() {
                    complete(Err(code));
                }
            }
        }
        self.timer.disarm();
    }

    /// Drain every pending request, splitting it between `out_list`
    /// (non-builtin, non-fail-immediate requests — stranded work a dead
    /// connection's caller should redispatch onto a live one) and
    /// immediate cancellation with `code` for everything else (builtins
    /// and fail-immediate calls never migrate, spec §4.2 `RemoveAll`).
    pub(crate) fn take_all(&mut self, code: ErrorCode, out_list: &mut Vec<PendingRequest>) {
        let sequence_ids: Vec<i64> = self.pending.keys().copied().collect();
        for sequence_id in sequence_ids {
            let Some(mut req) = self.remove(sequence_id, RemoveReason::TakeAway) else {
                continue;
            };
            if req.is_builtin || req.controller.fail_immediately() {
                req.controller.set_failed_with_code(code, code.reason());
                if let Some(complete) = req.complete.take() {
                    complete(Err(code));
                }
            } else {
                out_list.push(req);
            }
        }
        self.timer.disarm();
    }

    fn rearm(&mut self) {
        match self.heap.peek() {
            Some(head) => self.timer.arm_at(tokio::time::Instant::from_std(head.deadline)),
            None => self.timer.disarm(),
        }
    }

    /// Poll the deadline timer, firing timeouts for everything whose
    /// deadline has passed. Stale heap entries (already-removed requests)
    /// are dropped silently.
    pub(crate) fn poll_deadlines(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.timer.is_armed() {
            return Poll::Pending;
        }
        if !self.timer.poll_elapsed(cx) {
            return Poll::Pending;
        }

        let now = Instant::now();
        while let Some(head) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if let Some(mut req) = self.remove(entry.sequence_id, RemoveReason::Timeout) {
                req.controller
                    .set_failed_with_code(ErrorCode::RequestTimeout, ErrorCode::RequestTimeout.reason());
                if let Some(complete) = req.complete.take() {
                    complete(Err(ErrorCode::RequestTimeout));
                }
            }
        }
        self.rearm();
        Poll::Ready(())
    }

    pub(crate) fn complete(&mut self, sequence_id: i64, response: Bytes) -> bool {
        match self.remove(sequence_id, RemoveReason::Response) {
            Some(mut req) => {
                if let Some(complete) = req.complete.take() {
                    complete(Ok(response));
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Monotonically increasing sequence id allocator, one per channel,
/// wrapping at `i64::MAX` back to `0` per spec §9 ("wraps back to 0 only
/// after 2^63 requests").
pub(crate) struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub(crate) fn new() -> Self {
        SequenceAllocator { next: AtomicU64::new(0) }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(seed: i64) -> Self {
        SequenceAllocator { next: AtomicU64::new(seed as u64) }
    }

    pub(crate) fn next(&self) -> i64 {
        let v = self.next.fetch_add(1, Ordering::Relaxed);
        (v % (i64::MAX as u64)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_allocator_wraps_near_limit() {
        let alloc = SequenceAllocator::starting_at(i64::MAX - 1);
        let a = alloc.next();
        let b = alloc.next();
        assert_eq!(a, i64::MAX - 1);
        assert!(b >= 0);
    }

    #[test]
    fn add_and_complete_round_trip() {
        let mut queue = RequestQueue::new(None);
        let controller = Arc::new(RpcController::new(1, "poppy.Echo.Echo"));
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        queue.add(
            PendingRequest {
                sequence_id: 1,
                controller,
                complete: Some(Box::new(move |res| *got2.lock().unwrap() = Some(res))),
                is_builtin: false,
                deadline: Instant::now(),
                method: "poppy.Echo.Echo".to_string(),
                body: Bytes::new(),
            },
            std::time::Duration::from_secs(5),
        );
        assert_eq!(queue.len(), 1);
        assert!(queue.complete(1, Bytes::from_static(b"ok")));
        assert_eq!(queue.len(), 0);
        assert_eq!(got.lock().unwrap().as_ref().unwrap().as_ref().unwrap(), &Bytes::from_static(b"ok"));
    }

    #[test]
    fn duplicate_sequence_id_panics() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut queue = RequestQueue::new(None);
            let controller = Arc::new(RpcController::new(1, "poppy.Echo.Echo"));
            for _ in 0..2 {
                queue.add(
                    PendingRequest {
                        sequence_id: 1,
                        controller: controller.clone(),
                        complete: None,
                        is_builtin: false,
                        deadline: Instant::now(),
                        method: "poppy.Echo.Echo".to_string(),
                        body: Bytes::new(),
                    },
                    std::time::Duration::from_secs(5),
                );
            }
        }));
        assert!(result.is_err());
    }
}
