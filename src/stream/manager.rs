//! Per-process stream table and id allocation (spec §4.5 "Identity and
//! creation", §5 "Stream manager table").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Stream, StreamOptions};

/// Tracks every stream this process is currently a party to, keyed by the
/// 64-bit id `(pid << 32) | counter` (spec §4.5). The map itself is a
/// plain mutex; the value it holds is an `Arc<Stream>`, so a lookup can
/// release the lock before doing any actual work on the stream (spec §5:
/// "the stream value is ref-counted so the lookup releases the lock
/// before work").
pub struct StreamManager {
    pid: u64,
    counter: AtomicU32,
    streams: Mutex<HashMap<u64, Arc<Stream>>>,
}

impl StreamManager {
    pub fn new() -> Arc<StreamManager> {
        Arc::new(StreamManager {
            pid: std::process::id() as u64,
            counter: AtomicU32::new(0),
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a fresh id and register a new stream under it; used by
    /// the server side of `CreateInputStream`/`CreateOutputStream`, which
    /// always owns id allocation (spec §4.5: ids are minted with the
    /// *server's* pid regardless of which side initiated the create).
    pub(crate) fn create(&self, options: StreamOptions) -> Arc<Stream> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) as u64;
        let id = (self.pid << 32) | n;
        let stream = Stream::new(id, options);
        self.streams.lock().unwrap().insert(id, stream.clone());
        stream
    }

    /// Register (or return the existing) local stream for an id the peer
    /// handed back, e.g. the response to `CreateInputStream`.
    pub(crate) fn adopt(&self, id: u64, options: StreamOptions) -> Arc<Stream> {
        self.streams
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Stream::new(id, options))
            .clone()
    }

    pub(crate) fn get_stream(&self, id: u64) -> Option<Arc<Stream>> {
        self.streams.lock().unwrap().get(&id).cloned()
    }

    /// Look up the local, non-RPC handle for a stream this process is the
    /// server side of (spec §4.5: "server creates the opposing ... stream
    /// of the same id"). Application code learns `id` out of band — e.g.
    /// as part of whatever business call told it to expect a stream — and
    /// then drives its own side directly through [`super::ServerStream`]
    /// while the peer drives the other side via `UploadPacket`/
    /// `DownloadPacket`.
    pub fn get(&self, id: u64) -> Option<super::ServerStream> {
        self.get_stream(id).map(super::ServerStream::new)
    }

    /// Drop the manager's own reference to `id` and wait for every armed
    /// callback to release theirs (spec §4.5 "Ownership": "destruction
    /// waits for the reference count to fall to 1").
    pub(crate) async fn retire(&self, id: u64) {
        let stream = self.streams.lock().unwrap().remove(&id);
        if let Some(stream) = stream {
            while Arc::strong_count(&stream) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager").field("streams", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_allocates_distinct_ids() {
        let mgr = StreamManager::new();
        let a = mgr.create(StreamOptions::default());
        let b = mgr.create(StreamOptions::default());
        assert_ne!(a.id, b.id);
        assert_eq!(a.id >> 32, std::process::id() as u64);
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn adopt_is_idempotent_per_id() {
        let mgr = StreamManager::new();
        let a = mgr.adopt(42, StreamOptions::default());
        let b = mgr.adopt(42, StreamOptions::default());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
