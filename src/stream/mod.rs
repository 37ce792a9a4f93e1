//! The multiplexed streaming layer (spec §4.5): an ordered,
//! flow-controlled byte stream riding on the built-in
//! `poppy.StreamingService`'s `UploadPacket`/`DownloadPacket` RPCs instead
//! of a single request/response.
//!
//! A stream is always client/server, not peer-to-peer: when a caller asks
//! for an input stream (`CreateInputStream`), the server creates the
//! *opposing* output stream under the same id and returns it (spec §4.5
//! "Identity and creation") — likewise in reverse for `CreateOutputStream`.
//! The caller then drives its half over the wire via [`PeerStream`]
//! (`write`/`read` pumping `UploadPacket`/`DownloadPacket` round trips);
//! the server's own application code drives the other half directly,
//! in-process, via [`ServerStream`], looked up from the
//! [`StreamManager`] by whatever business call communicated the id.
//!
//! [`Stream`] itself is the shared plumbing both handles wrap: a send
//! queue (written locally, drained by the peer's `DownloadPacket` polls)
//! and a receive side (fed by the peer's `UploadPacket` calls, read
//! locally). Which half is live for a given id depends only on which
//! `Create*Stream` RPC produced it, not on anything the type enforces.
//!
//! Grounded in `examples/original_source/poppy/streaming/stream_impl.cc`
//! and `stream_manager.cc` for the cumulative-ack bookkeeping and the
//! reference-counted teardown rule.

mod client;
mod manager;
pub(crate) mod packet;
mod service;

pub use manager::StreamManager;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use crate::channel::Channel;
use crate::error::ErrorCode;

/// Per-stream timeout/retry tuning (spec §4.5 "Per-packet timeout",
/// "Client-side retry").
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub timeout: Duration,
    pub retry_count: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            timeout: Duration::from_secs(5),
            retry_count: 3,
        }
    }
}

impl StreamOptions {
    /// A packet sitting in the send queue this long without being acked
    /// times out (spec §4.5 "Per-packet timeout": `timeout * retry_count`).
    fn packet_deadline(&self) -> Duration {
        self.timeout * self.retry_count.max(1)
    }
}

type WriteComplete = Box<dyn FnOnce(Result<(), ErrorCode>) + Send>;
type ReadComplete = Box<dyn FnOnce(Result<Bytes, ErrorCode>) + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Sentinel {
    Eof,
    Abort,
}

struct WriteEntry {
    packet_id: u64,
    payload: Bytes,
    sentinel: Option<Sentinel>,
    complete: Option<WriteComplete>,
    deadline: Instant,
}

/// One endpoint's view of a multiplexed byte stream (spec §4.5).
pub(crate) struct Stream {
    pub(crate) id: u64,
    options: StreamOptions,
    next_write_id: AtomicU64,
    write_queue: Mutex<VecDeque<WriteEntry>>,
    /// Woken whenever `write_queue` gains a new head, so a blocked
    /// `DownloadPacket` poll (ours serving the peer, or the peer serving
    /// us) can pick it up without re-polling on a fixed interval.
    write_notify: Notify,
    read_queue: Mutex<VecDeque<ReadComplete>>,
    buffered_reads: Mutex<VecDeque<Result<Bytes, ErrorCode>>>,
    eof_queued: Mutex<bool>,
    /// Highest peer `packet_id` already delivered to this side's read half
    /// (spec §9's open question: `UploadPacket` retries on a lost response
    /// can redeliver the same id). `0` means nothing delivered yet, since
    /// real packet ids start at 1.
    last_uploaded_id: Mutex<u64>,
}

impl Stream {
    fn new(id: u64, options: StreamOptions) -> Arc<Stream> {
        Arc::new(Stream {
            id,
            options,
            next_write_id: AtomicU64::new(1),
            write_queue: Mutex::new(VecDeque::new()),
            write_notify: Notify::new(),
            read_queue: Mutex::new(VecDeque::new()),
            buffered_reads: Mutex::new(VecDeque::new()),
            eof_queued: Mutex::new(false),
            last_uploaded_id: Mutex::new(0),
        })
    }

    /// Append `data` to the send queue (spec §4.5 "Write"); `complete`
    /// fires once the peer acks it, or with an error on timeout/abort.
    pub(crate) fn write(&self, data: Bytes, complete: WriteComplete) {
        self.enqueue(data, None, Some(complete));
    }

    /// Queue a close sentinel behind any still-outstanding packets (spec
    /// §4.5 "Close coordination"). A no-op if one is already queued.
    pub(crate) fn close(&self) {
        self.enqueue_sentinel(Sentinel::Eof);
    }

    /// Queue an abort sentinel; the peer's next read sees
    /// [`ErrorCode::StreamAborted`] instead of [`ErrorCode::EndOfStream`].
    pub(crate) fn abort(&self) {
        self.enqueue_sentinel(Sentinel::Abort);
    }

    fn enqueue_sentinel(&self, sentinel: Sentinel) {
        let mut eof_queued = self.eof_queued.lock().unwrap();
        if *eof_queued {
            return;
        }
        *eof_queued = true;
        drop(eof_queued);
        self.enqueue(Bytes::new(), Some(sentinel), None);
    }

    fn enqueue(&self, payload: Bytes, sentinel: Option<Sentinel>, complete: Option<WriteComplete>) {
        let packet_id = self.next_write_id.fetch_add(1, Ordering::Relaxed);
        self.write_queue.lock().unwrap().push_back(WriteEntry {
            packet_id,
            payload,
            sentinel,
            complete,
            deadline: Instant::now() + self.options.packet_deadline(),
        });
        self.write_notify.notify_waiters();
    }

    /// Acknowledge every queued write up through `ack_packet_id`, firing
    /// their completions with `Ok(())` (spec §4.5 "receiver acknowledges
    /// cumulatively").
    fn ack_writes(&self, ack_packet_id: u64) {
        let mut queue = self.write_queue.lock().unwrap();
        while let Some(front) = queue.front() {
            if front.packet_id > ack_packet_id {
                break;
            }
            let mut entry = queue.pop_front().unwrap();
            if let Some(complete) = entry.complete.take() {
                complete(Ok(()));
            }
        }
    }

    /// Drop every expired entry from the head of the queue, failing its
    /// completion with [`ErrorCode::StreamTimeout`] (spec §4.5 "Per-packet
    /// timeout").
    fn reap_expired(&self) {
        let now = Instant::now();
        let mut queue = self.write_queue.lock().unwrap();
        while matches!(queue.front(), Some(front) if front.deadline <= now) {
            let mut entry = queue.pop_front().unwrap();
            if let Some(complete) = entry.complete.take() {
                complete(Err(ErrorCode::StreamTimeout));
            }
        }
    }

    fn peek_write(&self) -> Option<(u64, Bytes, bool, bool)> {
        self.reap_expired();
        let queue = self.write_queue.lock().unwrap();
        let front = queue.front()?;
        Some((
            front.packet_id,
            front.payload.clone(),
            matches!(front.sentinel, Some(Sentinel::Eof)),
            matches!(front.sentinel, Some(Sentinel::Abort)),
        ))
    }

    /// Fire every still-queued write completion with `code`, used when
    /// the stream is torn down without every packet being acked.
    pub(crate) fn fail_all_writes(&self, code: ErrorCode) {
        let mut queue = self.write_queue.lock().unwrap();
        for mut entry in queue.drain(..) {
            if let Some(complete) = entry.complete.take() {
                complete(Err(code));
            }
        }
    }

    /// Serve one `DownloadPacket` poll: ack everything the peer already
    /// confirmed, then wait (bounded by a per-packet timeout) for a head
    /// entry to hand back.
    pub(crate) async fn poll_download(&self, ack_packet_id: u64, wait: Duration) -> Option<(u64, Bytes, bool, bool)> {
        self.ack_writes(ack_packet_id);
        loop {
            if let Some(packet) = self.peek_write() {
                return Some(packet);
            }
            let notified = self.write_notify.notified();
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(wait) => return None,
            }
        }
    }

    /// Deliver one inbound packet to this side's read half, discarding (but
    /// still acking) a `packet_id` at or below the highest one already
    /// delivered (spec §9 "the server's cumulative-ack model tolerates
    /// duplicate ids by discarding those already acked"): a retried
    /// `UploadPacket`/`DownloadPacket` call whose first attempt already
    /// delivered this id, but whose response was lost on the wire, must
    /// not deliver it twice.
    pub(crate) fn deliver_upload(&self, packet_id: u64, result: Result<Bytes, ErrorCode>) {
        let mut last = self.last_uploaded_id.lock().unwrap();
        if packet_id <= *last {
            return;
        }
        *last = packet_id;
        drop(last);
        self.deliver_incoming(result);
    }

    /// Deliver incoming data to this side's read half, either pairing it
    /// with an already-queued [`read`](Self::read) callback or buffering
    /// it (spec §4.5 "Read").
    fn deliver_incoming(&self, result: Result<Bytes, ErrorCode>) {
        let mut reads = self.read_queue.lock().unwrap();
        if let Some(complete) = reads.pop_front() {
            drop(reads);
            complete(result);
            return;
        }
        drop(reads);
        self.buffered_reads.lock().unwrap().push_back(result);
    }

    /// Request the next chunk of incoming data (spec §4.5 "Read"). Fires
    /// immediately if data already arrived; otherwise queues until it
    /// does.
    pub(crate) fn read(&self, complete: ReadComplete) {
        let mut buffered = self.buffered_reads.lock().unwrap();
        if let Some(result) = buffered.pop_front() {
            drop(buffered);
            complete(result);
            return;
        }
        drop(buffered);
        self.read_queue.lock().unwrap().push_back(complete);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

/// The public, per-call-round-trip handle to one side of a multiplexed
/// stream (spec §4.5). Each [`read`](Self::read)/[`write`](Self::write)
/// drives as many `UploadPacket`/`DownloadPacket` round trips as it takes
/// to settle, retrying transport failures per `options.retry_count`.
pub struct PeerStream {
    channel: Arc<Channel>,
    manager: Arc<StreamManager>,
    stream: Arc<Stream>,
    options: StreamOptions,
    role: client::Role,
    last_download_ack: AtomicU64,
}

impl PeerStream {
    /// Ask the peer to create the opposing output stream and adopt the id
    /// it returns as our input (read) side.
    pub async fn open_input(
        channel: Arc<Channel>,
        manager: Arc<StreamManager>,
        options: StreamOptions,
    ) -> Result<PeerStream, ErrorCode> {
        let stream = client::create_input_stream(&channel, &manager, options).await?;
        Ok(PeerStream {
            channel,
            manager,
            stream,
            options,
            role: client::Role::Input,
            last_download_ack: AtomicU64::new(0),
        })
    }

    /// Mirror of [`open_input`](Self::open_input) for the write side.
    pub async fn open_output(
        channel: Arc<Channel>,
        manager: Arc<StreamManager>,
        options: StreamOptions,
    ) -> Result<PeerStream, ErrorCode> {
        let stream = client::create_output_stream(&channel, &manager, options).await?;
        Ok(PeerStream {
            channel,
            manager,
            stream,
            options,
            role: client::Role::Output,
            last_download_ack: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.stream.id
    }

    /// Queue `data` and drive `UploadPacket` round trips until the peer
    /// acks it (spec §4.5 "Write").
    pub async fn write(&self, data: Bytes) -> Result<(), ErrorCode> {
        let (tx, mut rx) = oneshot::channel();
        self.stream.write(data, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        loop {
            if let Ok(result) = rx.try_recv() {
                return result;
            }
            client::upload_once(&self.channel, &self.stream, self.options).await?;
        }
    }

    /// Pull the next chunk from the peer's write queue (spec §4.5
    /// "Read"). `Ok(None)` is a clean end of stream. Drives repeated
    /// `DownloadPacket` polls (each itself long-polling up to
    /// `options.timeout`) until something arrives.
    pub async fn read(&self) -> Result<Option<Bytes>, ErrorCode> {
        let (tx, mut rx) = oneshot::channel();
        self.stream.read(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        loop {
            if let Ok(result) = rx.try_recv() {
                return match result {
                    Ok(data) => Ok(Some(data)),
                    Err(ErrorCode::EndOfStream) => Ok(None),
                    Err(code) => Err(code),
                };
            }
            let last_ack = self.last_download_ack.load(Ordering::Acquire);
            let new_ack = client::download_once(&self.channel, &self.stream, last_ack, self.options).await?;
            self.last_download_ack.store(new_ack, Ordering::Release);
        }
    }

    /// Queue an EOF sentinel, drain every still-outstanding write (if this
    /// side writes at all), then tell the peer to retire its side too
    /// (spec §4.5 "Close coordination").
    pub async fn close(self) -> Result<(), ErrorCode> {
        if self.role == client::Role::Output {
            self.stream.close();
            while self.has_queued_writes() {
                client::upload_once(&self.channel, &self.stream, self.options).await?;
            }
        }
        client::close_stream(&self.channel, &self.stream, self.role, false, self.options).await?;
        self.manager.retire(self.stream.id).await;
        Ok(())
    }

    /// Like [`close`](Self::close), but the peer's current/next read sees
    /// [`ErrorCode::StreamAborted`] instead of a clean end of stream.
    pub async fn abort(self) -> Result<(), ErrorCode> {
        client::close_stream(&self.channel, &self.stream, self.role, true, self.options).await?;
        if self.role == client::Role::Output {
            self.stream.fail_all_writes(ErrorCode::StreamAborted);
        }
        self.manager.retire(self.stream.id).await;
        Ok(())
    }

    fn has_queued_writes(&self) -> bool {
        !self.stream.write_queue.lock().unwrap().is_empty()
    }
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream").field("id", &self.stream.id).finish()
    }
}

/// The local, non-RPC side of a stream this process is the server for
/// (spec §4.5). Where [`PeerStream`] drives its half over the wire via
/// `UploadPacket`/`DownloadPacket`, a `ServerStream` is the other end of
/// the same id sitting in this process's own [`StreamManager`] table —
/// writes land directly in the send queue the peer's `DownloadPacket`
/// polls drain, and reads pull directly from the receive side the peer's
/// `UploadPacket` calls feed.
pub struct ServerStream {
    stream: Arc<Stream>,
}

impl ServerStream {
    pub(crate) fn new(stream: Arc<Stream>) -> Self {
        ServerStream { stream }
    }

    pub fn id(&self) -> u64 {
        self.stream.id
    }

    /// Queue `data` for the peer to pick up on its next `DownloadPacket`
    /// poll; resolves once the peer's poll reports it acked.
    pub async fn write(&self, data: Bytes) -> Result<(), ErrorCode> {
        let (tx, rx) = oneshot::channel();
        self.stream.write(data, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.await.unwrap_or(Err(ErrorCode::ConnectionClosed))
    }

    /// Pull the next chunk the peer uploaded; `Ok(None)` is a clean end of
    /// stream.
    pub async fn read(&self) -> Result<Option<Bytes>, ErrorCode> {
        let (tx, rx) = oneshot::channel();
        self.stream.read(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        match rx.await.unwrap_or(Err(ErrorCode::ConnectionClosed)) {
            Ok(data) => Ok(Some(data)),
            Err(ErrorCode::EndOfStream) => Ok(None),
            Err(code) => Err(code),
        }
    }

    /// Queue an EOF sentinel for the peer's next read; does not itself
    /// retire the manager's entry (the peer's `Close*Stream` call does).
    pub fn close(&self) {
        self.stream.close();
    }

    /// Queue an abort sentinel for the peer's next read.
    pub fn abort(&self) {
        self.stream.abort();
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream").field("id", &self.stream.id).finish()
    }
}

/// Register the built-in `poppy.StreamingService` on `server`, so it can
/// answer `Create`/`Close`/`UploadPacket`/`DownloadPacket` calls for
/// streams tracked by `manager`.
pub fn register(server: &crate::server::Server, manager: Arc<StreamManager>) {
    server.register(crate::server::ServiceEntry::from_table(manager, service::method_table()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_completes_on_ack() {
        let s = Stream::new(1, StreamOptions::default());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done2 = done.clone();
        s.write(Bytes::from_static(b"hi"), Box::new(move |r| {
            assert!(r.is_ok());
            done2.store(true, Ordering::SeqCst);
        }));
        let (packet_id, payload, is_eof, is_abort) = s.peek_write().unwrap();
        assert_eq!(packet_id, 1);
        assert_eq!(&payload[..], b"hi");
        assert!(!is_eof && !is_abort);
        s.ack_writes(packet_id);
        assert!(done.load(Ordering::SeqCst));
        assert!(s.peek_write().is_none());
    }

    #[test]
    fn read_pairs_with_buffered_upload() {
        let s = Stream::new(2, StreamOptions::default());
        s.deliver_incoming(Ok(Bytes::from_static(b"yo")));
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        s.read(Box::new(move |r| *got2.lock().unwrap() = Some(r)));
        assert_eq!(got.lock().unwrap().take().unwrap().unwrap(), Bytes::from_static(b"yo"));
    }

    #[test]
    fn close_then_abort_only_queues_one_sentinel() {
        let s = Stream::new(3, StreamOptions::default());
        s.close();
        s.abort();
        let queue = s.write_queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.front().unwrap().sentinel, Some(Sentinel::Eof)));
    }
}
