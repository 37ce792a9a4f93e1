//! The channel state machine (spec §4.1): a pool of [`Connection`]s to one
//! logical service name, with health tracking, reconnect, idle-close, and
//! backlog redispatch. Grounded in `examples/original_source/poppy/rpc_channel_impl.cc`
//! for the timing constants and overload-detection heuristic, and in the
//! teacher's `client::conn::http1` for the builder/options style used to
//! configure it.

mod connection;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;

pub(crate) use connection::{Connection, ConnectionStatus, OutboundRequest, SendOutcome};

use crate::common::drain::{self, Signal, Watch};
use crate::config::ChannelOptions;
use crate::controller::RpcController;
use crate::error::ErrorCode;
use crate::meta::RpcMeta;
use crate::queue::{PendingRequest, RemoveReason, SequenceAllocator, Workload};

/// A `Healthy` connection with more pending requests than this, while
/// other connections sit idle, is considered overloaded (spec §11,
/// `rpc_channel_impl.cc`'s `CheckStatus`).
const OVERLOAD_PENDING_THRESHOLD: u64 = 2;

/// Minimum number of `Disconnected` connections to kick off per reconnect
/// burst (spec §4.1 "Reconnect policy").
const MIN_CONCURRENT_CONNECTS: usize = 3;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(300);

/// Channel-level health derived from the best status across its
/// connections (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Healthy,
    Unavailable,
    NoAuth,
    Shutdown,
    Unknown,
}

struct Buckets {
    by_status: [Vec<Arc<Connection>>; 8],
}

impl Buckets {
    fn new() -> Self {
        Buckets {
            by_status: Default::default(),
        }
    }

    fn bucket(&self, status: ConnectionStatus) -> &Vec<Arc<Connection>> {
        &self.by_status[status as usize]
    }

    fn bucket_mut(&mut self, status: ConnectionStatus) -> &mut Vec<Arc<Connection>> {
        &mut self.by_status[status as usize]
    }

    fn remove(&mut self, status: ConnectionStatus, remote: SocketAddr) -> Option<Arc<Connection>> {
        let bucket = self.bucket_mut(status);
        let idx = bucket.iter().position(|c| c.remote == remote)?;
        Some(bucket.remove(idx))
    }

    /// Remove `remote` from whichever bucket currently holds it, without
    /// the caller needing to know which one that is. Used when a
    /// connection's own IO task reports a status change: it knows only
    /// its own `remote`, not which bucket the channel last filed it under.
    fn take(&mut self, remote: SocketAddr) -> Option<Arc<Connection>> {
        for status in ALL_STATUSES {
            if let Some(conn) = self.remove(status, remote) {
                return Some(conn);
            }
        }
        None
    }

    fn move_to(&mut self, conn: Arc<Connection>, from: ConnectionStatus, to: ConnectionStatus) {
        if from == to {
            return;
        }
        if self.remove(from, conn.remote).is_some() {
            conn.set_status(to);
            self.bucket_mut(to).push(conn);
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.by_status.iter().flatten()
    }
}

/// One logical service endpoint, pooling connections to its (possibly
/// several) addresses.
pub struct Channel {
    name: String,
    hash: u64,
    options: ChannelOptions,
    credential: Arc<str>,

    buckets: RwLock<Buckets>,
    endpoints: RwLock<Vec<SocketAddr>>,
    backlog: AsyncMutex<Vec<(String, Bytes, Arc<RpcController>, Box<dyn FnOnce(Result<Bytes, ErrorCode>) + Send>)>>,

    sequence: SequenceAllocator,
    workload: Arc<Workload>,

    shuttingdown: AtomicBool,
    shutdown: AtomicBool,
    in_flight: AtomicI64,

    /// Per-process PRNG seeded from the PID (spec §4.1 "Connection
    /// selection"), shared across the reconnect burst and Healthy-bucket
    /// picker so selection is deterministic given the PID and call order.
    rng: std::sync::Mutex<StdRng>,
    drain_signal: std::sync::Mutex<Option<Signal>>,
    drain_watch: Watch,
}

impl Channel {
    /// Construct a channel for `name` resolving to `endpoints`, and start
    /// its heartbeat/reconnect/error-sweep timers.
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<SocketAddr>,
        credential: impl Into<Arc<str>>,
        options: ChannelOptions,
    ) -> Arc<Channel> {
        let name = name.into();
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let hash = hasher.finish();

        let mut shuffled = endpoints;
        let pid = std::process::id() as u64;
        let mut seed_rng = StdRng::seed_from_u64(pid);
        for i in (1..shuffled.len()).rev() {
            let j = seed_rng.gen_range(0..=i);
            shuffled.swap(i, j);
        }

        let (signal, watch) = drain::channel();

        let channel = Arc::new(Channel {
            name,
            hash,
            options,
            credential: credential.into(),
            buckets: RwLock::new(Buckets::new()),
            endpoints: RwLock::new(Vec::new()),
            backlog: AsyncMutex::new(Vec::new()),
            sequence: SequenceAllocator::new(),
            workload: Arc::new(Workload::default()),
            shuttingdown: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicI64::new(0),
            rng: std::sync::Mutex::new(seed_rng),
            drain_signal: std::sync::Mutex::new(Some(signal)),
            drain_watch: watch,
        });

        channel.set_endpoints(shuffled);
        channel.spawn_timers();
        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Best status across all connections (spec §4.1 "derived status").
    pub fn status(&self) -> ChannelStatus {
        if self.shutdown.load(Ordering::Acquire) {
            return ChannelStatus::Shutdown;
        }
        let buckets = self.buckets.read().unwrap();
        if !buckets.bucket(ConnectionStatus::Healthy).is_empty() {
            return ChannelStatus::Healthy;
        }
        if !buckets.bucket(ConnectionStatus::Connected).is_empty() {
            return ChannelStatus::Unavailable;
        }
        if !buckets.bucket(ConnectionStatus::NoAuth).is_empty() {
            return ChannelStatus::NoAuth;
        }
        ChannelStatus::Unknown
    }

    fn set_endpoints(self: &Arc<Self>, addrs: Vec<SocketAddr>) {
        let mut buckets = self.buckets.write().unwrap();
        for addr in &addrs {
            let conn = connection::spawn_connect(
                *addr,
                self.credential.clone(),
                self.options.tos,
                self.workload.clone(),
                self.drain_watch.clone(),
                Arc::downgrade(self),
            );
            buckets.bucket_mut(ConnectionStatus::Connecting).push(conn);
        }
        drop(buckets);
        *self.endpoints.write().unwrap() = addrs;
    }

    /// Diff a fresh resolver result against the stored endpoint set (spec
    /// §4.1 "Endpoint set change"): add new endpoints `Disconnected`, tear
    /// down removed ones and cancel their in-flight work.
    pub fn update_endpoints(self: &Arc<Self>, mut new_addrs: Vec<SocketAddr>) {
        new_addrs.sort();
        new_addrs.dedup();
        let mut current = self.endpoints.write().unwrap();
        let mut sorted_current = current.clone();
        sorted_current.sort();

        let added: Vec<SocketAddr> = new_addrs
            .iter()
            .filter(|a| !sorted_current.contains(a))
            .copied()
            .collect();
        let removed: Vec<SocketAddr> = sorted_current
            .iter()
            .filter(|a| !new_addrs.contains(a))
            .copied()
            .collect();

        *current = new_addrs;
        drop(current);

        let mut buckets = self.buckets.write().unwrap();
        for addr in removed {
            for status in ALL_STATUSES {
                if let Some(conn) = buckets.remove(status, addr) {
                    conn.abort(ErrorCode::ConnectionClosed);
                }
            }
        }
        drop(buckets);

        for addr in added {
            let conn = connection::spawn_connect(
                addr,
                self.credential.clone(),
                self.options.tos,
                self.workload.clone(),
                self.drain_watch.clone(),
                Arc::downgrade(self),
            );
            self.buckets
                .write()
                .unwrap()
                .bucket_mut(ConnectionStatus::Disconnected)
                .push(conn);
        }
    }

    fn spawn_timers(self: &Arc<Self>) {
        let heartbeat_chan = self.clone();
        tokio::spawn(async move {
            let mut watch = heartbeat_chan.drain_watch.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                        heartbeat_chan.run_heartbeats().await;
                    }
                    _ = watch.signaled() => break,
                }
            }
        });

        let reconnect_chan = self.clone();
        tokio::spawn(async move {
            let mut watch = reconnect_chan.drain_watch.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_chan.options.connect_timeout) => {
                        reconnect_chan.run_reconnect_burst();
                    }
                    _ = watch.signaled() => break,
                }
            }
        });

        let sweep_chan = self.clone();
        tokio::spawn(async move {
            let mut watch = sweep_chan.drain_watch.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_SWEEP_INTERVAL) => {
                        sweep_chan.sweep_errors();
                    }
                    _ = watch.signaled() => break,
                }
            }
        });

        if self.options.keepalive_idle > Duration::ZERO {
            let idle_chan = self.clone();
            tokio::spawn(async move {
                let mut watch = idle_chan.drain_watch.clone();
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(idle_chan.options.keepalive_idle) => {
                            idle_chan.check_idle_close();
                        }
                        _ = watch.signaled() => break,
                    }
                }
            });
        }
    }

    async fn run_heartbeats(self: &Arc<Self>) {
        let targets: Vec<Arc<Connection>> = {
            let buckets = self.buckets.read().unwrap();
            buckets
                .bucket(ConnectionStatus::Healthy)
                .iter()
                .chain(buckets.bucket(ConnectionStatus::Connected).iter())
                .cloned()
                .collect()
        };

        for conn in targets {
            let was_healthy = conn.status() == ConnectionStatus::Healthy;
            let sequence_id = self.sequence.next();
            let ok = connection::heartbeat(&conn, sequence_id, HEARTBEAT_TIMEOUT).await;
            let mut buckets = self.buckets.write().unwrap();
            if ok {
                buckets.move_to(conn.clone(), conn.status(), ConnectionStatus::Healthy);
            } else {
                buckets.move_to(conn.clone(), conn.status(), ConnectionStatus::Connected);
            }
            drop(buckets);
            if was_healthy && !ok {
                self.redispatch_backlog().await;
            }
        }

        // Overload detection (spec §11): a Healthy connection carrying more
        // than OVERLOAD_PENDING_THRESHOLD pending requests while others are
        // idle or some connections are still Disconnected nudges the
        // reconnect timer early.
        let buckets = self.buckets.read().unwrap();
        let healthy = buckets.bucket(ConnectionStatus::Healthy);
        let any_disconnected = !buckets.bucket(ConnectionStatus::Disconnected).is_empty();
        let overloaded = healthy
            .iter()
            .any(|c| c.pending_count() > OVERLOAD_PENDING_THRESHOLD);
        let not_all_healthy = healthy.len() < buckets.all().count();
        drop(buckets);
        if overloaded && any_disconnected && not_all_healthy {
            self.run_reconnect_burst();
        }
    }

    fn run_reconnect_burst(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut buckets = self.buckets.write().unwrap();
        let disconnected_len = buckets.bucket(ConnectionStatus::Disconnected).len();
        let to_start = disconnected_len.min(MIN_CONCURRENT_CONNECTS);
        let mut rng = self.rng.lock().unwrap();
        let mut started = 0;
        while started < to_start {
            let remaining = buckets.bucket(ConnectionStatus::Disconnected).len();
            if remaining == 0 {
                break;
            }
            let idx = rng.gen_range(0..remaining);
            let conn = buckets.bucket_mut(ConnectionStatus::Disconnected).remove(idx);
            let addr = conn.remote;
            let new_conn = connection::spawn_connect(
                addr,
                self.credential.clone(),
                self.options.tos,
                self.workload.clone(),
                self.drain_watch.clone(),
                Arc::downgrade(self),
            );
            buckets
                .bucket_mut(ConnectionStatus::Connecting)
                .push(new_conn);
            started += 1;
        }
    }

    /// Move `conn` into bucket `to`, wherever it currently physically
    /// sits. Called by the connection's own IO task, which tracks its own
    /// status but not which bucket the channel last filed it under.
    fn transition(&self, conn: &Arc<Connection>, to: ConnectionStatus) {
        let mut buckets = self.buckets.write().unwrap();
        if let Some(conn) = buckets.take(conn.remote) {
            conn.set_status(to);
            buckets.bucket_mut(to).push(conn);
        }
    }

    /// Called by a connection's own IO task when it exits (spec §4.1
    /// "redispatch work from dead connections onto live ones", §7 Local
    /// recovery #2). Files `conn` as `Disconnected` and hands every
    /// stranded, non-builtin, non-fail-immediate request back out for
    /// redispatch onto a healthy connection or the backlog; builtin and
    /// fail-immediate requests are cancelled in place with
    /// `CONNECTION_CLOSED` (spec §4.2 `RemoveAll`).
    pub(crate) fn connection_lost(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.transition(conn, ConnectionStatus::Disconnected);
        let mut stranded = Vec::new();
        conn.queue.lock().unwrap().take_all(ErrorCode::ConnectionClosed, &mut stranded);
        for req in stranded {
            let channel = self.clone();
            tokio::spawn(async move {
                channel.redispatch_stranded(req).await;
            });
        }
    }

    /// Redispatch one request stranded by a dead connection onto a
    /// healthy one, or back into the backlog if none is available right
    /// now — the same choice `call_raw` makes for a fresh request, except
    /// the request already has a caller waiting on `req.complete` rather
    /// than an in-flight `call_raw` future.
    async fn redispatch_stranded(self: &Arc<Self>, mut req: PendingRequest) {
        let Some(complete) = req.complete.take() else {
            return;
        };
        if self.shutdown.load(Ordering::Acquire) || self.shuttingdown.load(Ordering::Acquire) {
            req.controller
                .set_failed_with_code(ErrorCode::ChannelShutdown, ErrorCode::ChannelShutdown.reason());
            complete(Err(ErrorCode::ChannelShutdown));
            return;
        }
        match self.pick_connection() {
            Some(conn) => {
                let result = self.send_on(&conn, req.method, req.body, req.controller).await;
                complete(result);
            }
            None => {
                let mut backlog = self.backlog.lock().await;
                backlog.push((req.method, req.body, req.controller, complete));
            }
        }
    }

    fn sweep_errors(&self) {
        let mut buckets = self.buckets.write().unwrap();
        let errored: Vec<Arc<Connection>> = buckets.bucket(ConnectionStatus::ConnectError).clone();
        for conn in errored {
            buckets.move_to(conn, ConnectionStatus::ConnectError, ConnectionStatus::Disconnected);
        }
    }

    fn check_idle_close(&self) {
        let buckets = self.buckets.read().unwrap();
        let all_idle = buckets.all().all(|c| {
            c.idle_for() >= self.options.keepalive_idle && c.pending_count() == 0
        });
        if !all_idle {
            return;
        }
        for conn in buckets.all() {
            conn.abort(ErrorCode::ConnectionClosed);
        }
    }

    /// Pick a random `Healthy` connection (spec §4.1 "Connection
    /// selection"), probing forward on contention, falling back to
    /// `None` (caller enqueues to the backlog) if none is available.
    fn pick_connection(&self) -> Option<Arc<Connection>> {
        let buckets = self.buckets.read().unwrap();
        let healthy = buckets.bucket(ConnectionStatus::Healthy);
        if healthy.is_empty() {
            return None;
        }
        let start = self.rng.lock().unwrap().gen_range(0..healthy.len());
        for offset in 0..healthy.len() {
            let idx = (start + offset) % healthy.len();
            let candidate = &healthy[idx];
            if candidate.status() == ConnectionStatus::Healthy {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Dispatch a raw request, matching the original's `RawCallMethod`
    /// (spec §11): caller already has serialized bytes.
    pub async fn call_raw(
        self: &Arc<Self>,
        method: impl Into<String>,
        body: Bytes,
        controller: Arc<RpcController>,
    ) -> Result<Bytes, ErrorCode> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ErrorCode::ChannelShutdown);
        }

        // Size limit applies before compression (spec §4.3 "Max sizes").
        if body.len() > crate::frame::MAX_FRAME_LEN {
            controller.mark_done();
            return Err(ErrorCode::ParseRequestMessage);
        }

        let method = method.into();

        match self.pick_connection() {
            Some(conn) => {
                let result = self.send_on(&conn, method, body, controller.clone()).await;
                controller.mark_done();
                result
            }
            None if controller.fail_immediately() => {
                // Fail-immediately bypasses the backlog (spec §4.1
                // "Fail-immediately"); builtin/heartbeat calls always set
                // this so they never wait behind user traffic.
                controller.mark_done();
                Err(ErrorCode::NetworkUnreachable)
            }
            None => {
                // No Healthy connection right now: hold the request in the
                // per-channel backlog (spec §4.1 "Backlog") until a
                // heartbeat success or reconnect triggers a redispatch.
                if self.shuttingdown.load(Ordering::Acquire) {
                    controller.mark_done();
                    return Err(ErrorCode::ChannelShutdown);
                }
                let (tx, rx) = tokio::sync::oneshot::channel();
                {
                    let mut backlog = self.backlog.lock().await;
                    backlog.push((
                        method,
                        body,
                        controller.clone(),
                        Box::new(move |res| {
                            let _ = tx.send(res);
                        }),
                    ));
                }
                let result = rx.await.unwrap_or(Err(ErrorCode::ChannelShutdown));
                controller.mark_done();
                result
            }
        }
    }

    /// Queue `body` on `conn`'s request queue and write its frame, awaiting
    /// the matched response (or the connection's mapped error if the send
    /// itself fails).
    async fn send_on(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        method: String,
        body: Bytes,
        controller: Arc<RpcController>,
    ) -> Result<Bytes, ErrorCode> {
        let sequence_id = self.sequence.next();
        let timeout = controller.timeout(self.options.default_timeout);

        let request_compress = controller.request_compress_type().resolve(body.len());
        let encoded_body = match request_compress.encode(&body) {
            Ok(b) => b,
            Err(_) => return Err(ErrorCode::CompressType),
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = conn.queue.lock().unwrap();
            queue.add(
                PendingRequest {
                    sequence_id,
                    controller: controller.clone(),
                    complete: Some(Box::new(move |res| {
                        let _ = tx.send(res);
                    })),
                    is_builtin: false,
                    deadline: std::time::Instant::now(),
                    method: method.clone(),
                    body,
                },
                timeout,
            );
        }
        let mut meta = RpcMeta::request(sequence_id, method);
        meta.compress_type = request_compress as i32;
        meta.expected_response_compress_type = controller.response_compress_type() as i32;
        meta.timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        match conn.send(OutboundRequest { meta, body: encoded_body }) {
            SendOutcome::Sent => {}
            SendOutcome::Full => {
                conn.queue.lock().unwrap().remove(sequence_id, RemoveReason::Canceled);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                // spec §7: a send-buffer-full failure closes the
                // connection and cancels its queue with CONNECTION_CLOSED.
                conn.transition(ConnectionStatus::Disconnecting);
                conn.abort(ErrorCode::ConnectionClosed);
                return Err(ErrorCode::SendBufferFull);
            }
            SendOutcome::Closed => {
                conn.queue.lock().unwrap().remove(sequence_id, RemoveReason::Canceled);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                return Err(conn.status().timeout_error());
            }
        }
        let result = rx.await.unwrap_or(Err(ErrorCode::ConnectionClosed));
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Redispatch every backlogged request onto a (hopefully now healthy)
    /// connection, or back into the backlog if none is available yet (spec
    /// §4.1 "Healthy→Connected demotion causes the channel to re-dispatch
    /// its backlog").
    async fn redispatch_backlog(self: &Arc<Self>) {
        let mut backlog = self.backlog.lock().await;
        let items = std::mem::take(&mut *backlog);
        drop(backlog);
        for (method, body, controller, complete) in items {
            let channel = self.clone();
            tokio::spawn(async move {
                let result = match channel.pick_connection() {
                    Some(conn) => channel.send_on(&conn, method, body, controller).await,
                    None => {
                        let mut backlog = channel.backlog.lock().await;
                        backlog.push((method, body, controller, complete));
                        return;
                    }
                };
                complete(result);
            });
        }
    }

    /// Begin graceful shutdown (spec §4.1 "Shutdown"): stop new dispatch,
    /// optionally wait for in-flight work, cancel the backlog, close every
    /// connection.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shuttingdown.store(true, Ordering::Release);

        if self.options.wait_all_pending {
            while self.in_flight.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        {
            let mut backlog = self.backlog.lock().await;
            for (_, _, controller, complete) in backlog.drain(..) {
                controller.set_failed_with_code(ErrorCode::ChannelShutdown, ErrorCode::ChannelShutdown.reason());
                complete(Err(ErrorCode::ChannelShutdown));
            }
        }

        {
            let mut buckets = self.buckets.write().unwrap();
            for conn in buckets.all() {
                conn.abort(ErrorCode::ChannelShutdown);
            }
            buckets.by_status = Default::default();
        }

        if let Some(signal) = self.drain_signal.lock().unwrap().take() {
            signal.drain();
        }

        self.shutdown.store(true, Ordering::Release);
    }
}

const ALL_STATUSES: [ConnectionStatus; 8] = [
    ConnectionStatus::Healthy,
    ConnectionStatus::Connected,
    ConnectionStatus::Connecting,
    ConnectionStatus::Disconnecting,
    ConnectionStatus::Disconnected,
    ConnectionStatus::ConnectError,
    ConnectionStatus::NoAuth,
    ConnectionStatus::Shutdown,
];

impl std::fmt::Debug for Channel {
    /// Mirrors the original's `Dump()` diagnostic string (spec §11) as a
    /// `Debug` impl rather than a bespoke method.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self.buckets.read().unwrap();
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("status", &self.status())
            .field("healthy", &buckets.bucket(ConnectionStatus::Healthy).len())
            .field("connected", &buckets.bucket(ConnectionStatus::Connected).len())
            .field("disconnected", &buckets.bucket(ConnectionStatus::Disconnected).len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}
