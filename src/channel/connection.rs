//! A single connection to one endpoint of a [`super::Channel`] (spec §4.1,
//! §4.3). Owns a `RequestQueue`, and the task that drives the socket's
//! read/write loop once login completes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::builtin::{HEALTH_METHOD, HEALTH_OK_PAYLOAD};
use crate::common::drain::Watch;
use crate::compress::CompressType;
use crate::controller::RpcController;
use crate::error::ErrorCode;
use crate::login;
use crate::meta::RpcMeta;
use crate::queue::{PendingRequest, RemoveReason, RequestQueue, Workload};

/// The nine-state connection status set (spec §4.1); `Unrecoverable` is a
/// boundary, not a state, so it isn't a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionStatus {
    Healthy = 0,
    Connected = 1,
    Connecting = 2,
    Disconnecting = 3,
    Disconnected = 4,
    ConnectError = 5,
    NoAuth = 6,
    Shutdown = 7,
}

impl ConnectionStatus {
    /// `Unrecoverable` boundary: `NoAuth`/`Shutdown` are terminal for this
    /// connection and are never retried in place.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::NoAuth | ConnectionStatus::Shutdown)
    }

    /// Error a request should fail with if woken up while its connection is
    /// in this status (spec §4.1 "Error-code mapping").
    pub(crate) fn timeout_error(self) -> ErrorCode {
        match self {
            ConnectionStatus::Healthy => ErrorCode::RequestTimeout,
            ConnectionStatus::Connected => ErrorCode::ServerUnavailable,
            ConnectionStatus::NoAuth => ErrorCode::NoAuth,
            ConnectionStatus::ConnectError => ErrorCode::ServiceUnreachable,
            ConnectionStatus::Connecting
            | ConnectionStatus::Disconnecting
            | ConnectionStatus::Disconnected => ErrorCode::NetworkUnreachable,
            ConnectionStatus::Shutdown => ErrorCode::ChannelShutdown,
        }
    }

    pub(crate) fn from_u8(v: u8) -> ConnectionStatus {
        match v {
            0 => ConnectionStatus::Healthy,
            1 => ConnectionStatus::Connected,
            2 => ConnectionStatus::Connecting,
            3 => ConnectionStatus::Disconnecting,
            4 => ConnectionStatus::Disconnected,
            5 => ConnectionStatus::ConnectError,
            6 => ConnectionStatus::NoAuth,
            _ => ConnectionStatus::Shutdown,
        }
    }
}

pub(crate) struct OutboundRequest {
    pub(crate) meta: RpcMeta,
    pub(crate) body: Bytes,
}

/// Bound on queued-but-unwritten frames per connection. Past this, the
/// write side is backed up enough that the original's socket-level
/// `SendPacket` failure (`rpc_connection.cc`'s `RPC_ERROR_SEND_BUFFER_FULL`)
/// is modeled here as the outbound mpsc filling up.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Outcome of handing a frame to the connection's IO task.
pub(crate) enum SendOutcome {
    Sent,
    /// Outbound queue is full (spec §7 "send-buffer-full").
    Full,
    /// The IO task has already exited.
    Closed,
}

/// One endpoint's connection. `status` is owned by the channel's bucket
/// map (a `Connection` lives in exactly one bucket at a time per spec
/// §3's invariant); this field mirrors it for lock-free reads from
/// request dispatch.
pub(crate) struct Connection {
    pub(crate) remote: SocketAddr,
    status: AtomicU8,
    pub(crate) queue: Mutex<RequestQueue>,
    outbound: mpsc::Sender<OutboundRequest>,
    builtin_pending: AtomicU64,
    pub(crate) last_traffic: Mutex<Instant>,
    /// Back-reference to the owning channel, so this connection's own IO
    /// task can move it between status buckets and hand stranded requests
    /// back for redispatch without the channel needing to drive the
    /// socket loop itself. `Weak` because the channel owns the connection,
    /// not the other way around.
    channel: Weak<super::Channel>,
}

impl Connection {
    pub(crate) fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Move this connection into bucket `to`, keeping the channel's bucket
    /// map and this mirror in sync (spec §3's one-bucket-at-a-time
    /// invariant). Falls back to a bare status write if the owning channel
    /// has already been dropped.
    pub(crate) fn transition(self: &Arc<Self>, to: ConnectionStatus) {
        match self.channel.upgrade() {
            Some(channel) => channel.transition(self, to),
            None => self.set_status(to),
        }
    }

    pub(crate) fn pending_count(&self) -> u64 {
        self.queue.lock().unwrap().workload.pending_count()
    }

    pub(crate) fn touch(&self) {
        *self.last_traffic.lock().unwrap() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_traffic.lock().unwrap().elapsed()
    }

    /// Enqueue a frame to be written by the connection's IO task.
    pub(crate) fn send(&self, req: OutboundRequest) -> SendOutcome {
        match self.outbound.try_send(req) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub(crate) fn abort(&self, code: ErrorCode) {
        self.queue.lock().unwrap().remove_all(code);
    }
}

/// Connect to `remote`, perform the login handshake, and spawn the
/// read/write loop. Returns immediately in `Connecting` status; the
/// caller (the channel) observes the status transition to `Healthy`/
/// `Connected`/`ConnectError`/`NoAuth` once the background task updates
/// it.
#[cfg(feature = "tcp")]
pub(crate) fn spawn_connect(
    remote: SocketAddr,
    auth_ticket: Arc<str>,
    tos: Option<u8>,
    parent_workload: Arc<Workload>,
    shutdown: Watch,
    channel: Weak<super::Channel>,
) -> Arc<Connection> {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let conn = Arc::new(Connection {
        remote,
        status: AtomicU8::new(ConnectionStatus::Connecting as u8),
        queue: Mutex::new(RequestQueue::new(Some(parent_workload))),
        outbound: tx,
        builtin_pending: AtomicU64::new(0),
        last_traffic: Mutex::new(Instant::now()),
        channel,
    });

    let task_conn = conn.clone();
    tokio::spawn(async move {
        match tokio::net::TcpStream::connect(remote).await {
            Ok(stream) => {
                if let Some(tos) = tos {
                    let _ = apply_tos(&stream, tos);
                }
                run_connection(task_conn, stream, auth_ticket, tos, rx, shutdown).await;
            }
            Err(_) => {
                task_conn.transition(ConnectionStatus::ConnectError);
                drain_outbound(rx).await;
            }
        }
    });

    conn
}

/// Without the `tcp` feature there is no net frame to dial; connections
/// are created already failed so the channel's state machine (reconnect
/// timer, error-bucket sweep) still exercises normally in tests that don't
/// need a live socket.
#[cfg(not(feature = "tcp"))]
pub(crate) fn spawn_connect(
    remote: SocketAddr,
    _auth_ticket: Arc<str>,
    _tos: Option<u8>,
    parent_workload: Arc<Workload>,
    _shutdown: Watch,
    channel: Weak<super::Channel>,
) -> Arc<Connection> {
    let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    Arc::new(Connection {
        remote,
        status: AtomicU8::new(ConnectionStatus::ConnectError as u8),
        queue: Mutex::new(RequestQueue::new(Some(parent_workload))),
        outbound: tx,
        builtin_pending: AtomicU64::new(0),
        last_traffic: Mutex::new(Instant::now()),
        channel,
    })
}

#[cfg(all(feature = "tcp", unix))]
fn apply_tos(stream: &tokio::net::TcpStream, tos: u8) -> std::io::Result<()> {
    use socket2::SockRef;
    let sock = SockRef::from(stream);
    sock.set_tos(tos as u32)
}

#[cfg(all(feature = "tcp", not(unix)))]
fn apply_tos(_stream: &tokio::net::TcpStream, _tos: u8) -> std::io::Result<()> {
    Ok(())
}

#[cfg(feature = "tcp")]
async fn drain_outbound(mut rx: mpsc::Receiver<OutboundRequest>) {
    while rx.recv().await.is_some() {}
}

#[cfg(feature = "tcp")]
async fn run_connection(
    conn: Arc<Connection>,
    stream: tokio::net::TcpStream,
    auth_ticket: Arc<str>,
    tos: Option<u8>,
    mut outbound: mpsc::Receiver<OutboundRequest>,
    mut shutdown: Watch,
) {
    let login_result = login::client_login(
        stream,
        &auth_ticket,
        &[CompressType::None, CompressType::Snappy],
        tos,
    )
    .await;

    let (mut io, _peer_compress) = match login_result {
        Ok(pair) => pair,
        Err(e) => {
            let status = if e.code() == ErrorCode::NoAuth {
                ConnectionStatus::NoAuth
            } else {
                ConnectionStatus::ConnectError
            };
            conn.transition(status);
            drain_outbound(outbound).await;
            return;
        }
    };

    conn.transition(ConnectionStatus::Connected);
    conn.touch();

    loop {
        tokio::select! {
            _ = shutdown.signaled() => {
                conn.transition(ConnectionStatus::Disconnecting);
                break;
            }
            maybe_req = outbound.recv() => {
                match maybe_req {
                    Some(req) => {
                        if write_one(&mut io, &req).await.is_err() {
                            break;
                        }
                        conn.touch();
                    }
                    None => break,
                }
            }
            frame = crate::frame::read_frame(&mut io) => {
                match frame {
                    Ok(frame) if frame.meta.is_response() => {
                        conn.touch();
                        handle_response(&conn, frame.meta, frame.body.freeze());
                    }
                    Ok(_) => {
                        // Clients never receive requests on this connection.
                        break;
                    }
                    Err(_) => break,
                }
            }
            _ = PollDeadlines(&conn) => {
                // The queue's rearming timer fired; PollDeadlines already
                // drove every expired entry's completion. Loop back around
                // to pick up whatever deadline is now at the head.
            }
        }
    }

    // The IO task is exiting: any work still sitting in the queue is
    // stranded, not failed. Hand it back to the channel to redispatch onto
    // a healthy connection or the backlog (spec §4.1, §7 Local recovery
    // #2), rather than cancelling it here.
    match conn.channel.upgrade() {
        Some(channel) => channel.connection_lost(&conn),
        None => {
            conn.set_status(ConnectionStatus::Disconnected);
            conn.abort(ErrorCode::ConnectionClosed);
        }
    }
}

/// Drives a [`Connection`]'s queue deadline timer (spec §4.2): polling this
/// future locks the queue just long enough to check/rearm its single
/// rearming timer, the same lock-only-across-structural-mutation discipline
/// `RequestQueue` itself follows. Resolves once a sweep over expired
/// entries has run; the caller's `select!` loop re-creates it each time
/// around so a still-armed-but-not-yet-due timer keeps waking the task.
#[cfg(feature = "tcp")]
struct PollDeadlines<'a>(&'a Connection);

#[cfg(feature = "tcp")]
impl<'a> std::future::Future for PollDeadlines<'a> {
    type Output = ();

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<()> {
        self.0.queue.lock().unwrap().poll_deadlines(cx)
    }
}

#[cfg(feature = "tcp")]
async fn write_one<T: AsyncRead + AsyncWrite + Unpin>(
    io: &mut T,
    req: &OutboundRequest,
) -> crate::error::Result<()> {
    crate::frame::write_frame(io, &req.meta, &req.body).await
}

#[cfg(feature = "tcp")]
fn handle_response(conn: &Connection, meta: RpcMeta, body: Bytes) {
    let mut queue = conn.queue.lock().unwrap();
    if meta.failed {
        let code = error_code_from_i32(meta.error_code);
        if let Some(mut req) = queue.remove(meta.sequence_id, RemoveReason::Response) {
            req.controller.set_failed_with_code(code, meta.reason.clone());
            if let Some(complete) = req.complete.take() {
                complete(Err(code));
            }
        }
        return;
    }
    match meta.compress_type().decode(&body) {
        Ok(decoded) => {
            queue.complete(meta.sequence_id, decoded);
        }
        Err(_) => {
            if let Some(mut req) = queue.remove(meta.sequence_id, RemoveReason::Response) {
                req.controller
                    .set_failed_with_code(ErrorCode::UncompressMessage, ErrorCode::UncompressMessage.reason());
                if let Some(complete) = req.complete.take() {
                    complete(Err(ErrorCode::UncompressMessage));
                }
            }
        }
    }
}

#[cfg(feature = "tcp")]
fn error_code_from_i32(v: i32) -> ErrorCode {
    match v {
        1 => ErrorCode::FromUser,
        2 => ErrorCode::RequestTimeout,
        3 => ErrorCode::ServerUnavailable,
        4 => ErrorCode::NoAuth,
        5 => ErrorCode::ServiceUnreachable,
        6 => ErrorCode::NetworkUnreachable,
        7 => ErrorCode::ChannelShutdown,
        8 => ErrorCode::ConnectionClosed,
        9 => ErrorCode::SendBufferFull,
        10 => ErrorCode::ParseRequestMessage,
        11 => ErrorCode::ParseResponseMessage,
        12 => ErrorCode::MethodName,
        13 => ErrorCode::FoundService,
        14 => ErrorCode::FoundMethod,
        15 => ErrorCode::CompressType,
        16 => ErrorCode::UncompressMessage,
        17 => ErrorCode::ServerShutdown,
        18 => ErrorCode::AllRequestDiscarded,
        _ => ErrorCode::Unknown,
    }
}

/// Issue a built-in `Health` call against this connection with a short
/// deadline, reporting success only if the payload matches exactly (spec
/// §11).
pub(crate) async fn heartbeat(conn: &Arc<Connection>, sequence_id: i64, deadline: Duration) -> bool {
    let controller = Arc::new(RpcController::new(sequence_id, HEALTH_METHOD));
    controller.set_fail_immediately(true);
    let (tx, rx) = tokio::sync::oneshot::channel();
    conn.builtin_pending.fetch_add(1, Ordering::Relaxed);
    {
        let mut queue = conn.queue.lock().unwrap();
        queue.add(
            PendingRequest {
                sequence_id,
                controller: controller.clone(),
                complete: Some(Box::new(move |res| {
                    let _ = tx.send(res);
                })),
                is_builtin: true,
                deadline: Instant::now(),
                method: HEALTH_METHOD.to_string(),
                body: Bytes::new(),
            },
            deadline,
        );
    }
    let sent = matches!(
        conn.send(OutboundRequest {
            meta: RpcMeta::request(sequence_id, HEALTH_METHOD),
            body: Bytes::new(),
        }),
        SendOutcome::Sent
    );
    conn.builtin_pending.fetch_sub(1, Ordering::Relaxed);
    if !sent {
        return false;
    }
    matches!(rx.await, Ok(Ok(body)) if &body[..] == HEALTH_OK_PAYLOAD)
}
