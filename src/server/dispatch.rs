//! Per-connection accept/dispatch loop (spec §4.4).
//!
//! Mirrors the shape of hyper's `server::conn::http1::Connection` drive
//! loop: one task per accepted socket, reading frames and invoking the
//! registered handler, writing the response back on the same connection.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;

use super::Server;
use crate::compress::CompressType;
use crate::controller::RpcController;
use crate::error::ErrorCode;
use crate::login::{self, LoginInfo, LoginOutcome, LoginRejection};
use crate::meta::RpcMeta;
use crate::service::MethodRequest;

type BoxFuture = Pin<Box<dyn Future<Output = Result<Bytes, ErrorCode>> + Send>>;

pub type VerifyFn = dyn Fn(&LoginInfo) -> Result<(), LoginRejection> + Send + Sync;

/// Approximate per-call overhead added to a controller's memory cost
/// accounting (spec §4.4 step 3, `controller + request.SpaceUsed`); the
/// controller's own footprint is a small constant, the request bytes
/// dominate.
const CONTROLLER_OVERHEAD_BYTES: i64 = 128;

/// A registered `package.Service`'s method dispatch table, type-erased so
/// [`Server::register`] can hold services of different state types in one
/// map.
pub struct ServiceEntry {
    name: String,
    dispatch: Box<dyn Fn(MethodRequest) -> BoxFuture + Send + Sync>,
}

impl ServiceEntry {
    /// Build an entry from a service's state and its method table (see
    /// [`crate::service::MethodTable`]).
    pub fn from_table<S: Send + Sync + 'static>(
        state: S,
        table: crate::service::MethodTable<S>,
    ) -> Self {
        let name = table.service_name().to_string();
        let state = Arc::new(state);
        ServiceEntry {
            name,
            dispatch: Box::new(move |req: MethodRequest| -> BoxFuture {
                let bare = match split_method(&req.method) {
                    Some((_, bare)) => bare.to_string(),
                    None => req.method.clone(),
                };
                match table.find(&bare) {
                    Some(handler) => handler(&state, req),
                    None => Box::pin(async { Err(ErrorCode::FoundMethod) }),
                }
            }),
        }
    }

    pub(crate) fn service_name(&self) -> &str {
        &self.name
    }

    fn call(&self, req: MethodRequest) -> BoxFuture {
        (self.dispatch)(req)
    }
}

impl std::fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry").field("name", &self.name).finish()
    }
}

/// Split `poppy.Echo.Echo` into `("poppy.Echo", "Echo")`.
fn split_method(full: &str) -> Option<(&str, &str)> {
    full.rsplit_once('.')
}

pub(crate) async fn handle_connection(server: Arc<Server>, stream: TcpStream, remote: SocketAddr) {
    let verify = server.verify.clone();
    let our_compress = [CompressType::None, CompressType::Snappy];

    let outcome = login::server_login(stream, &our_compress, move |info| (verify)(info)).await;
    let (mut io, info) = match outcome {
        Ok(LoginOutcome::Accepted { io, peer_compress_types }) => {
            let info = LoginInfo {
                auth_ticket: None,
                compress_types: peer_compress_types,
                tos: None,
            };
            (io, info)
        }
        _ => return,
    };

    let mut shutdown = server.drain_watch.clone();
    loop {
        tokio::select! {
            _ = shutdown.signaled() => break,
            frame = crate::frame::read_frame(&mut io) => {
                let frame = match frame {
                    Ok(f) if !f.meta.is_response() => f,
                    _ => break,
                };
                let server = server.clone();
                let peer_compress = info.compress_types.clone();
                let reply = dispatch_one(&server, frame.meta, frame.body.freeze(), remote, &peer_compress).await;
                if crate::frame::write_frame(&mut io, &reply.0, &reply.1).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn dispatch_one(
    server: &Arc<Server>,
    meta: RpcMeta,
    body: Bytes,
    remote: SocketAddr,
    peer_compress: &[CompressType],
) -> (RpcMeta, Bytes) {
    let sequence_id = meta.sequence_id;

    if server.is_stopping() {
        return fail(sequence_id, ErrorCode::ServerShutdown);
    }

    let (service_name, _) = match split_method(&meta.method) {
        Some(pair) => pair,
        None => return fail(sequence_id, ErrorCode::MethodName),
    };

    let service = {
        let services = server.services.read().unwrap();
        match services.get(service_name) {
            Some(s) => s.clone(),
            None => return fail(sequence_id, ErrorCode::FoundService),
        }
    };

    let payload = match meta.compress_type().decode(&body) {
        Ok(p) => p,
        Err(_) => return fail(sequence_id, ErrorCode::UncompressMessage),
    };

    let controller = Arc::new(RpcController::new(sequence_id, meta.method.clone()));
    controller.set_remote_address(remote);
    let memory_cost = CONTROLLER_OVERHEAD_BYTES + payload.len() as i64;
    server.in_flight.register(controller.clone(), memory_cost);

    let result = service
        .call(MethodRequest {
            method: meta.method.clone(),
            payload,
        })
        .await;

    server.in_flight.unregister(sequence_id, memory_cost);
    controller.mark_done();

    match result {
        Ok(response_body) => {
            let requested = CompressType::from_i32(meta.expected_response_compress_type)
                .unwrap_or(CompressType::None);
            let resolved = requested.resolve(response_body.len());
            let chosen = if peer_compress.contains(&resolved) {
                resolved
            } else {
                CompressType::None
            };
            let encoded = match chosen.encode(&response_body) {
                Ok(b) => b,
                Err(_) => return fail(sequence_id, ErrorCode::UncompressMessage),
            };
            let mut resp_meta = RpcMeta::response(sequence_id);
            resp_meta.compress_type = chosen as i32;
            (resp_meta, encoded)
        }
        Err(code) => fail(sequence_id, code),
    }
}

fn fail(sequence_id: i64, code: ErrorCode) -> (RpcMeta, Bytes) {
    (
        RpcMeta::response(sequence_id).with_failure(code, code.reason()),
        Bytes::new(),
    )
}
