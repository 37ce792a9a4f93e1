//! The server side of the runtime (spec §4.4): accepts connections on a
//! listener, runs the login handshake, and dispatches framed requests to
//! registered [`crate::service::Service`]s. Grounded in hyper's
//! `server::conn::http1::Connection` for the accept-loop/graceful-shutdown
//! shape (`common::drain`), generalized from HTTP requests to Poppy's
//! `(service, method)` dispatch table.

mod dispatch;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};

use crate::common::drain::{self, Signal, Watch};
use crate::config::ServerOptions;
use crate::controller::RpcController;
use crate::login::LoginRejection;

pub use dispatch::{ServiceEntry, VerifyFn};

/// Global in-flight controller set, used for graceful-shutdown accounting
/// (spec §4.4 "Server dispatch" step 3) and approximate memory cost
/// tracking.
pub(crate) struct InFlight {
    controllers: Mutex<HashMap<i64, Arc<RpcController>>>,
    memory_cost: std::sync::atomic::AtomicI64,
}

impl InFlight {
    fn new() -> Self {
        InFlight {
            controllers: Mutex::new(HashMap::new()),
            memory_cost: std::sync::atomic::AtomicI64::new(0),
        }
    }

    fn register(&self, controller: Arc<RpcController>, cost: i64) {
        self.memory_cost.fetch_add(cost, Ordering::Relaxed);
        self.controllers
            .lock()
            .unwrap()
            .insert(controller.sequence_id, controller);
    }

    fn unregister(&self, sequence_id: i64, cost: i64) {
        self.memory_cost.fetch_sub(cost, Ordering::Relaxed);
        self.controllers.lock().unwrap().remove(&sequence_id);
    }

    fn len(&self) -> usize {
        self.controllers.lock().unwrap().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Running,
    Stopping,
    Stopped,
}

/// A running Poppy server: a registry of services plus the accept loop.
pub struct Server {
    services: RwLockServices,
    options: ServerOptions,
    state: Mutex<ServerState>,
    in_flight: Arc<InFlight>,
    drain_signal: Mutex<Option<Signal>>,
    drain_watch: Watch,
    verify: Arc<VerifyFn>,
}

type RwLockServices = std::sync::RwLock<HashMap<String, Arc<ServiceEntry>>>;

impl Server {
    /// Build a server with a credential verifier. `verify` returning `Ok`
    /// accepts the login; `Err` carries the rejection reason (spec §4.3).
    pub fn new(options: ServerOptions, verify: impl Fn(&crate::login::LoginInfo) -> Result<(), LoginRejection> + Send + Sync + 'static) -> Arc<Server> {
        let (signal, watch) = drain::channel();
        let server = Arc::new(Server {
            services: std::sync::RwLock::new(HashMap::new()),
            options,
            state: Mutex::new(ServerState::Running),
            in_flight: Arc::new(InFlight::new()),
            drain_signal: Mutex::new(Some(signal)),
            drain_watch: watch,
            verify: Arc::new(verify),
        });
        crate::builtin::register_health(&server);
        server
    }

    /// Register a service's method table under `service.service_name()`.
    pub fn register(&self, service: ServiceEntry) {
        let name = service.service_name().to_string();
        self.services.write().unwrap().insert(name, Arc::new(service));
    }

    /// Bind and run the accept loop until [`Server::stop`]/[`Server::quick_stop`]
    /// is called.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> crate::error::Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(crate::error::Error::new_io)?;
        let mut shutdown = self.drain_watch.clone();

        loop {
            tokio::select! {
                _ = shutdown.signaled() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(_) => continue,
                    };
                    self.spawn_connection(stream, remote);
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let server = self.clone();
        tokio::spawn(async move {
            dispatch::handle_connection(server, stream, remote).await;
        });
    }

    fn is_stopping(&self) -> bool {
        *self.state.lock().unwrap() != ServerState::Running
    }

    /// Graceful stop (spec §4.4): refuse new method calls, wait for the
    /// in-flight controller set to drain, then close listeners.
    pub async fn stop(self: &Arc<Self>) {
        *self.state.lock().unwrap() = ServerState::Stopping;
        while self.in_flight.len() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.finish_stop();
    }

    /// Stop without waiting for in-flight work to drain.
    pub async fn quick_stop(self: &Arc<Self>) {
        *self.state.lock().unwrap() = ServerState::Stopping;
        self.finish_stop();
    }

    fn finish_stop(&self) {
        if let Some(signal) = self.drain_signal.lock().unwrap().take() {
            signal.drain();
        }
        *self.state.lock().unwrap() = ServerState::Stopped;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &*self.state.lock().unwrap())
            .field("in_flight", &self.in_flight.len())
            .field("services", &self.services.read().unwrap().len())
            .finish()
    }
}
