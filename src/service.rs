//! Asynchronous RPC services
//!
//! User code implements one `(service, method)` at a time as a plain async
//! function from a [`MethodRequest`] to a serialized response, registered
//! into a [`MethodTable`] and handed to [`crate::server::Server::register`]
//! via [`crate::server::ServiceEntry::from_table`] — the seat hyper's own
//! per-route handler closures play for HTTP, generalized from
//! `http::Request`/`Body` to Poppy's `MethodRequest`/`Bytes`.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::ErrorCode;

/// A single method invocation as it reaches user code: the fully qualified
/// method name and the still-serialized (and already decompressed)
/// request payload.
#[derive(Debug, Clone)]
pub struct MethodRequest {
    /// `package.Service.Method`, e.g. `poppy.StreamingService.UploadPacket`.
    pub method: String,
    /// Serialized request message bytes.
    pub payload: Bytes,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes, ErrorCode>> + Send>>;

/// A table mapping fully-qualified method names to handlers for a single
/// `package.Service`, used by [`crate::server::Server::register`].
pub struct MethodTable<S> {
    service_name: String,
    _marker: PhantomData<S>,
    handlers: Vec<(&'static str, Box<dyn Fn(&S, MethodRequest) -> HandlerFuture + Send + Sync>)>,
}

impl<S> MethodTable<S> {
    pub fn new(service_name: impl Into<String>) -> Self {
        MethodTable {
            service_name: service_name.into(),
            _marker: PhantomData,
            handlers: Vec::new(),
        }
    }

    /// Register a method by its bare name (not fully qualified); the
    /// dispatcher looks it up as `{service_name}.{name}`.
    pub fn method<F, Fut>(mut self, name: &'static str, handler: F) -> Self
    where
        F: Fn(&S, MethodRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, ErrorCode>> + Send + 'static,
    {
        self.handlers
            .push((name, Box::new(move |s, req| Box::pin(handler(s, req)) as HandlerFuture)));
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub(crate) fn find(&self, bare_method: &str) -> Option<&(dyn Fn(&S, MethodRequest) -> HandlerFuture + Send + Sync)> {
        self.handlers
            .iter()
            .find(|(n, _)| *n == bare_method)
            .map(|(_, h)| &**h)
    }
}

impl<S> std::fmt::Debug for MethodTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("service_name", &self.service_name)
            .field("methods", &self.handlers.iter().map(|(n, _)| *n).collect::<Vec<_>>())
            .finish()
    }
}
