//! The client surface (spec §6, §9): a process-wide default [`Client`]
//! that looks up/creates cached [`Channel`]s by logical name, plus typed
//! and raw call paths. Mirrors the way hyper's legacy `Client` wrapped a
//! connection pool behind a handful of `request`/`get` entry points,
//! generalized here to Poppy's channel cache.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};

use bytes::Bytes;
use prost::Message;

use crate::channel::Channel;
use crate::config::ChannelOptions;
use crate::controller::RpcController;
use crate::error::{Error, ErrorCode, Kind};

/// A process-wide cache of [`Channel`]s keyed by logical name, matching
/// spec §3's "channel cache" lifecycle (retained while referenced, shared
/// across callers that ask for the same name).
#[derive(Debug)]
pub struct Client {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    credential: Arc<str>,
}

impl Client {
    pub fn new(credential: impl Into<Arc<str>>) -> Self {
        Client {
            channels: RwLock::new(HashMap::new()),
            credential: credential.into(),
        }
    }

    /// Look up or create the channel for `name`, caching it for reuse
    /// (spec §3 "Channel... constructed on first lookup from a Client").
    pub fn channel(
        &self,
        name: impl Into<String>,
        endpoints: Vec<SocketAddr>,
        options: ChannelOptions,
    ) -> Arc<Channel> {
        let name = name.into();
        if options.channel_cache {
            if let Some(existing) = self.channels.read().unwrap().get(&name) {
                return existing.clone();
            }
        }

        let channel = Channel::new(name.clone(), endpoints, self.credential.clone(), options.clone());
        if options.channel_cache {
            self.channels.write().unwrap().insert(name, channel.clone());
        }
        channel
    }

    /// Drop a channel from the cache without shutting it down; any stub
    /// still holding an `Arc<Channel>` keeps it alive (spec §3 "retained
    /// while any stub references it").
    pub fn evict(&self, name: &str) {
        self.channels.write().unwrap().remove(name);
    }
}

static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();

/// The process-wide default client (spec §9), lazily and idempotently
/// initialized on first use from any thread.
pub fn default_client() -> &'static Client {
    DEFAULT_CLIENT.get_or_init(|| Client::new(""))
}

/// A bytes-in/bytes-out call against an already-resolved channel, matching
/// the original's `RawCallMethod` (spec §11).
pub async fn call_raw(
    channel: &Arc<Channel>,
    method: impl Into<String>,
    request: Bytes,
    controller: Arc<RpcController>,
) -> Result<Bytes, ErrorCode> {
    channel.call_raw(method, request, controller).await
}

/// A typed call: serializes `req` with `prost`, issues the call, and
/// parses the response as `Resp`.
pub async fn call_method<Req, Resp>(
    channel: &Arc<Channel>,
    method: impl Into<String>,
    req: &Req,
    controller: Arc<RpcController>,
) -> Result<Resp, Error>
where
    Req: Message,
    Resp: Message + Default,
{
    let mut buf = Vec::with_capacity(req.encoded_len());
    req.encode(&mut buf)
        .map_err(|e| Error::new(Kind::Code(ErrorCode::ParseRequestMessage)).with(e))?;

    let response = call_raw(channel, method, Bytes::from(buf), controller)
        .await
        .map_err(|code| Error::new(Kind::Code(code)))?;

    Resp::decode(response).map_err(|e| Error::new(Kind::Code(ErrorCode::ParseResponseMessage)).with(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_is_idempotent() {
        let a = default_client() as *const Client;
        let b = default_client() as *const Client;
        assert_eq!(a, b);
    }
}
