//! Builder-style configuration (spec §7.3), mirroring hyper's
//! `client::conn::http1::Builder` / `server::conn::http1::Builder`
//! setter style instead of an external config-file format.

use std::time::Duration;

/// Options shared by every `Connection` a [`crate::channel::Channel`]
/// opens to one of its endpoints.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub(crate) tos: Option<u8>,
    pub(crate) keepalive_idle: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) channel_cache: bool,
    pub(crate) wait_all_pending: bool,
    pub(crate) default_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            tos: None,
            keepalive_idle: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            channel_cache: true,
            wait_all_pending: false,
            default_timeout: Duration::from_secs(10),
        }
    }
}

impl ChannelOptions {
    pub fn new() -> Self {
        ChannelOptions::default()
    }

    /// IP TOS hint sent as `X-Poppy-Tos` at login (spec §4.3); `0 < tos <
    /// 256`.
    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = Some(tos);
        self
    }

    pub fn keepalive_idle(mut self, d: Duration) -> Self {
        self.keepalive_idle = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    /// Whether channels to the same logical name are cached and shared
    /// process-wide (spec §4.1 "channel cache").
    pub fn channel_cache(mut self, enabled: bool) -> Self {
        self.channel_cache = enabled;
        self
    }

    /// When `true`, [`crate::channel::Channel::shutdown`] waits for all
    /// pending requests to finish rather than canceling them immediately.
    pub fn wait_all_pending(mut self, enabled: bool) -> Self {
        self.wait_all_pending = enabled;
        self
    }

    pub fn default_timeout(mut self, d: Duration) -> Self {
        self.default_timeout = d;
        self
    }
}

/// Options controlling a [`crate::server::Server`]'s worker/callback pool
/// sizing, defaulting to 4 and 8 per spec §5.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub(crate) worker_threads: usize,
    pub(crate) callback_threads: usize,
    pub(crate) max_frame_len: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            worker_threads: 4,
            callback_threads: 8,
            max_frame_len: crate::frame::MAX_FRAME_LEN,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        ServerOptions::default()
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn callback_threads(mut self, n: usize) -> Self {
        self.callback_threads = n;
        self
    }

    pub fn max_frame_len(mut self, n: usize) -> Self {
        self.max_frame_len = n;
        self
    }
}
