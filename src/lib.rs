#![deny(missing_debug_implementations)]
#![cfg_attr(all(test, feature = "full"), deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # poppy
//!
//! Poppy is an RPC runtime that transports request/response calls, and a
//! multiplexed stream layer built on top of them, over long-lived HTTP/1.1
//! connections.
//!
//! ## Features
//!
//! - A channel state machine that pools connections per logical service
//!   name, reconnects, and spreads load with randomized selection.
//! - A length-prefixed framing layer riding on a one-time HTTP/1.1 login
//!   handshake, so the wire still looks like plain HTTP to anything
//!   sniffing the first bytes of a connection.
//! - Per-call timeouts, cancellation, and compression negotiation.
//! - A multiplexed streaming layer for transferring data too large or too
//!   open-ended to fit in a single call/response pair.
//!
//! # Optional Features
//!
//! - `client`: Enables [`Client`](client::Client) and the channel state
//!   machine.
//! - `server`: Enables [`Server`](server::Server) and its dispatch loop.
//!   Implies `tcp`.
//! - `stream`: Enables the multiplexed streaming layer. Implies `client`
//!   and `server`.
//! - `tcp`: Enables real `tokio` TCP networking. Without it, channels still
//!   run their connection state machine, just with every dial attempt
//!   resolving straight to a connect error.
//! - `runtime`: Currently an alias for `tcp`.
//! - `full`: Enables everything above.
#[macro_use]
mod cfg;

pub use crate::error::{Error, ErrorCode, Result};

mod builtin;
mod common;
mod compress;
pub mod config;
pub mod controller;
mod error;
mod frame;
mod login;
mod meta;
mod queue;
pub mod rt;
pub mod service;

cfg_client! {
    pub mod channel;
    pub mod client;
}

cfg_server! {
    pub mod server;
}

cfg_stream! {
    pub mod stream;
}
