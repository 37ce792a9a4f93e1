//! Plumbing shared by the client channel, server dispatch, and streaming
//! layer: the executor wrapper, the rearming deadline timer, the graceful
//! drain signal, and the login-handshake read-ahead buffer.

pub(crate) mod drain;
pub(crate) mod exec;
pub(crate) mod io;
pub(crate) mod timeout;

pub(crate) use self::exec::Exec;
