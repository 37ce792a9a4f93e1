//! Error and Result module.
//!
//! Every failure surfaced by this crate is attached to an [`RpcController`]
//! (see [`crate::controller`]) as a numeric [`ErrorCode`] plus a short text
//! reason. This module additionally offers `std::error::Error`-compatible
//! [`Error`]/[`Result`] for use in plain `Result`-returning code such as the
//! login handshake and frame codec, which run before a controller exists.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have Poppy `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// The numeric error codes surfaced to RPC callers (see spec §6/§7).
///
/// `0` is reserved for success; controllers that have not failed report
/// `ErrorCode::Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    FromUser = 1,
    RequestTimeout = 2,
    ServerUnavailable = 3,
    NoAuth = 4,
    ServiceUnreachable = 5,
    NetworkUnreachable = 6,
    ChannelShutdown = 7,
    ConnectionClosed = 8,
    SendBufferFull = 9,
    ParseRequestMessage = 10,
    ParseResponseMessage = 11,
    MethodName = 12,
    FoundService = 13,
    FoundMethod = 14,
    CompressType = 15,
    UncompressMessage = 16,
    ServerShutdown = 17,
    AllRequestDiscarded = 18,
    RpcFailed = 19,
    StreamTimeout = 20,
    StreamAborted = 21,
    EndOfStream = 22,
    Unknown = 999,
}

impl ErrorCode {
    /// Human readable, stable reason string for a bare error code with no
    /// further context (used when the server/peer did not supply one).
    pub fn reason(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::FromUser => "user reported failure",
            ErrorCode::RequestTimeout => "request timed out",
            ErrorCode::ServerUnavailable => "server unavailable",
            ErrorCode::NoAuth => "not authorized",
            ErrorCode::ServiceUnreachable => "service unreachable",
            ErrorCode::NetworkUnreachable => "network unreachable",
            ErrorCode::ChannelShutdown => "channel is shut down",
            ErrorCode::ConnectionClosed => "connection closed",
            ErrorCode::SendBufferFull => "send buffer full",
            ErrorCode::ParseRequestMessage => "failed to parse request message",
            ErrorCode::ParseResponseMessage => "failed to parse response message",
            ErrorCode::MethodName => "malformed method name",
            ErrorCode::FoundService => "service not found",
            ErrorCode::FoundMethod => "method not found",
            ErrorCode::CompressType => "unsupported compress type",
            ErrorCode::UncompressMessage => "failed to uncompress message",
            ErrorCode::ServerShutdown => "server is shutting down",
            ErrorCode::AllRequestDiscarded => "all requests discarded",
            ErrorCode::RpcFailed => "rpc failed",
            ErrorCode::StreamTimeout => "stream packet timed out",
            ErrorCode::StreamAborted => "stream aborted",
            ErrorCode::EndOfStream => "end of stream",
            ErrorCode::Unknown => "unknown error",
        }
    }
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// Represents errors that can occur while framing, parsing, or transporting
/// Poppy messages, independent of any particular in-flight call.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Wire frame violated a protocol invariant (length mismatch, missing
    /// required metadata). Fatal on the connection that produced it.
    Protocol,
    /// Login handshake failed (bad request shape, rejected, or a verifier
    /// error).
    Login,
    /// An `io::Error` while reading or writing the underlying socket.
    Io,
    /// A message exceeded the 32 MiB frame size limit.
    TooLarge,
    /// Compression or decompression failed.
    Compress,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// A channel (request queue, dispatch) is closed.
    ChannelClosed,
    /// Carries an [`ErrorCode`] straight through, for call failures that
    /// need to cross an `std::error::Error` boundary (e.g. inside a
    /// `Box<dyn Error>` body error).
    Code(ErrorCode),
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_protocol<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::TooLarge).with("request too large")
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_code(code: ErrorCode) -> Error {
        Error::new(Kind::Code(code))
    }

    /// Returns true if this was caused by a protocol invariant violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if this was about work that was canceled before running.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if a request exceeded the maximum frame size.
    pub fn is_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::TooLarge)
    }

    /// The [`ErrorCode`] this error maps to for a controller.
    pub fn code(&self) -> ErrorCode {
        match self.inner.kind {
            Kind::Protocol => ErrorCode::ParseRequestMessage,
            Kind::Login => ErrorCode::NoAuth,
            Kind::Io => ErrorCode::ConnectionClosed,
            Kind::TooLarge => ErrorCode::ParseRequestMessage,
            Kind::Compress => ErrorCode::UncompressMessage,
            Kind::Canceled => ErrorCode::ChannelShutdown,
            Kind::ChannelClosed => ErrorCode::ChannelShutdown,
            Kind::Code(c) => c,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("poppy::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Login => f.write_str("login handshake failed")?,
            Kind::Io => f.write_str("connection error")?,
            Kind::TooLarge => f.write_str("message too large")?,
            Kind::Compress => f.write_str("compression error")?,
            Kind::Canceled => f.write_str("operation canceled")?,
            Kind::ChannelClosed => f.write_str("channel closed")?,
            Kind::Code(c) => write!(f, "{}", c)?,
        }

        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}
