//! The `RpcMeta` control header carried by every frame (spec §4.3).
//!
//! `RpcMeta` is hand-derived as a `prost::Message` the same way
//! `tari_comms`'s RPC smoke test derives its wire types directly on plain
//! Rust structs, with no `.proto` file or `build.rs` step: the message
//! shape is small and stable enough that generating it is more machinery
//! than it's worth.

use prost::Message;

use crate::compress::CompressType;
use crate::error::ErrorCode;

/// Which direction/kind of message a frame carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum MessageType {
    Request = 0,
    Response = 1,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Request
    }
}

/// The fixed-layout header that precedes every request/response body once
/// a connection is in frame mode.
///
/// Field numbers are stable across the life of the protocol; do not
/// renumber existing fields when adding new ones.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RpcMeta {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(int64, tag = "2")]
    pub sequence_id: i64,
    #[prost(string, tag = "3")]
    pub method: String,
    #[prost(bool, tag = "4", default = "false")]
    pub failed: bool,
    #[prost(int32, tag = "5", default = "0")]
    pub error_code: i32,
    #[prost(string, tag = "6", default = "")]
    pub reason: String,
    #[prost(bool, tag = "7", default = "false")]
    pub canceled: bool,
    #[prost(int32, tag = "8", default = "0")]
    pub timeout_ms: i32,
    #[prost(enumeration = "CompressType", tag = "9", default = "0")]
    pub compress_type: i32,
    #[prost(enumeration = "CompressType", tag = "10", default = "0")]
    pub expected_response_compress_type: i32,
}

impl RpcMeta {
    pub(crate) fn request(sequence_id: i64, method: impl Into<String>) -> Self {
        RpcMeta {
            r#type: MessageType::Request as i32,
            sequence_id,
            method: method.into(),
            ..Default::default()
        }
    }

    pub(crate) fn response(sequence_id: i64) -> Self {
        RpcMeta {
            r#type: MessageType::Response as i32,
            sequence_id,
            ..Default::default()
        }
    }

    pub(crate) fn with_failure(mut self, code: ErrorCode, reason: impl Into<String>) -> Self {
        self.failed = true;
        self.error_code = code as i32;
        self.reason = reason.into();
        self
    }

    pub(crate) fn is_response(&self) -> bool {
        self.r#type == MessageType::Response as i32
    }

    pub(crate) fn compress_type(&self) -> CompressType {
        CompressType::from_i32(self.compress_type).unwrap_or(CompressType::None)
    }

    /// Encode with the length prefix `frame::encode` expects stripped off;
    /// callers prepend the frame header themselves.
    pub(crate) fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        // `encode` only fails if the buffer lacks remaining capacity, which
        // cannot happen given the reservation above.
        self.encode(&mut buf).expect("RpcMeta encode is infallible");
        buf
    }
}
