//! Wire messages for the built-in `poppy.StreamingService` (spec §4.5).
//!
//! Hand-derived `prost::Message` structs, the same way [`crate::meta::RpcMeta`]
//! is: the shapes are small and stable enough that a `.proto`/`build.rs`
//! step would be more machinery than the messages are worth.

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct CreateStreamRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct CreateStreamResponse {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct CloseStreamRequest {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(bool, tag = "2", default = "false")]
    pub abort: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct CloseStreamResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct UploadPacketRequest {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(uint64, tag = "2")]
    pub packet_id: u64,
    #[prost(bytes, tag = "3")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "4", default = "false")]
    pub is_eof: bool,
    #[prost(bool, tag = "5", default = "false")]
    pub is_abort: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct UploadPacketResponse {
    /// Cumulative ack: everything up through this id has been processed.
    #[prost(uint64, tag = "1")]
    pub ack_packet_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct DownloadPacketRequest {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    /// Cumulative ack for packets already consumed from a previous
    /// `DownloadPacket` response.
    #[prost(uint64, tag = "2", default = "0")]
    pub ack_packet_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct DownloadPacketResponse {
    /// `0` means "nothing new yet"; real packet ids start at 1.
    #[prost(uint64, tag = "1")]
    pub packet_id: u64,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3", default = "false")]
    pub is_eof: bool,
    #[prost(bool, tag = "4", default = "false")]
    pub is_abort: bool,
}
