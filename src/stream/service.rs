//! Server-side handlers for the built-in `poppy.StreamingService` (spec
//! §4.5, §11), registered on every [`crate::server::Server`] that enables
//! the `stream` feature the same way `BuiltinService::Health` is always
//! registered.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message as _;

use super::manager::StreamManager;
use super::packet::{
    CloseStreamRequest, CloseStreamResponse, CreateStreamRequest, CreateStreamResponse, DownloadPacketRequest,
    DownloadPacketResponse, UploadPacketRequest, UploadPacketResponse,
};
use super::StreamOptions;
use crate::error::ErrorCode;
use crate::service::{MethodRequest, MethodTable};

fn encode<M: prost::Message>(m: &M) -> Bytes {
    let mut buf = Vec::with_capacity(m.encoded_len());
    m.encode(&mut buf).expect("encoding a fixed-shape message cannot fail");
    Bytes::from(buf)
}

fn decode<M: prost::Message + Default>(body: Bytes) -> Result<M, ErrorCode> {
    M::decode(body).map_err(|_| ErrorCode::ParseRequestMessage)
}

async fn create_stream(mgr: &Arc<StreamManager>, _body: Bytes) -> Result<Bytes, ErrorCode> {
    let stream = mgr.create(StreamOptions::default());
    Ok(encode(&CreateStreamResponse { stream_id: stream.id }))
}

async fn close_stream(mgr: &Arc<StreamManager>, body: Bytes, abort: bool) -> Result<Bytes, ErrorCode> {
    let req: CloseStreamRequest = decode(body)?;
    if let Some(stream) = mgr.get_stream(req.stream_id) {
        if abort || req.abort {
            stream.abort();
        } else {
            stream.close();
        }
        mgr.retire(req.stream_id).await;
    }
    Ok(encode(&CloseStreamResponse {}))
}

async fn upload_packet(mgr: &Arc<StreamManager>, body: Bytes) -> Result<Bytes, ErrorCode> {
    let req: UploadPacketRequest = decode(body)?;
    let stream = mgr.get_stream(req.stream_id).ok_or(ErrorCode::EndOfStream)?;
    let result = if req.is_abort {
        Err(ErrorCode::StreamAborted)
    } else if req.is_eof {
        Err(ErrorCode::EndOfStream)
    } else {
        Ok(Bytes::from(req.payload))
    };
    // This is the server's own read half of a `CreateOutputStream` stream
    // (spec §4.5: the server created the opposing *input* stream) —
    // application code on this side consumes it via `ServerStream::read`.
    // `deliver_upload` discards (but still acks) a packet_id the client's
    // retry already delivered once, per spec §9's open question.
    stream.deliver_upload(req.packet_id, result);
    Ok(encode(&UploadPacketResponse {
        ack_packet_id: req.packet_id,
    }))
}

async fn download_packet(mgr: &Arc<StreamManager>, body: Bytes) -> Result<Bytes, ErrorCode> {
    let req: DownloadPacketRequest = decode(body)?;
    let stream = mgr.get_stream(req.stream_id).ok_or(ErrorCode::EndOfStream)?;
    let wait = stream.options.timeout;
    match stream.poll_download(req.ack_packet_id, wait).await {
        Some((packet_id, payload, is_eof, is_abort)) => Ok(encode(&DownloadPacketResponse {
            packet_id,
            payload: payload.to_vec(),
            is_eof,
            is_abort,
        })),
        None => Ok(encode(&DownloadPacketResponse {
            packet_id: 0,
            payload: Vec::new(),
            is_eof: false,
            is_abort: false,
        })),
    }
}

/// The method table registered for `poppy.StreamingService`.
pub(crate) fn method_table() -> MethodTable<Arc<StreamManager>> {
    // Bare names: the dispatcher (`crate::server::dispatch`) already split
    // the fully qualified `poppy.StreamingService.X` method name from the
    // frame before calling in here (see `crate::builtin::streaming_method`
    // for the qualified constants both sides agree on).
    MethodTable::new("poppy.StreamingService")
        .method("CreateInputStream", |mgr, req: MethodRequest| create_stream(mgr, req.payload))
        .method("CreateOutputStream", |mgr, req: MethodRequest| create_stream(mgr, req.payload))
        .method("CloseInputStream", |mgr, req: MethodRequest| close_stream(mgr, req.payload, false))
        .method("CloseOutputStream", |mgr, req: MethodRequest| close_stream(mgr, req.payload, false))
        .method("UploadPacket", |mgr, req: MethodRequest| upload_packet(mgr, req.payload))
        .method("DownloadPacket", |mgr, req: MethodRequest| download_packet(mgr, req.payload))
}
