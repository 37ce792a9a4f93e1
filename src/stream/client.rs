//! Caller side of the built-in `poppy.StreamingService`: one round trip
//! per helper, with the retry-on-`RpcFailed` policy from spec §4.5
//! ("Client-side retry"). A real application drives these in a loop —
//! `upload_once` while the local write queue has anything queued,
//! `download_once` continuously to keep the local read side fed — until
//! the stream closes.

use std::sync::Arc;

use bytes::Bytes;

use super::manager::StreamManager;
use super::packet::{
    CloseStreamRequest, CloseStreamResponse, CreateStreamRequest, CreateStreamResponse, DownloadPacketRequest,
    DownloadPacketResponse, UploadPacketRequest, UploadPacketResponse,
};
use super::{Stream, StreamOptions};
use crate::builtin::streaming_method::{
    CLOSE_INPUT_STREAM as METHOD_CLOSE_INPUT_STREAM, CLOSE_OUTPUT_STREAM as METHOD_CLOSE_OUTPUT_STREAM,
    CREATE_INPUT_STREAM as METHOD_CREATE_INPUT_STREAM, CREATE_OUTPUT_STREAM as METHOD_CREATE_OUTPUT_STREAM,
    DOWNLOAD_PACKET as METHOD_DOWNLOAD_PACKET, UPLOAD_PACKET as METHOD_UPLOAD_PACKET,
};
use crate::channel::Channel;
use crate::client;
use crate::controller::RpcController;
use crate::error::ErrorCode;

/// Transport-level failures the original groups under `RPC_FAILED` for
/// retry purposes (spec §4.5 "Client-side retry"), as opposed to a
/// business failure the handler itself reported.
fn is_retryable(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::RpcFailed
            | ErrorCode::ConnectionClosed
            | ErrorCode::NetworkUnreachable
            | ErrorCode::RequestTimeout
            | ErrorCode::ServerUnavailable
    )
}

async fn retrying_call<Req, Resp>(
    channel: &Arc<Channel>,
    method: &'static str,
    req: &Req,
    options: StreamOptions,
) -> Result<Resp, ErrorCode>
where
    Req: prost::Message,
    Resp: prost::Message + Default,
{
    let mut attempt = 0;
    loop {
        let controller = Arc::new(RpcController::for_call(method));
        controller.set_timeout(options.timeout);
        match client::call_method::<Req, Resp>(channel, method, req, controller).await {
            Ok(resp) => return Ok(resp),
            Err(err) if is_retryable(err.code()) && attempt < options.retry_count => {
                attempt += 1;
                continue;
            }
            Err(err) => return Err(err.code()),
        }
    }
}

/// Ask the peer to create the opposing output stream, then adopt the id
/// it returns as our local input stream (spec §4.5 "Identity/creation").
pub(crate) async fn create_input_stream(
    channel: &Arc<Channel>,
    manager: &Arc<StreamManager>,
    options: StreamOptions,
) -> Result<Arc<Stream>, ErrorCode> {
    let resp: CreateStreamResponse =
        retrying_call(channel, METHOD_CREATE_INPUT_STREAM, &CreateStreamRequest {}, options).await?;
    Ok(manager.adopt(resp.stream_id, options))
}

/// Mirror of [`create_input_stream`] for the write-side RPC.
pub(crate) async fn create_output_stream(
    channel: &Arc<Channel>,
    manager: &Arc<StreamManager>,
    options: StreamOptions,
) -> Result<Arc<Stream>, ErrorCode> {
    let resp: CreateStreamResponse =
        retrying_call(channel, METHOD_CREATE_OUTPUT_STREAM, &CreateStreamRequest {}, options).await?;
    Ok(manager.adopt(resp.stream_id, options))
}

/// Which side of a stream a [`super::PeerStream`] was opened as; decides
/// which `Close*Stream` RPC a close/abort uses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Input,
    Output,
}

pub(crate) async fn close_stream(
    channel: &Arc<Channel>,
    stream: &Stream,
    role: Role,
    abort: bool,
    options: StreamOptions,
) -> Result<(), ErrorCode> {
    let req = CloseStreamRequest {
        stream_id: stream.id,
        abort,
    };
    let method = match role {
        Role::Input => METHOD_CLOSE_INPUT_STREAM,
        Role::Output => METHOD_CLOSE_OUTPUT_STREAM,
    };
    let _resp: CloseStreamResponse = retrying_call(channel, method, &req, options).await?;
    Ok(())
}

/// Send the head of our write queue to the peer via one `UploadPacket`
/// call, if anything is queued; on success, ack it locally from the
/// response (spec §4.5 "Write").
pub(crate) async fn upload_once(channel: &Arc<Channel>, stream: &Arc<Stream>, options: StreamOptions) -> Result<(), ErrorCode> {
    let Some((packet_id, payload, is_eof, is_abort)) = stream.peek_write() else {
        return Ok(());
    };
    let req = UploadPacketRequest {
        stream_id: stream.id,
        packet_id,
        payload: payload.to_vec(),
        is_eof,
        is_abort,
    };
    let resp: UploadPacketResponse = retrying_call(channel, METHOD_UPLOAD_PACKET, &req, options).await?;
    stream.ack_writes(resp.ack_packet_id);
    Ok(())
}

/// Pull one packet from the peer's write queue via `DownloadPacket` and
/// deliver it to our local read side (spec §4.5 "Read").
pub(crate) async fn download_once(
    channel: &Arc<Channel>,
    stream: &Arc<Stream>,
    last_ack: u64,
    options: StreamOptions,
) -> Result<u64, ErrorCode> {
    let req = DownloadPacketRequest {
        stream_id: stream.id,
        ack_packet_id: last_ack,
    };
    let resp: DownloadPacketResponse = retrying_call(channel, METHOD_DOWNLOAD_PACKET, &req, options).await?;
    if resp.packet_id == 0 {
        return Ok(last_ack);
    }
    let result = if resp.is_abort {
        Err(ErrorCode::StreamAborted)
    } else if resp.is_eof {
        Err(ErrorCode::EndOfStream)
    } else {
        Ok(Bytes::from(resp.payload))
    };
    // A retried DownloadPacket whose first attempt already delivered this
    // packet_id (response lost, not the delivery) must not redeliver it
    // (spec §9's open question, symmetric with the server's UploadPacket
    // handler).
    stream.deliver_upload(resp.packet_id, result);
    Ok(resp.packet_id)
}
