//! The framed request/response protocol (spec §4.3).
//!
//! Once the login handshake completes, a connection carries a stream of
//! frames, each:
//!
//! ```text
//! +-----------------+-----------------+----------------+---------------+
//! | meta_len (u32be)| body_len (u32be)|  RpcMeta bytes |   body bytes  |
//! +-----------------+-----------------+----------------+---------------+
//! ```
//!
//! Mirrors the way hyper's h1 `Decoder`/`Encoder` wrap an `AsyncRead`/
//! `AsyncWrite` with framing state, except Poppy framing has no incremental
//! chunked-transfer state machine to track: every frame's two lengths are
//! known up front.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorCode, Kind, Result};
use crate::meta::RpcMeta;

const HEADER_LEN: usize = 8;

/// Hard ceiling on `meta_len + body_len`, matching the C++ implementation's
/// frame size guard. Exists to stop a misbehaving peer from making us
/// allocate an unbounded buffer.
pub(crate) const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// One decoded frame: a control header plus its (still possibly
/// compressed) body.
pub(crate) struct Frame {
    pub(crate) meta: RpcMeta,
    pub(crate) body: BytesMut,
}

/// Serialize `meta` and `body` into the 4+4 length-prefixed wire form.
pub(crate) fn encode(meta: &RpcMeta, body: &[u8]) -> Result<BytesMut> {
    let meta_bytes = meta.encode_to_vec();
    let total = HEADER_LEN + meta_bytes.len() + body.len();
    if meta_bytes.len() + body.len() > MAX_FRAME_LEN {
        return Err(Error::new(Kind::TooLarge));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(meta_bytes.len() as u32);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&meta_bytes);
    buf.put_slice(body);
    Ok(buf)
}

/// Read exactly one frame from `io`, blocking until the whole frame has
/// arrived or the connection is closed/erroring.
pub(crate) async fn read_frame<T: AsyncRead + Unpin>(io: &mut T) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    io.read_exact(&mut header).await.map_err(Error::new_io)?;
    let mut header = &header[..];
    let meta_len = header.get_u32() as usize;
    let body_len = header.get_u32() as usize;

    if meta_len == 0 {
        return Err(Error::new_protocol("empty RpcMeta"));
    }
    if meta_len + body_len > MAX_FRAME_LEN {
        return Err(Error::new(Kind::TooLarge));
    }

    let mut meta_buf = vec![0u8; meta_len];
    io.read_exact(&mut meta_buf).await.map_err(Error::new_io)?;
    let meta = RpcMeta::decode(&meta_buf[..])
        .map_err(|e| Error::new(Kind::Code(ErrorCode::ParseRequestMessage)).with(e))?;

    let mut body = BytesMut::with_capacity(body_len);
    body.resize(body_len, 0);
    io.read_exact(&mut body).await.map_err(Error::new_io)?;

    Ok(Frame { meta, body })
}

/// Write one frame to `io` and flush it.
pub(crate) async fn write_frame<T: AsyncWrite + Unpin>(
    io: &mut T,
    meta: &RpcMeta,
    body: &[u8],
) -> Result<()> {
    let buf = encode(meta, body)?;
    io.write_all(&buf).await.map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let meta = RpcMeta::request(7, "poppy.Health.Check");
        let body = b"payload".to_vec();

        let buf = encode(&meta, &body).unwrap();
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let frame = read_frame(&mut cursor)
            .await
            .unwrap_or_else(|_| panic!("decode should succeed"));

        assert_eq!(frame.meta.sequence_id, 7);
        assert_eq!(frame.meta.method, "poppy.Health.Check");
        assert_eq!(&frame.body[..], &body[..]);
    }

    #[test]
    fn rejects_oversized_frame() {
        let meta = RpcMeta::request(1, "x");
        let huge = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(encode(&meta, &huge).is_err());
    }
}
