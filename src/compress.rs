//! Body compression negotiation (spec §4.3).
//!
//! `CompressType::Auto` on a request means "let the server choose"; the
//! server then picks `Snappy` unless the payload is tiny, in which case
//! compressing would only add overhead.

use bytes::Bytes;

use crate::error::{Error, Kind};

/// Compression applied to a frame body, carried in [`crate::meta::RpcMeta`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum CompressType {
    None = 0,
    Snappy = 1,
    Auto = 2,
}

impl Default for CompressType {
    fn default() -> Self {
        CompressType::None
    }
}

/// Payloads under this size aren't worth compressing: Snappy's frame
/// overhead and the extra copy outweigh the savings.
const MIN_COMPRESS_LEN: usize = 256;

impl CompressType {
    /// Resolve `Auto` to a concrete encoding for a given payload, per the
    /// size heuristic above. Concrete types pass through unchanged.
    pub(crate) fn resolve(self, payload_len: usize) -> CompressType {
        match self {
            CompressType::Auto => {
                if payload_len >= MIN_COMPRESS_LEN {
                    CompressType::Snappy
                } else {
                    CompressType::None
                }
            }
            other => other,
        }
    }

    pub(crate) fn encode(self, body: &[u8]) -> Result<Bytes, Error> {
        match self {
            CompressType::None => Ok(Bytes::copy_from_slice(body)),
            CompressType::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                let compressed = encoder
                    .compress_vec(body)
                    .map_err(|e| Error::new(Kind::Compress).with(e))?;
                Ok(Bytes::from(compressed))
            }
            CompressType::Auto => unreachable!("Auto must be resolved before encoding"),
        }
    }

    pub(crate) fn decode(self, body: &[u8]) -> Result<Bytes, Error> {
        match self {
            CompressType::None => Ok(Bytes::copy_from_slice(body)),
            CompressType::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                let decompressed = decoder
                    .decompress_vec(body)
                    .map_err(|e| Error::new(Kind::Compress).with(e))?;
                Ok(Bytes::from(decompressed))
            }
            CompressType::Auto => Err(Error::new(Kind::Code(crate::error::ErrorCode::CompressType))),
        }
    }
}
