//! Payload codec for replicated SQL commands.
//!
//! Commands are compressed before they enter the raft log, and additionally
//! base64-encoded (URL-safe alphabet) when they have to survive a redirect
//! as a query parameter.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use std::io;
use thiserror::Error;

/// Fixed compression level so every node produces identical payload bytes.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload compression failed: {0}")]
    Compress(#[source] io::Error),
    #[error("corrupt compressed payload: {0}")]
    Inflate(#[source] io::Error),
    #[error("malformed query encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// Losslessly compresses a raw SQL payload for log storage.
pub fn deflate(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::encode_all(raw, COMPRESSION_LEVEL).map_err(CodecError::Compress)
}

/// Exact inverse of [`deflate`].
pub fn inflate(compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::decode_all(compressed).map_err(CodecError::Inflate)
}

/// Encodes already-compressed bytes into a URL-safe string for the
/// `/forward` query parameter. No character in the output requires
/// percent-encoding.
pub fn url_encode(compressed: &[u8]) -> String {
    URL_SAFE.encode(compressed)
}

/// Exact inverse of [`url_encode`].
pub fn url_decode(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(URL_SAFE.decode(encoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trip() {
        let samples: &[&[u8]] = &[
            b"",
            b"SELECT * FROM t",
            b"CREATE TABLE t(a,b,c,d);INSERT INTO t VALUES(1,2,3,4);SELECT * FROM t",
            &[0u8, 255, 1, 254, 2, 253],
        ];
        for raw in samples {
            let packed = deflate(raw).unwrap();
            assert_eq!(inflate(&packed).unwrap(), *raw);
        }
    }

    #[test]
    fn url_round_trip_preserves_compressed_bytes() {
        let packed = deflate(b"INSERT INTO t VALUES ('a;b', 1, 2, 'c')").unwrap();
        let encoded = url_encode(&packed);
        assert!(!encoded.contains(['+', '/', '&', '?', '%']));
        assert_eq!(url_decode(&encoded).unwrap(), packed);
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(matches!(
            inflate(b"definitely not zstd"),
            Err(CodecError::Inflate(_))
        ));
    }

    #[test]
    fn url_decode_rejects_garbage() {
        assert!(matches!(
            url_decode("!!not base64!!"),
            Err(CodecError::Encoding(_))
        ));
    }
}
