//! Emit payload codec.
//!
//! Workers serialize `(emit key, metadata list)` to JSON and compress it
//! before buffering it in the store; the batched emitter reverses both
//! steps. The recorded uncompressed size doubles as an integrity check.

use anyhow::{bail, Context, Result};

use docpipe_core::models::EmitData;

const COMPRESSION_LEVEL: i32 = 0;

/// Returns `(uncompressed_size, compressed_bytes)` ready for
/// `insert_emit_payload`.
pub fn encode_emit_payload(data: &EmitData) -> Result<(i64, Vec<u8>)> {
    let json = serde_json::to_vec(data).context("failed to serialize emit payload")?;
    let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
        .context("failed to compress emit payload")?;
    Ok((json.len() as i64, compressed))
}

/// Inverse of [`encode_emit_payload`].
pub fn decode_emit_payload(bytes: &[u8], uncompressed_size: i64) -> Result<EmitData> {
    let json = zstd::decode_all(bytes).context("failed to decompress emit payload")?;
    if json.len() as i64 != uncompressed_size {
        bail!(
            "emit payload size mismatch: expected {uncompressed_size}, got {}",
            json.len()
        );
    }
    serde_json::from_slice(&json).context("failed to deserialize emit payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::models::{EmitKey, Metadata};

    fn sample() -> EmitData {
        let mut record = Metadata::new();
        record.insert("content".to_string(), "hello world".repeat(100));
        EmitData::new(EmitKey::new("index", "a.txt"), vec![record])
    }

    #[test]
    fn round_trip() {
        let data = sample();
        let (size, bytes) = encode_emit_payload(&data).unwrap();
        assert!(size > 0);
        let decoded = decode_emit_payload(&bytes, size).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn repetitive_content_compresses() {
        let (size, bytes) = encode_emit_payload(&sample()).unwrap();
        assert!((bytes.len() as i64) < size);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let (size, bytes) = encode_emit_payload(&sample()).unwrap();
        assert!(decode_emit_payload(&bytes, size + 1).is_err());
    }

    #[test]
    fn corrupt_bytes_are_rejected() {
        assert!(decode_emit_payload(b"not zstd", 10).is_err());
    }
}
