//! Batch codec: JSON serialization wrapped in gzip.
//!
//! `decode(encode(x)) == x` for every batch list. Decoding validates the
//! whole payload up front, so a corrupt body is rejected before the caller
//! can apply any of it.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::CodecError;
use crate::record::ChangeBatch;

/// Content type of encoded payloads.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Encode batches into a compressed wire payload.
pub fn encode(batches: &[ChangeBatch]) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(batches).map_err(|e| CodecError::Encoding(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CodecError::Encoding(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::Encoding(e.to_string()))?;

    Ok(Bytes::from(compressed))
}

/// Largest decompressed payload [`decode`] accepts.
pub const MAX_DECODED_BYTES: u64 = 64 * 1024 * 1024;

/// Decode a compressed wire payload.
///
/// Payloads that inflate past [`MAX_DECODED_BYTES`] are malformed.
pub fn decode(payload: &[u8]) -> Result<Vec<ChangeBatch>, CodecError> {
    decode_with_limit(payload, MAX_DECODED_BYTES)
}

/// [`decode`] with an explicit cap on the decompressed size.
pub fn decode_with_limit(payload: &[u8], limit: u64) -> Result<Vec<ChangeBatch>, CodecError> {
    let mut json = Vec::new();
    GzDecoder::new(payload)
        .take(limit.saturating_add(1))
        .read_to_end(&mut json)
        .map_err(|e| CodecError::MalformedPayload(format!("decompression failed: {e}")))?;

    if json.len() as u64 > limit {
        return Err(CodecError::MalformedPayload(format!(
            "payload inflates past {limit} bytes"
        )));
    }

    serde_json::from_slice(&json)
        .map_err(|e| CodecError::MalformedPayload(format!("invalid batch json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::types::{TableName, Timestamp};
    use proptest::prelude::*;
    use serde_json::json;

    fn sample() -> Vec<ChangeBatch> {
        vec![
            ChangeBatch::new(
                TableName::TASK,
                vec![Record::new("t-1", Timestamp::from_millis(10)).with("name", "story speech")],
            ),
            ChangeBatch::new(
                TableName::MICROTASK,
                vec![
                    Record::new("m-1", Timestamp::from_millis(11)).with("input", json!({"sentence": "नमस्ते"})),
                    Record::new("m-2", Timestamp::from_millis(12)).with("input_file_id", json!(null)),
                ],
            ),
        ]
    }

    #[test]
    fn test_roundtrip() {
        let batches = sample();
        let encoded = encode(&batches).unwrap();
        assert_eq!(decode(&encoded).unwrap(), batches);
    }

    #[test]
    fn test_payload_is_gzip() {
        let encoded = encode(&sample()).unwrap();
        assert_eq!(&encoded[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_empty_list_roundtrip() {
        let encoded = encode(&[]).unwrap();
        assert!(decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_payload_is_malformed() {
        let err = decode(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));

        let mut encoded = encode(&sample()).unwrap().to_vec();
        let mid = encoded.len() / 2;
        encoded.truncate(mid);
        assert!(matches!(decode(&encoded), Err(CodecError::MalformedPayload(_))));
    }

    #[test]
    fn test_valid_gzip_invalid_json_is_malformed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"tableName\": 5}").unwrap();
        let bytes = encoder.finish().unwrap();
        assert!(matches!(decode(&bytes), Err(CodecError::MalformedPayload(_))));
    }

    #[test]
    fn test_oversized_payload_is_malformed() {
        let encoded = encode(&sample()).unwrap();
        let inflated = serde_json::to_vec(&sample()).unwrap().len() as u64;

        assert_eq!(decode_with_limit(&encoded, inflated).unwrap(), sample());
        assert!(matches!(
            decode_with_limit(&encoded, inflated - 1),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_compression_bomb_is_refused() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        let padding = vec![b' '; 1024 * 1024];
        encoder.write_all(b"[").unwrap();
        for _ in 0..(MAX_DECODED_BYTES / padding.len() as u64 + 1) {
            encoder.write_all(&padding).unwrap();
        }
        encoder.write_all(b"]").unwrap();
        let bomb = encoder.finish().unwrap();
        assert!(bomb.len() < 1024 * 1024);
        assert!(matches!(decode(&bomb), Err(CodecError::MalformedPayload(_))));
    }

    fn arb_row() -> impl Strategy<Value = Record> {
        ("[a-z0-9-]{1,12}", 0i64..4_102_444_800_000, "[ -~]{0,24}", any::<i32>(), any::<bool>())
            .prop_map(|(id, ms, text, n, flag)| {
                Record::new(id, Timestamp::from_millis(ms))
                    .with("text", text)
                    .with("n", n)
                    .with("flag", flag)
            })
    }

    fn arb_batch() -> impl Strategy<Value = ChangeBatch> {
        ("[a-z_]{1,24}", prop::collection::vec(arb_row(), 0..8))
            .prop_map(|(table, rows)| ChangeBatch::new(TableName::new(table), rows))
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(batches in prop::collection::vec(arb_batch(), 1..6)) {
            let encoded = encode(&batches).unwrap();
            prop_assert_eq!(decode(&encoded).unwrap(), batches);
        }
    }
}
