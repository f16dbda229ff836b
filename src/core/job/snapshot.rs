//! Compressed provenance snapshots (gzip, then base64).

use crate::store::StoreError;
use base64::{Engine as _, engine::general_purpose};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::io::{Read, Write};

pub fn compress(value: &Value) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    let compressed = encoder.finish()?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decompress(encoded: &str) -> Result<Value, StoreError> {
    let compressed = general_purpose::STANDARD.decode(encoded)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_restores_the_source() {
        let source = json!({"type": "Move", "config_specs": {"moving_step": {"type": "float"}}});
        let encoded = compress(&source).unwrap();
        assert_eq!(decompress(&encoded).unwrap(), source);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(decompress("%%%"), Err(StoreError::Encoding(_))));
        let not_gzip = general_purpose::STANDARD.encode(b"plain text");
        assert!(matches!(decompress(&not_gzip), Err(StoreError::Compression(_))));
    }
}
