//! Block compression of a packet's message region.

use crate::error::TransportError;

/// Compress / decompress one packet payload as a block.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// LZ4 block compression with the original length carried in a `u32 LE`
/// prefix, so decompression can size its output buffer up front.
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let compressed =
            lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), false)
                .map_err(|e| TransportError::Compression(e.to_string()))?;

        let mut out = Vec::with_capacity(4 + compressed.len());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        if data.len() < 4 {
            return Err(TransportError::Compression("missing length prefix".to_string()));
        }
        let original_len = u32::from_le_bytes(data[..4].try_into().unwrap());

        lz4::block::decompress(&data[4..], Some(original_len as i32))
            .map_err(|e| TransportError::Compression(e.to_string()))
    }
}

/// Passthrough for hosts with compression disabled on one side of a test
/// or debugging setup.
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![])]
    #[case::short(b"hi".to_vec())]
    #[case::repetitive(b"abcabcabc".repeat(200))]
    fn test_lz4_roundtrip(#[case] data: Vec<u8>) {
        let compressed = Lz4Compressor.compress(&data).unwrap();
        assert_eq!(Lz4Compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_lz4_shrinks_repetitive_data() {
        let data = b"0123456789abcdef".repeat(100);
        let compressed = Lz4Compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_prefix(vec![1, 2])]
    #[case::garbage(vec![16, 0, 0, 0, 0xf1, 0x02, 0x03])]
    fn test_lz4_rejects_invalid_input(#[case] data: Vec<u8>) {
        assert!(Lz4Compressor.decompress(&data).is_err());
    }

    #[test]
    fn test_passthrough() {
        let out = NoCompression.compress(b"data").unwrap();
        assert_eq!(NoCompression.decompress(&out).unwrap(), b"data");
    }
}
