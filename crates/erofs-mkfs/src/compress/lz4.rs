//! LZ4 block compression.

use super::{fit_dest_size, Codec};
use crate::error::Result;

#[derive(Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    // LZ4 block compression has no levels or dictionaries; the trait
    // defaults reject both.

    fn compress_dest_size(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        fit_dest_size(src, dst, 64, |s, d| {
            lz4_flex::block::compress_into(s, d).ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let mut codec = Lz4Codec;
        let src = b"yadda ".repeat(500);
        let mut dst = vec![0u8; 1024];
        let (written, consumed) = codec.compress_dest_size(&src, &mut dst).unwrap();
        assert_eq!(consumed, src.len());
        let back = lz4_flex::block::decompress(&dst[..written], src.len()).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_incompressible_shrinks_consumption() {
        let mut codec = Lz4Codec;
        // incompressible pseudo-random bytes against a tiny destination
        let src: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut dst = vec![0u8; 512];
        match codec.compress_dest_size(&src, &mut dst) {
            Ok((written, consumed)) => {
                assert!(written <= 512);
                assert!(consumed < src.len());
            }
            Err(_) => {} // nothing fit at all; the driver stores it plain
        }
    }
}
