//! DEFLATE (raw, headerless) compression via flate2.

use flate2::{Compress, Compression, FlushCompress, Status};

use super::{fit_dest_size, Codec};
use crate::error::{Error, Result};

pub struct DeflateCodec {
    level: u32,
    ctx: Option<Compress>,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        DeflateCodec {
            level: Compression::default().level(),
            ctx: None,
        }
    }
}

impl Codec for DeflateCodec {
    fn init(&mut self) -> Result<()> {
        self.ctx = Some(Compress::new(Compression::new(self.level), false));
        Ok(())
    }

    fn set_level(&mut self, level: i32) -> Result<()> {
        if !(0..=9).contains(&level) {
            return Error::invalid(format!("invalid deflate compression level {level}"));
        }
        self.level = level as u32;
        Ok(())
    }

    fn compress_dest_size(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| Error::CodecFailure("deflate codec not initialised".into()))?;
        fit_dest_size(src, dst, 64, |s, d| {
            ctx.reset();
            loop {
                let consumed = ctx.total_in() as usize;
                let written = ctx.total_out() as usize;
                if written >= d.len() {
                    return None;
                }
                match ctx.compress(&s[consumed..], &mut d[written..], FlushCompress::Finish) {
                    Ok(Status::StreamEnd) => return Some(ctx.total_out() as usize),
                    Ok(Status::Ok) => {
                        if ctx.total_in() as usize == consumed
                            && ctx.total_out() as usize == written
                        {
                            return None;
                        }
                    }
                    Ok(Status::BufError) | Err(_) => return None,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let mut codec = DeflateCodec::default();
        codec.set_level(6).unwrap();
        codec.init().unwrap();

        let src = b"the quick brown fox ".repeat(200);
        let mut dst = vec![0u8; 2048];
        let (written, consumed) = codec.compress_dest_size(&src, &mut dst).unwrap();
        assert_eq!(consumed, src.len());

        let mut back = Vec::with_capacity(src.len());
        let mut d = flate2::Decompress::new(false);
        d.decompress_vec(&dst[..written], &mut back, flate2::FlushDecompress::Finish)
            .unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_level_validation() {
        let mut codec = DeflateCodec::default();
        assert!(codec.set_level(10).is_err());
        assert!(codec.set_level(-1).is_err());
        assert!(codec.set_level(1).is_ok());
    }
}
