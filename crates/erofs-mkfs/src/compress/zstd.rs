//! ZSTD compression via the zstd-safe context API.

use zstd_safe::{get_error_name, CCtx};

use super::{fit_dest_size, Codec};
use crate::error::{Error, Result};

pub struct ZstdCodec {
    level: i32,
    dict_size: Option<u32>,
    ctx: Option<CCtx<'static>>,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        ZstdCodec {
            level: 3,
            dict_size: None,
            ctx: None,
        }
    }
}

impl Codec for ZstdCodec {
    fn init(&mut self) -> Result<()> {
        self.ctx = Some(CCtx::create());
        Ok(())
    }

    fn set_level(&mut self, level: i32) -> Result<()> {
        if !(1..=22).contains(&level) {
            return Error::invalid(format!("invalid zstd compression level {level}"));
        }
        self.level = level;
        Ok(())
    }

    fn set_dict_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || !size.is_power_of_two() {
            return Error::invalid(format!("invalid zstd window size {size}"));
        }
        self.dict_size = Some(size);
        Ok(())
    }

    fn compress_dest_size(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        let level = self.level;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| Error::CodecFailure("zstd codec not initialised".into()))?;
        fit_dest_size(src, dst, 64, |s, d| match ctx.compress(d, s, level) {
            Ok(written) => Some(written),
            Err(code) => {
                log::trace!("zstd: {}", get_error_name(code));
                None
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
        let mut codec = ZstdCodec::default();
        codec.init().unwrap();

        let src = b"zstandard zstandard ".repeat(400);
        let mut dst = vec![0u8; 4096];
        let (written, consumed) = codec.compress_dest_size(&src, &mut dst).unwrap();
        assert_eq!(consumed, src.len());
        assert!(written < src.len());

        let mut back = vec![0u8; src.len()];
        let mut dctx = zstd_safe::DCtx::create();
        let n = dctx.decompress(&mut back[..], &dst[..written]).unwrap();
        assert_eq!(&back[..n], &src[..]);
    }

    #[test]
    fn test_level_validation() {
        let mut codec = ZstdCodec::default();
        assert!(codec.set_level(0).is_err());
        assert!(codec.set_level(23).is_err());
        assert!(codec.set_level(19).is_ok());
    }
}
