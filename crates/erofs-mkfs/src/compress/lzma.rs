//! LZMA compression via liblzma (the classic .lzma stream layout).

use xz2::stream::{Action, LzmaOptions, Status, Stream};

use super::{fit_dest_size, Codec};
use crate::error::{Error, Result};

pub struct LzmaCodec {
    preset: u32,
    dict_size: Option<u32>,
}

impl Default for LzmaCodec {
    fn default() -> Self {
        LzmaCodec {
            preset: 6,
            dict_size: None,
        }
    }
}

impl LzmaCodec {
    fn options(&self) -> Result<LzmaOptions> {
        let mut opts = LzmaOptions::new_preset(self.preset)
            .map_err(|e| Error::CodecFailure(format!("lzma preset: {e}")))?;
        if let Some(size) = self.dict_size {
            opts.dict_size(size);
        }
        Ok(opts)
    }
}

impl Codec for LzmaCodec {
    fn init(&mut self) -> Result<()> {
        // encoder state cannot be rewound, so a fresh stream is built per
        // cluster; creating one here validates the configuration early
        self.options().map(|_| ())
    }

    fn set_level(&mut self, level: i32) -> Result<()> {
        if !(0..=9).contains(&level) {
            return Error::invalid(format!("invalid lzma preset {level}"));
        }
        self.preset = level as u32;
        Ok(())
    }

    fn set_dict_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || !size.is_power_of_two() {
            return Error::invalid(format!("invalid lzma dictionary size {size}"));
        }
        self.dict_size = Some(size);
        Ok(())
    }

    fn compress_dest_size(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        let opts = self.options()?;
        fit_dest_size(src, dst, 64, |s, d| {
            let mut stream = Stream::new_lzma_encoder(&opts).ok()?;
            loop {
                let consumed = stream.total_in() as usize;
                let written = stream.total_out() as usize;
                if written >= d.len() {
                    return None;
                }
                match stream.process(&s[consumed..], &mut d[written..], Action::Finish) {
                    Ok(Status::StreamEnd) => return Some(stream.total_out() as usize),
                    Ok(_) => {
                        if stream.total_in() as usize == consumed
                            && stream.total_out() as usize == written
                        {
                            return None;
                        }
                    }
                    Err(_) => return None,
                }
            }
        })
    }
}
