//! Compression codecs, per-file hints and the cluster driver.
//!
//! Codecs are consumed through one uniform interface: a codec is
//! constructed per configured algorithm, levelled and sized once, then
//! asked repeatedly to compress a source window into a bounded
//! destination, reporting how much input it consumed.

use log::debug;
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::format::{
    self, DeflateCfg, Lz4Cfg, LzmaCfg, ZstdCfg, COMPRESSION_DEFLATE, COMPRESSION_LZ4,
    COMPRESSION_LZMA, COMPRESSION_ZSTD,
};

mod deflate;
pub mod driver;
pub mod hints;
mod lz4;
mod lzma;
mod zstd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Lz4,
    Lzma,
    Deflate,
    Zstd,
}

impl Algorithm {
    pub fn id(self) -> u8 {
        match self {
            Algorithm::Lz4 => COMPRESSION_LZ4,
            Algorithm::Lzma => COMPRESSION_LZMA,
            Algorithm::Deflate => COMPRESSION_DEFLATE,
            Algorithm::Zstd => COMPRESSION_ZSTD,
        }
    }

    pub fn from_name(name: &str) -> Result<Algorithm> {
        match name {
            "lz4" => Ok(Algorithm::Lz4),
            "lzma" => Ok(Algorithm::Lzma),
            "deflate" => Ok(Algorithm::Deflate),
            "zstd" => Ok(Algorithm::Zstd),
            _ => Error::invalid(format!("unknown compression algorithm {name:?}")),
        }
    }
}

/// The uniform codec interface.
///
/// `compress_dest_size` compresses a prefix of `src` so the output fits in
/// `dst`, returning `(written, consumed)` with `written <= dst.len()` and
/// `consumed <= src.len()`.  A codec that cannot fit anything acceptable
/// reports `CodecFailure`; the driver then stores the cluster uncompressed.
pub trait Codec {
    fn init(&mut self) -> Result<()>;

    fn set_level(&mut self, _level: i32) -> Result<()> {
        Err(Error::InvalidArgument(
            "compression level is not supported by this algorithm".into(),
        ))
    }

    fn set_dict_size(&mut self, _size: u32) -> Result<()> {
        Err(Error::InvalidArgument(
            "dictionary size is not supported by this algorithm".into(),
        ))
    }

    fn compress_dest_size(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)>;

    fn exit(&mut self) {}
}

/// Shrink-and-retry harness for codecs without native destination-size
/// support: attempt ever smaller source prefixes (floored to `min_len`)
/// until the output fits.
fn fit_dest_size(
    src: &[u8],
    dst: &mut [u8],
    min_len: usize,
    mut attempt: impl FnMut(&[u8], &mut [u8]) -> Option<usize>,
) -> Result<(usize, usize)> {
    let mut len = src.len();
    loop {
        if let Some(written) = attempt(&src[..len], dst) {
            return Ok((written, len));
        }
        if len <= min_len {
            return Err(Error::CodecFailure(
                "output does not fit the destination cluster".into(),
            ));
        }
        len = (len / 2).max(min_len);
    }
}

#[derive(Clone, Debug)]
pub struct CompressorOption {
    pub algorithm: String,
    pub level: Option<i32>,
    pub dict_size: Option<u32>,
}

/// One configured compressor slot, addressable from hint files.
pub struct CompressorCfg {
    pub algorithm: Algorithm,
    pub codec: Box<dyn Codec>,
    /// Minimum compression ratio times 100; the default of 100 accepts any
    /// output not larger than its input.
    pub threshold: u32,
    pub dict_size: u32,
}

pub struct CompressContext {
    pub cfgs: Vec<CompressorCfg>,
    /// Bitmap of algorithm ids in use.
    pub available_algs: u16,
    pub lz4_max_distance: u16,
    /// Largest configured dictionary per algorithm id.
    max_dict_size: [u32; format::COMPRESSION_MAX as usize],
}

impl CompressContext {
    /// Initialise every configured codec.  Codec construction failures are
    /// fatal; per-cluster failures later are not.
    pub fn init(options: &[CompressorOption]) -> Result<CompressContext> {
        let mut ctx = CompressContext {
            cfgs: Vec::new(),
            available_algs: 0,
            lz4_max_distance: format::LZ4_MAX_DISTANCE_DEFAULT,
            max_dict_size: [0; format::COMPRESSION_MAX as usize],
        };

        for opt in options {
            let algorithm = Algorithm::from_name(&opt.algorithm)?;
            let mut codec: Box<dyn Codec> = match algorithm {
                Algorithm::Lz4 => Box::new(lz4::Lz4Codec::default()),
                Algorithm::Lzma => Box::new(lzma::LzmaCodec::default()),
                Algorithm::Deflate => Box::new(deflate::DeflateCodec::default()),
                Algorithm::Zstd => Box::new(zstd::ZstdCodec::default()),
            };
            if let Some(level) = opt.level {
                codec.set_level(level)?;
            }
            let mut dict_size = 0;
            if let Some(size) = opt.dict_size {
                codec.set_dict_size(size)?;
                dict_size = size;
            }
            codec.init()?;

            let id = algorithm.id() as usize;
            ctx.available_algs |= 1 << algorithm.id();
            ctx.max_dict_size[id] = ctx.max_dict_size[id].max(dict_size);
            debug!("compressor {algorithm:?} initialised (slot {})", ctx.cfgs.len());
            ctx.cfgs.push(CompressorCfg {
                algorithm,
                codec,
                threshold: 100,
                dict_size,
            });
        }
        Ok(ctx)
    }

    /// Whether the on-disk configuration table is needed: anything beyond
    /// plain LZ4 switches the superblock union to the algorithm bitmap.
    pub fn needs_compr_cfgs(&self) -> bool {
        self.available_algs != 0 && self.available_algs != 1 << COMPRESSION_LZ4
    }

    /// Serialise the configuration records in algorithm-id order, each
    /// prefixed with a 16-bit payload length.
    pub fn build_cfg_records(&self, max_pcluster_size: u32, blkszbits: u8) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        for id in 0..format::COMPRESSION_MAX {
            if self.available_algs & (1 << id) == 0 {
                continue;
            }
            let payload: Vec<u8> = match id {
                COMPRESSION_LZ4 => Lz4Cfg {
                    max_distance: self.lz4_max_distance.into(),
                    max_pcluster_blks: ((max_pcluster_size >> blkszbits) as u16).into(),
                    ..Default::default()
                }
                .as_bytes()
                .to_vec(),
                COMPRESSION_LZMA => LzmaCfg {
                    dict_size: self.max_dict_size[id as usize].into(),
                    ..Default::default()
                }
                .as_bytes()
                .to_vec(),
                COMPRESSION_DEFLATE => DeflateCfg {
                    window_bits: match self.max_dict_size[id as usize] {
                        0 => 15,
                        n => n.trailing_zeros() as u8,
                    },
                    ..Default::default()
                }
                .as_bytes()
                .to_vec(),
                COMPRESSION_ZSTD => ZstdCfg {
                    window_log: match self.max_dict_size[id as usize] {
                        0 => 0,
                        n => n.trailing_zeros().saturating_sub(10) as u8,
                    },
                    ..Default::default()
                }
                .as_bytes()
                .to_vec(),
                _ => continue,
            };
            let mut record = Vec::with_capacity(2 + payload.len());
            record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            record.extend_from_slice(&payload);
            records.push(record);
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_algorithm_names_and_ids() {
        assert_eq!(Algorithm::from_name("lz4").unwrap().id(), 0);
        assert_eq!(Algorithm::from_name("lzma").unwrap().id(), 1);
        assert_eq!(Algorithm::from_name("deflate").unwrap().id(), 2);
        assert_eq!(Algorithm::from_name("zstd").unwrap().id(), 3);
        assert!(matches!(
            Algorithm::from_name("lzo"),
            Err(Error::InvalidArgument(_))
        ));
    }

    fn opt(name: &str) -> CompressorOption {
        CompressorOption {
            algorithm: name.into(),
            level: None,
            dict_size: None,
        }
    }

    #[test]
    fn test_lz4_only_skips_cfg_table() {
        let ctx = CompressContext::init(&[opt("lz4")]).unwrap();
        assert_eq!(ctx.available_algs, 0b0001);
        assert!(!ctx.needs_compr_cfgs());
    }

    #[test]
    fn test_cfg_records_in_id_order() {
        let ctx = CompressContext::init(&[opt("zstd"), opt("lz4")]).unwrap();
        assert_eq!(ctx.available_algs, 0b1001);
        assert!(ctx.needs_compr_cfgs());

        let records = ctx.build_cfg_records(4096, 12);
        assert_eq!(records.len(), 2);
        // lz4 first: 14-byte payload, max_pcluster_blks == 1
        assert_eq!(&records[0][..2], &14u16.to_le_bytes());
        assert_eq!(&records[0][2..4], &format::LZ4_MAX_DISTANCE_DEFAULT.to_le_bytes());
        assert_eq!(&records[0][4..6], &1u16.to_le_bytes());
        // zstd second: 6-byte payload
        assert_eq!(&records[1][..2], &6u16.to_le_bytes());
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        // each codec must be able to compress a repetitive block into a
        // bounded destination and report full consumption
        let src = b"abcdabcdabcdabcd".repeat(256);
        for name in ["lz4", "deflate", "lzma", "zstd"] {
            let mut ctx = CompressContext::init(&[opt(name)]).unwrap();
            let mut dst = vec![0u8; 4096];
            let (written, consumed) = ctx.cfgs[0]
                .codec
                .compress_dest_size(&src, &mut dst)
                .unwrap();
            assert_eq!(consumed, src.len(), "{name} should consume all input");
            assert!(written < src.len(), "{name} should shrink the input");
        }
    }

    #[test]
    fn test_fit_dest_size_shrinks() {
        // an "incompressible" attempt that only fits half the input
        let src = [0u8; 100];
        let mut dst = [0u8; 50];
        let (written, consumed) =
            fit_dest_size(&src, &mut dst, 10, |s, d| {
                if s.len() <= d.len() {
                    Some(s.len())
                } else {
                    None
                }
            })
            .unwrap();
        assert_eq!(written, 50);
        assert_eq!(consumed, 50);
    }
}
