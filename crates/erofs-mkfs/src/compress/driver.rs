//! The per-file compression driver.
//!
//! A file moves through Scanning (tail hashing and fragment lookup),
//! Compressing (cluster loop), and Finalising (extent table emission);
//! the builder flushes the resulting metadata with the inode.  Clusters
//! that do not compress well enough are stored plain inside the same
//! extent stream, so a failing codec degrades the layout, never the build.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, trace};
use zerocopy::IntoBytes;

use super::{hints::HintMatch, CompressorCfg};
use crate::buffer::{BufType, BufferAllocator, HeadId};
use crate::device::Device;
use crate::error::Result;
use crate::format::{
    ExtentRecord, ZMapHeader, EXTENT_PLAIN, Z_ADVISE_BIG_PCLUSTER_1, Z_ADVISE_FRAGMENT_PCLUSTER,
};
use crate::fragments::{FragmentIndex, TOF_HASHLEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Scanning,
    Compressing,
    Finalising,
    Flushed,
}

/// Everything the builder needs to finish a compressed inode, or to undo
/// it when the extent table turns out not to fit inline.
pub struct CompressedFile {
    /// Total blocks holding compressed (or plain) cluster data.
    pub compressed_blocks: u32,
    /// Serialised `ZMapHeader` + extent records.
    pub meta: Box<[u8]>,
    pub fragment: Option<(u64, u64)>,
    /// Data heads in allocation order, for revocation on fallback.
    pub heads: Vec<HeadId>,
    /// Dedupe savings recorded for this file, forfeited on fallback.
    pub dedupe_saved: u64,
}

pub fn compress_file(
    balloc: &mut BufferAllocator,
    dev: &Device,
    cfg: &mut CompressorCfg,
    mut fragments: Option<&mut FragmentIndex>,
    file: &File,
    size: u64,
    hint: HintMatch,
    blkszbits: u8,
) -> Result<CompressedFile> {
    let blksz = 1u64 << blkszbits;
    let lcluster = blksz;
    let pcluster = hint.pcluster_blks as u64 * blksz;

    let mut state = State::Scanning;
    trace!("compress: {state:?} size {size}");

    let mut fragment = None;
    let mut dedupe_saved = 0;
    if let Some(frags) = fragments.as_deref_mut() {
        if let Some(crc) = FragmentIndex::tof_crc(file, size)? {
            let before = frags.saved_by_deduplication();
            if let Some(found) = frags.find(file, size, crc)? {
                fragment = Some(found);
                dedupe_saved = frags.saved_by_deduplication() - before;
            } else {
                let tail = size % lcluster;
                if tail > TOF_HASHLEN {
                    fragment = Some(frags.append_tail(file, size, tail)?);
                }
            }
        }
    }
    let body = size - fragment.map_or(0, |(_, len)| len);

    state = State::Compressing;
    trace!("compress: {state:?} body {body}");

    let mut extents: Vec<ExtentRecord> = Vec::new();
    let mut heads = Vec::new();
    let mut compressed_blocks = 0u32;
    // offer several clusters worth of input per destination-sized attempt,
    // so one pcluster can absorb more than its own size of source data
    let max_window = pcluster * 4;
    let mut src = vec![0u8; max_window as usize];
    let mut dst = vec![0u8; pcluster as usize];
    let mut pos = 0u64;

    while pos < body {
        let window = (body - pos).min(max_window) as usize;
        file.read_exact_at(&mut src[..window], pos)?;

        let accepted = match cfg.codec.compress_dest_size(&src[..window], &mut dst) {
            Ok((written, consumed)) if consumed > 0 => {
                let cb = (written as u64).div_ceil(blksz);
                let ub = (consumed as u64).div_ceil(blksz);
                // a cluster is kept compressed only when it saves whole
                // blocks and meets the configured ratio
                if cb < ub && written as u64 * 100 <= consumed as u64 * cfg.threshold as u64 {
                    Some((written, consumed))
                } else {
                    None
                }
            }
            _ => None,
        };

        match accepted {
            Some((written, consumed)) => {
                let cb = (written as u64).div_ceil(blksz) as u32;
                let head = balloc.alloc(BufType::Data, cb as u64 * blksz, 0, 0)?;
                let addr = balloc.map_bh(Some(balloc.block_of(head)));
                let at = (addr as u64) << blkszbits;
                dev.pwrite(&dst[..written], at)?;
                dev.fill_zero(at + written as u64, cb as u64 * blksz - written as u64)?;
                extents.push(ExtentRecord {
                    compressed_blocks: cb.into(),
                    uncompressed_len: (consumed as u32).into(),
                    blk_addr: addr.into(),
                    flags: 0.into(),
                    reserved: 0.into(),
                });
                trace!("  extent {consumed} -> {written} bytes @{addr}");
                compressed_blocks += cb;
                heads.push(head);
                pos += consumed as u64;
            }
            None => {
                let ulen = (body - pos).min(lcluster);
                let head = balloc.alloc(BufType::Data, blksz, 0, 0)?;
                let addr = balloc.map_bh(Some(balloc.block_of(head)));
                let at = (addr as u64) << blkszbits;
                dev.pwrite(&src[..ulen as usize], at)?;
                dev.fill_zero(at + ulen, blksz - ulen)?;
                extents.push(ExtentRecord {
                    compressed_blocks: 1.into(),
                    uncompressed_len: (ulen as u32).into(),
                    blk_addr: addr.into(),
                    flags: EXTENT_PLAIN.into(),
                    reserved: 0.into(),
                });
                trace!("  plain extent {ulen} bytes @{addr}");
                compressed_blocks += 1;
                heads.push(head);
                pos += ulen;
            }
        }
    }

    state = State::Finalising;
    trace!("compress: {state:?} {} extents", extents.len());

    let mut advise = 0u16;
    if hint.pcluster_blks > 1 {
        advise |= Z_ADVISE_BIG_PCLUSTER_1;
    }
    if fragment.is_some() {
        advise |= Z_ADVISE_FRAGMENT_PCLUSTER;
    }
    let (fragment_off, fragment_size) = fragment.unwrap_or((0, 0));
    let mut meta = Vec::new();
    meta.extend_from_slice(
        ZMapHeader {
            fragment_off: fragment_off.into(),
            fragment_size: (fragment_size as u32).into(),
            advise: advise.into(),
            algorithm: cfg.algorithm.id(),
            cluster_bits: blkszbits,
        }
        .as_bytes(),
    );
    for extent in &extents {
        meta.extend_from_slice(extent.as_bytes());
    }

    state = State::Flushed;
    debug!(
        "compressed file: {size} bytes, {compressed_blocks} blocks, {} extents, fragment {fragment_size} ({state:?})",
        extents.len()
    );

    Ok(CompressedFile {
        compressed_blocks,
        meta: meta.into_boxed_slice(),
        fragment,
        heads,
        dedupe_saved,
    })
}

/// Undo a compressed emission whose metadata cannot fit inline: give the
/// data blocks back to the allocator (newest first, so the tail address
/// rewinds) and forfeit any recorded dedupe savings.
pub fn revoke(
    balloc: &mut BufferAllocator,
    dev: &Device,
    fragments: Option<&mut FragmentIndex>,
    compressed: CompressedFile,
) -> Result<()> {
    for head in compressed.heads.into_iter().rev() {
        balloc.drop_head(dev, head, true)?;
    }
    if let Some(frags) = fragments {
        frags.forfeit_saved(compressed.dedupe_saved);
    }
    debug!("compressed layout revoked, falling back to flat");
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use std::io::Write;

    use super::*;
    use crate::compress::{CompressContext, CompressorOption};
    use crate::format::{Z_MAP_HEADER_SIZE, EXTENT_RECORD_SIZE};
    use zerocopy::FromBytes;

    fn lz4_ctx() -> CompressContext {
        CompressContext::init(&[CompressorOption {
            algorithm: "lz4".into(),
            level: None,
            dict_size: None,
        }])
        .unwrap()
    }

    fn tmp_file(content: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f
    }

    #[test]
    fn test_extents_cover_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::open(&dir.path().join("img"), 12, false).unwrap();
        let mut balloc = BufferAllocator::new(12, 0);
        let mut ctx = lz4_ctx();

        let content = b"compressible line\n".repeat(1000); // 18000 bytes
        let file = tmp_file(&content);
        let result = compress_file(
            &mut balloc,
            &dev,
            &mut ctx.cfgs[0],
            None,
            &file,
            content.len() as u64,
            HintMatch {
                pcluster_blks: 1,
                slot: 0,
            },
            12,
        )
        .unwrap();

        let extents = &result.meta[Z_MAP_HEADER_SIZE..];
        assert_eq!(extents.len() % EXTENT_RECORD_SIZE, 0);
        let mut covered = 0u64;
        for chunk in extents.chunks(EXTENT_RECORD_SIZE) {
            let rec = ExtentRecord::read_from_bytes(chunk).unwrap();
            covered += rec.uncompressed_len.get() as u64;
        }
        assert_eq!(covered, content.len() as u64);
        assert!(result.compressed_blocks > 0);
        assert!((result.compressed_blocks as usize) < content.len() / 4096 + 1);
    }

    #[test]
    fn test_fragmented_tail_excluded_from_extents() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::open(&dir.path().join("img"), 12, false).unwrap();
        let mut balloc = BufferAllocator::new(12, 0);
        let mut ctx = lz4_ctx();
        let mut frags = FragmentIndex::new().unwrap();

        // 1 KiB file: the whole payload is a sub-block tail
        let content = vec![0x42u8; 1024];
        let file = tmp_file(&content);
        let result = compress_file(
            &mut balloc,
            &dev,
            &mut ctx.cfgs[0],
            Some(&mut frags),
            &file,
            1024,
            HintMatch {
                pcluster_blks: 1,
                slot: 0,
            },
            12,
        )
        .unwrap();

        assert_eq!(result.fragment, Some((0, 1024)));
        assert_eq!(result.compressed_blocks, 0);
        assert_eq!(result.meta.len(), Z_MAP_HEADER_SIZE);
        let header = ZMapHeader::read_from_bytes(&result.meta[..]).unwrap();
        assert_ne!(header.advise.get() & Z_ADVISE_FRAGMENT_PCLUSTER, 0);
        assert_eq!(header.fragment_size.get(), 1024);
    }

    #[test]
    fn test_revoke_rewinds_allocator() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::open(&dir.path().join("img"), 12, false).unwrap();
        let mut balloc = BufferAllocator::new(12, 0);
        let mut ctx = lz4_ctx();

        let content = b"x".repeat(20000);
        let file = tmp_file(&content);
        let result = compress_file(
            &mut balloc,
            &dev,
            &mut ctx.cfgs[0],
            None,
            &file,
            content.len() as u64,
            HintMatch {
                pcluster_blks: 1,
                slot: 0,
            },
            12,
        )
        .unwrap();
        assert!(balloc.tail_blk_addr() > 0);
        revoke(&mut balloc, &dev, None, result).unwrap();
        assert_eq!(balloc.tail_blk_addr(), 0);
    }
}
