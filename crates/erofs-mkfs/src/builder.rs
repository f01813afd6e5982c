//! Top-level image assembly.
//!
//! The build runs the fixed sequence: open the device, reserve the
//! superblock, initialise compression and emit its configuration records,
//! walk the source tree creating inodes with their data, finalise the
//! packed inode, then write the superblock, flush every buffer, truncate
//! the image and patch in the checksum.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use zerocopy::IntoBytes;

use crate::buffer::{BufType, BufferAllocator, FlushOp, HeadId};
use crate::checksum::{crc32c, sb_checksum_len};
use crate::compress::{
    driver::{self, CompressedFile},
    hints::CompressHints,
    CompressContext, CompressorOption,
};
use crate::device::Device;
use crate::dirent::{self, DirLayout, Dirent};
use crate::error::{Error, Result};
use crate::format::{
    encode_dev, DataLayout, DeviceSlot, FileType, InodeU, Superblock, DEVT_SLOT_SIZE,
    EXTENDED_INODE_SIZE, FEATURE_COMPAT_MTIME, FEATURE_COMPAT_SB_CHKSUM,
    FEATURE_COMPAT_XATTR_FILTER, FEATURE_INCOMPAT_BIG_PCLUSTER, FEATURE_INCOMPAT_COMPR_CFGS,
    FEATURE_INCOMPAT_DEVICE_TABLE, FEATURE_INCOMPAT_FRAGMENTS, FEATURE_INCOMPAT_ZERO_PADDING,
    ISLOTBITS, MAX_BLKSZBITS, MIN_BLKSZBITS, PCLUSTER_MAX_SIZE, SUPER_END, SUPER_MAGIC_V1,
    SUPER_OFFSET, S_IFREG,
};
use crate::fragments::FragmentIndex;
use crate::inode::Inode;
use crate::source::{NodeKind, NodeStat, SourceTree};
use crate::xattr::XAttr;

#[derive(Clone, Debug)]
pub struct ExtraDevice {
    pub tag: String,
    pub blocks: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub image_path: PathBuf,
    pub source_path: PathBuf,
    pub blkszbits: u8,
    pub fixed_uuid: Option<[u8; 16]>,
    pub volume_label: Option<String>,
    pub fixed_timestamp: Option<i64>,
    pub ignore_mtime: bool,
    pub compression: Vec<CompressorOption>,
    pub hints_file: Option<PathBuf>,
    pub fragments: bool,
    /// Largest physical cluster size in bytes; 0 selects the block size.
    pub max_pcluster_size: u32,
    pub force_uid: Option<u32>,
    pub force_gid: Option<u32>,
    pub uid_offset: i64,
    pub gid_offset: i64,
    pub extra_devices: Vec<ExtraDevice>,
    pub incremental: bool,
}

impl Config {
    pub fn new(source_path: impl Into<PathBuf>, image_path: impl Into<PathBuf>) -> Config {
        Config {
            image_path: image_path.into(),
            source_path: source_path.into(),
            blkszbits: MAX_BLKSZBITS,
            fixed_uuid: None,
            volume_label: None,
            fixed_timestamp: None,
            ignore_mtime: false,
            compression: Vec::new(),
            hints_file: None,
            fragments: false,
            max_pcluster_size: 0,
            force_uid: None,
            force_gid: None,
            uid_offset: 0,
            gid_offset: 0,
            extra_devices: Vec::new(),
            incremental: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_BLKSZBITS..=MAX_BLKSZBITS).contains(&self.blkszbits) {
            return Error::invalid(format!(
                "block size bits {} out of range {MIN_BLKSZBITS}..={MAX_BLKSZBITS}",
                self.blkszbits
            ));
        }
        if let Some(label) = &self.volume_label {
            if label.len() > 16 {
                return Error::invalid(format!("volume label {label:?} exceeds 16 bytes"));
            }
        }
        let blksz = 1u32 << self.blkszbits;
        if self.max_pcluster_size != 0 {
            if self.max_pcluster_size > PCLUSTER_MAX_SIZE {
                return Err(Error::UnsupportedFeature(format!(
                    "pclustersize {} exceeds {PCLUSTER_MAX_SIZE}",
                    self.max_pcluster_size
                )));
            }
            if self.max_pcluster_size % blksz != 0 {
                return Error::invalid(format!(
                    "pclustersize {} is not a multiple of the block size",
                    self.max_pcluster_size
                ));
            }
        }
        if self.hints_file.is_some() && self.compression.is_empty() {
            return Error::invalid("a compression hints file needs a configured compressor");
        }
        for dev in &self.extra_devices {
            if dev.tag.len() > 64 {
                return Error::invalid(format!("device tag {:?} exceeds 64 bytes", dev.tag));
            }
        }
        Ok(())
    }
}

/// Translate a block size in bytes to `blkszbits`, rejecting sizes outside
/// 512..=4096 or not a power of two.
pub fn block_size_bits(block_size: u32) -> Result<u8> {
    if !block_size.is_power_of_two()
        || block_size < (1 << MIN_BLKSZBITS)
        || block_size > (1 << MAX_BLKSZBITS)
    {
        return Error::invalid(format!(
            "invalid block size {block_size}: must be a power of two between {} and {}",
            1u32 << MIN_BLKSZBITS,
            1u32 << MAX_BLKSZBITS
        ));
    }
    Ok(block_size.trailing_zeros() as u8)
}

#[derive(Clone, Debug)]
pub struct BuildSummary {
    pub total_blocks: u32,
    pub inodes: u64,
    pub saved_by_deduplication: u64,
    pub compressed_files: u64,
    pub uncompressed_files: u64,
    pub uuid: [u8; 16],
    pub checksum: Option<u32>,
}

struct DirAux {
    entries: Vec<Dirent>,
    layout: DirLayout,
    blocks_head: Option<HeadId>,
    /// Tail block when the inline tail did not fit next to the inode.
    spill_head: Option<HeadId>,
}

pub fn build(cfg: &Config) -> Result<BuildSummary> {
    cfg.validate()?;
    let blkszbits = cfg.blkszbits;
    let blksz = 1u64 << blkszbits;

    let dev = Device::open(&cfg.image_path, blkszbits, cfg.incremental)?;
    let mut balloc = BufferAllocator::new(blkszbits, 0);

    // reserve the superblock: a skip-write head pinned to block 0
    let sb_bh = balloc.alloc(BufType::Meta, 0, 0, 0)?;
    balloc.set_op(sb_bh, FlushOp::SkipWrite);
    balloc.balloon(sb_bh, SUPER_END)?;
    balloc.map_bh(Some(balloc.block_of(sb_bh)));
    if balloc.tell(sb_bh, false) != Some(0) {
        return Err(Error::Corrupt("failed to pin the superblock at offset 0".into()));
    }

    let (build_time, build_time_nsec) = match cfg.fixed_timestamp {
        Some(ts) => (ts.max(0) as u64, 0u32),
        None => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|_| Error::Corrupt("system clock before the epoch".into()))?;
            (now.as_secs(), now.subsec_nanos())
        }
    };
    let uuid = cfg
        .fixed_uuid
        .unwrap_or_else(|| uuid::Uuid::new_v4().into_bytes());
    let mut volume_name = [0u8; 16];
    if let Some(label) = &cfg.volume_label {
        volume_name[..label.len()].copy_from_slice(label.as_bytes());
    }

    let feature_compat =
        FEATURE_COMPAT_SB_CHKSUM | FEATURE_COMPAT_MTIME | FEATURE_COMPAT_XATTR_FILTER;
    let mut feature_incompat = 0u32;

    // compression setup and the per-algorithm configuration table
    let mut cctx = CompressContext::init(&cfg.compression)?;
    let compression_on = !cctx.cfgs.is_empty();
    let mut max_pcluster = if cfg.max_pcluster_size != 0 {
        cfg.max_pcluster_size
    } else {
        blksz as u32
    };
    let hints = match &cfg.hints_file {
        Some(path) => {
            let (hints, hinted_max) = CompressHints::load(path, blksz as u32, cctx.cfgs.len())?;
            if hinted_max > PCLUSTER_MAX_SIZE {
                return Err(Error::UnsupportedFeature(format!(
                    "hinted pclustersize {hinted_max} exceeds {PCLUSTER_MAX_SIZE}"
                )));
            }
            max_pcluster = max_pcluster.max(hinted_max);
            hints
        }
        None => CompressHints::all_files(max_pcluster >> blkszbits),
    };
    if compression_on {
        feature_incompat |= FEATURE_INCOMPAT_ZERO_PADDING;
        if cctx.needs_compr_cfgs() {
            feature_incompat |= FEATURE_INCOMPAT_COMPR_CFGS;
        }
        if max_pcluster > blksz as u32 {
            feature_incompat |= FEATURE_INCOMPAT_BIG_PCLUSTER;
        }
    }

    let mut last_sb_head = sb_bh;
    if compression_on && cctx.needs_compr_cfgs() {
        for record in cctx.build_cfg_records(max_pcluster, blkszbits) {
            let head = balloc.attach(last_sb_head, BufType::Meta, record.len() as u64)?;
            balloc.set_op(head, FlushOp::Write(record.into_boxed_slice()));
            last_sb_head = head;
        }
    }

    let mut extra_devices = 0u16;
    let mut devt_slotoff = 0u16;
    if !cfg.extra_devices.is_empty() {
        feature_incompat |= FEATURE_INCOMPAT_DEVICE_TABLE;
        let mut table = Vec::with_capacity(cfg.extra_devices.len() * DEVT_SLOT_SIZE);
        for extra in &cfg.extra_devices {
            let mut slot = DeviceSlot {
                blocks: extra.blocks.into(),
                ..Default::default()
            };
            slot.tag[..extra.tag.len()].copy_from_slice(extra.tag.as_bytes());
            table.extend_from_slice(slot.as_bytes());
        }
        let head = balloc.attach(last_sb_head, BufType::Devt, table.len() as u64)?;
        let pos = balloc
            .tell(head, false)
            .ok_or_else(|| Error::Corrupt("device table attached to an unmapped block".into()))?;
        devt_slotoff = (pos / DEVT_SLOT_SIZE as u64) as u16;
        extra_devices = cfg.extra_devices.len() as u16;
        balloc.set_op(head, FlushOp::Write(table.into_boxed_slice()));
    }

    // flush all non-superblock buffers (nothing yet; keeps step order)
    balloc.flush(&dev, Some(balloc.block_of(sb_bh)))?;

    let mut fragments = if cfg.fragments {
        Some(FragmentIndex::new()?)
    } else {
        None
    };

    // the source tree, in the walk order that fixes inode numbering
    let tree = SourceTree::scan(&cfg.source_path)?;
    let order = tree.walk_order();
    let parent_of = parents(&tree);
    let nlink_of = link_counts(&tree);

    let mut inodes: Vec<Inode> = Vec::new();
    let mut auxes: Vec<Option<DirAux>> = Vec::new();
    let mut inode_of_node: Vec<Option<usize>> = vec![None; tree.nodes.len()];
    let mut meta_anchor: Option<HeadId> = None;
    let mut compressed_files = 0u64;
    let mut uncompressed_files = 0u64;

    for &idx in &order {
        let node = &tree.nodes[idx];
        let mut inode = Inode::new((inodes.len() + 1) as u32);
        inode.mode = node.stat.mode;
        let (uid, gid) = apply_id_overrides(cfg, &node.stat)?;
        inode.uid = uid;
        inode.gid = gid;
        if cfg.fixed_timestamp.is_some() {
            inode.mtime = build_time;
            inode.mtime_nsec = build_time_nsec;
        } else {
            inode.mtime = node.stat.mtime.max(0) as u64;
            inode.mtime_nsec = node.stat.mtime_nsec;
        }
        inode.nlink = nlink_of[idx];
        inode.xattrs = node.xattrs.iter().map(|(k, v)| XAttr::new(k, v)).collect();

        let mut aux = None;
        match &node.kind {
            NodeKind::Directory { children } => {
                let mut entries = Vec::with_capacity(children.len() + 2);
                for &child in children {
                    let child_node = &tree.nodes[child];
                    dirent::insert_sorted(
                        &mut entries,
                        Dirent {
                            name: child_node.name.as_encoded_bytes().into(),
                            file_type: FileType::from_mode(child_node.stat.mode),
                            node: child,
                        },
                    );
                }
                dirent::insert_sorted(
                    &mut entries,
                    Dirent {
                        name: b".".as_slice().into(),
                        file_type: FileType::Directory,
                        node: idx,
                    },
                );
                dirent::insert_sorted(
                    &mut entries,
                    Dirent {
                        name: b"..".as_slice().into(),
                        file_type: FileType::Directory,
                        node: parent_of[idx],
                    },
                );

                let layout = dirent::plan(&entries, blksz);
                inode.size = layout.size;
                let mut blocks_head = None;
                if !layout.blocks.is_empty() {
                    let head =
                        balloc.alloc(BufType::Dira, layout.blocks.len() as u64 * blksz, 0, 0)?;
                    let addr = balloc.map_bh(Some(balloc.block_of(head)));
                    inode.u = InodeU::RawBlkAddr(Some(addr));
                    blocks_head = Some(head);
                }
                inode.layout = if layout.tail_size > 0 {
                    DataLayout::FlatInline
                } else {
                    DataLayout::FlatPlain
                };
                aux = Some(DirAux {
                    entries,
                    layout,
                    blocks_head,
                    spill_head: None,
                });
            }
            NodeKind::Regular => {
                let size = node.stat.size;
                inode.size = size;
                if size > 0 {
                    let file = File::open(&node.path)?;
                    let mut flat = true;
                    if compression_on {
                        if let Some(hint) = hints.apply(&node.rel_path) {
                            let compressed = driver::compress_file(
                                &mut balloc,
                                &dev,
                                &mut cctx.cfgs[hint.slot],
                                fragments.as_mut(),
                                &file,
                                size,
                                hint,
                                blkszbits,
                            )?;
                            if inline_meta_fits(&inode, &compressed, blksz) {
                                let CompressedFile {
                                    compressed_blocks,
                                    meta,
                                    ..
                                } = compressed;
                                inode.layout = DataLayout::CompressedFull;
                                inode.u = InodeU::CompressedBlocks(compressed_blocks);
                                inode.compress_meta = Some(meta);
                                compressed_files += 1;
                                flat = false;
                            } else {
                                driver::revoke(&mut balloc, &dev, fragments.as_mut(), compressed)?;
                            }
                        }
                    }
                    if flat {
                        write_flat_data(&mut balloc, &dev, &file, size, blkszbits, &mut inode)?;
                        uncompressed_files += 1;
                    }
                } else {
                    uncompressed_files += 1;
                }
            }
            NodeKind::Symlink { target } => {
                inode.size = target.len() as u64;
                inode.idata = target.clone();
                inode.layout = DataLayout::FlatInline;
            }
            NodeKind::CharacterDevice | NodeKind::BlockDevice => {
                inode.u = InodeU::Rdev(encode_dev(node.stat.rdev));
            }
            NodeKind::Fifo | NodeKind::Socket => {
                inode.u = InodeU::Rdev(0);
            }
            NodeKind::Hardlink { .. } => {
                continue; // never in the walk order
            }
        }

        inode.decide_extended(build_time, build_time_nsec, cfg.ignore_mtime);
        alloc_inode_head(&mut balloc, &dev, &mut inode, aux.as_mut(), blkszbits)?;
        if meta_anchor.is_none() {
            meta_anchor = inode.bh;
        }
        inode_of_node[idx] = Some(inodes.len());
        inodes.push(inode);
        auxes.push(aux);
    }

    // the packed inode holds every collected tail fragment; its nid is
    // assigned last
    let mut packed_index = None;
    if let Some(frags) = fragments.as_ref() {
        if frags.packed_len() > 0 {
            feature_incompat |= FEATURE_INCOMPAT_FRAGMENTS;
            let mut inode = Inode::new((inodes.len() + 1) as u32);
            inode.mode = (S_IFREG | 0o600) as u32;
            inode.nlink = 0;
            inode.mtime = build_time;
            inode.mtime_nsec = build_time_nsec;
            inode.is_packed = true;
            inode.size = frags.packed_len();
            write_flat_data(&mut balloc, &dev, frags.packed_file(), inode.size, blkszbits, &mut inode)?;
            inode.decide_extended(build_time, build_time_nsec, cfg.ignore_mtime);
            alloc_inode_head(&mut balloc, &dev, &mut inode, None, blkszbits)?;
            if meta_anchor.is_none() {
                meta_anchor = inode.bh;
            }
            packed_index = Some(inodes.len());
            inodes.push(inode);
            auxes.push(None);
        }
    }

    // assign block addresses and derive every nid
    let total_blocks = balloc.map_bh(None);
    let anchor = meta_anchor.ok_or_else(|| Error::Corrupt("no inodes were produced".into()))?;
    let meta_base = balloc
        .tell(anchor, false)
        .ok_or_else(|| Error::Corrupt("metadata anchor left unmapped".into()))?;
    if meta_base % blksz != 0 {
        return Err(Error::Corrupt("metadata region is not block-aligned".into()));
    }
    let meta_blkaddr = (meta_base >> blkszbits) as u32;

    for inode in &mut inodes {
        let bh = inode
            .bh
            .ok_or_else(|| Error::Corrupt("inode without a buffer head".into()))?;
        let pos = balloc
            .tell(bh, false)
            .ok_or_else(|| Error::Corrupt("inode head left unmapped".into()))?;
        inode.nid = (pos - meta_base) >> ISLOTBITS;
    }

    let root_index = inode_of_node[tree.root]
        .ok_or_else(|| Error::Corrupt("root directory has no inode".into()))?;
    let root_nid = inodes[root_index].nid;
    if root_nid > u16::MAX as u64 {
        return Err(Error::UnsupportedFeature(format!(
            "root nid {root_nid} does not fit the superblock field"
        )));
    }
    let packed_nid = packed_index.map(|i| inodes[i].nid);

    // nid per tree node, hardlinks resolved to their first occurrence
    let mut nid_of_node = vec![0u64; tree.nodes.len()];
    for (idx, node) in tree.nodes.iter().enumerate() {
        let target = match node.kind {
            NodeKind::Hardlink { original } => original,
            _ => idx,
        };
        if let Some(inode_idx) = inode_of_node[target] {
            nid_of_node[idx] = inodes[inode_idx].nid;
        }
    }

    // fill every pending payload now that addresses are settled
    for (i, inode) in inodes.iter().enumerate() {
        if let Some(aux) = &auxes[i] {
            let mut cursor = 0usize;
            if let Some(head) = aux.blocks_head {
                let mut payload = Vec::with_capacity(aux.layout.blocks.len() * blksz as usize);
                for &count in &aux.layout.blocks {
                    let group = &aux.entries[cursor..cursor + count];
                    cursor += count;
                    let mut block = dirent::encode_block(group, |node| nid_of_node[node]);
                    block.resize(blksz as usize, 0);
                    payload.extend_from_slice(&block);
                }
                balloc.set_op(head, FlushOp::Write(payload.into_boxed_slice()));
            } else {
                cursor = aux.layout.blocks.iter().sum();
            }
            if aux.layout.tail_size > 0 {
                let tail = dirent::encode_block(&aux.entries[cursor..], |node| nid_of_node[node]);
                match (inode.inline_bh, aux.spill_head) {
                    (Some(inline), _) => {
                        balloc.set_op(inline, FlushOp::Write(tail.into_boxed_slice()))
                    }
                    (None, Some(spill)) => {
                        let mut block = tail;
                        block.resize(blksz as usize, 0);
                        balloc.set_op(spill, FlushOp::Write(block.into_boxed_slice()));
                    }
                    (None, None) => {
                        return Err(Error::Corrupt("directory tail has nowhere to go".into()))
                    }
                }
            }
        } else if let Some(inline) = inode.inline_bh {
            balloc.set_op(inline, FlushOp::Write(inode.idata.clone()));
        }

        let bh = inode
            .bh
            .ok_or_else(|| Error::Corrupt("inode without a buffer head".into()))?;
        balloc.set_op(bh, FlushOp::Write(inode.encode().into_boxed_slice()));
    }

    let inos = inodes.len() as u64;
    let compr_info = if feature_incompat & FEATURE_INCOMPAT_COMPR_CFGS != 0 {
        cctx.available_algs
    } else if compression_on {
        cctx.lz4_max_distance
    } else {
        0
    };

    // serialise the superblock; the checksum compat bit is withheld until
    // the post-flush patch pass
    let sb = Superblock {
        magic: SUPER_MAGIC_V1.into(),
        checksum: 0.into(),
        feature_compat: (feature_compat & !FEATURE_COMPAT_SB_CHKSUM).into(),
        blkszbits,
        sb_extslots: 0,
        root_nid: (root_nid as u16).into(),
        inos: inos.into(),
        build_time: build_time.into(),
        build_time_nsec: build_time_nsec.into(),
        blocks: total_blocks.into(),
        meta_blkaddr: meta_blkaddr.into(),
        xattr_blkaddr: 0.into(),
        uuid,
        volume_name,
        feature_incompat: feature_incompat.into(),
        compr_info: compr_info.into(),
        extra_devices: extra_devices.into(),
        devt_slotoff: devt_slotoff.into(),
        dirblkbits: blkszbits,
        xattr_prefix_count: 0,
        xattr_prefix_start: 0.into(),
        packed_nid: packed_nid.unwrap_or(0).into(),
        xattr_filter_reserved: 0,
        reserved2: [0; 23],
    };
    let mut sb_buf = vec![0u8; (SUPER_END as usize).next_multiple_of(blksz as usize)];
    sb_buf[SUPER_OFFSET as usize..SUPER_END as usize].copy_from_slice(sb.as_bytes());
    dev.pwrite(&sb_buf[..SUPER_END as usize], 0)?;
    balloc.drop_head(&dev, sb_bh, false)?;

    balloc.flush(&dev, None)?;
    dev.truncate(total_blocks as u64 * blksz)?;
    debug!("{} metadata blocks flushed", balloc.meta_blk_cnt());

    let checksum = if feature_compat & FEATURE_COMPAT_SB_CHKSUM != 0 {
        Some(enable_sb_checksum(&dev, blksz as u32)?)
    } else {
        None
    };

    let saved_by_deduplication = fragments
        .as_ref()
        .map_or(0, |f| f.saved_by_deduplication());
    info!(
        "built image: {total_blocks} blocks, {inos} inodes, {compressed_files} compressed and {uncompressed_files} uncompressed files, {saved_by_deduplication} bytes deduplicated"
    );
    Ok(BuildSummary {
        total_blocks,
        inodes: inos,
        saved_by_deduplication,
        compressed_files,
        uncompressed_files,
        uuid,
        checksum,
    })
}

fn parents(tree: &SourceTree) -> Vec<usize> {
    let mut parent_of: Vec<usize> = (0..tree.nodes.len()).collect();
    for (idx, node) in tree.nodes.iter().enumerate() {
        if let NodeKind::Directory { children } = &node.kind {
            for &child in children {
                parent_of[child] = idx;
            }
        }
    }
    parent_of[tree.root] = tree.root;
    parent_of
}

fn link_counts(tree: &SourceTree) -> Vec<u32> {
    let mut nlink = vec![1u32; tree.nodes.len()];
    for (idx, node) in tree.nodes.iter().enumerate() {
        if let NodeKind::Directory { children } = &node.kind {
            let subdirs = children
                .iter()
                .filter(|&&c| matches!(tree.nodes[c].kind, NodeKind::Directory { .. }))
                .count();
            nlink[idx] = 2 + subdirs as u32;
        }
    }
    for node in &tree.nodes {
        if let NodeKind::Hardlink { original } = node.kind {
            nlink[original] += 1;
        }
    }
    nlink
}

fn apply_id_overrides(cfg: &Config, stat: &NodeStat) -> Result<(u32, u32)> {
    let uid = cfg.force_uid.unwrap_or(stat.uid) as i64 + cfg.uid_offset;
    let gid = cfg.force_gid.unwrap_or(stat.gid) as i64 + cfg.gid_offset;
    let uid = u32::try_from(uid)
        .map_err(|_| Error::InvalidArgument(format!("uid {uid} out of range")))?;
    let gid = u32::try_from(gid)
        .map_err(|_| Error::InvalidArgument(format!("gid {gid} out of range")))?;
    Ok((uid, gid))
}

/// A compressed inode's header, xattrs and extent table must share one
/// block; the check uses the extended header size since compression
/// metadata usually forces it anyway.
fn inline_meta_fits(inode: &Inode, compressed: &CompressedFile, blksz: u64) -> bool {
    (EXTENDED_INODE_SIZE + inode.xattr_isize() + compressed.meta.len()) as u64 <= blksz
}

/// Store a file's payload flat: whole blocks copied to a DATA run, the
/// remainder carried inline with the inode.
fn write_flat_data(
    balloc: &mut BufferAllocator,
    dev: &Device,
    file: &File,
    size: u64,
    blkszbits: u8,
    inode: &mut Inode,
) -> Result<()> {
    let blksz = 1u64 << blkszbits;
    let nblocks = size >> blkszbits;
    let tail = size - nblocks * blksz;

    if nblocks > 0 {
        let head = balloc.alloc(BufType::Data, nblocks * blksz, 0, 0)?;
        let addr = balloc.map_bh(Some(balloc.block_of(head)));
        dev.copy_from(file, 0, (addr as u64) << blkszbits, nblocks * blksz)?;
        inode.u = InodeU::RawBlkAddr(Some(addr));
    }
    if tail > 0 {
        let mut idata = vec![0u8; tail as usize];
        file.read_exact_at(&mut idata, nblocks * blksz)?;
        inode.idata = idata.into_boxed_slice();
        inode.layout = DataLayout::FlatInline;
    } else {
        inode.layout = DataLayout::FlatPlain;
    }
    Ok(())
}

/// Allocate the inode's buffer head, attaching the inline tail when it
/// fits.  On `NoSpace` the tail spills into a block of its own and the
/// inode falls back to the plain flat layout.
fn alloc_inode_head(
    balloc: &mut BufferAllocator,
    dev: &Device,
    inode: &mut Inode,
    aux: Option<&mut DirAux>,
    blkszbits: u8,
) -> Result<()> {
    let blksz = 1u64 << blkszbits;
    let meta_isize = inode.meta_isize() as u64;
    let idata_len = match &aux {
        Some(aux) => aux.layout.tail_size,
        None => inode.idata.len() as u64,
    };

    match balloc.alloc(BufType::Inode, meta_isize, 0, idata_len as u32) {
        Ok(bh) => {
            inode.bh = Some(bh);
            if idata_len > 0 {
                inode.inline_bh = Some(balloc.attach(bh, BufType::Meta, idata_len)?);
            }
            Ok(())
        }
        Err(Error::NoSpace(_)) => {
            debug!("inline tail of {idata_len} bytes spills to its own block");
            match aux {
                Some(aux) => {
                    let head = balloc.alloc(BufType::Dira, blksz, 0, 0)?;
                    let addr = balloc.map_bh(Some(balloc.block_of(head)));
                    if aux.blocks_head.is_none() {
                        inode.u = InodeU::RawBlkAddr(Some(addr));
                    }
                    aux.spill_head = Some(head);
                }
                None => {
                    let head = balloc.alloc(BufType::Data, blksz, 0, 0)?;
                    let addr = balloc.map_bh(Some(balloc.block_of(head)));
                    let at = (addr as u64) << blkszbits;
                    dev.pwrite(&inode.idata, at)?;
                    dev.fill_zero(at + inode.idata.len() as u64, blksz - inode.idata.len() as u64)?;
                    if inode.u == InodeU::RawBlkAddr(None) {
                        inode.u = InodeU::RawBlkAddr(Some(addr));
                    }
                    inode.idata = Box::default();
                }
            }
            inode.layout = DataLayout::FlatPlain;
            inode.bh = Some(balloc.alloc(BufType::Inode, meta_isize, 0, 0)?);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Read back block 0, verify the magic, set the checksum compat bit and
/// patch the CRC32C over the defined window.
fn enable_sb_checksum(dev: &Device, block_size: u32) -> Result<u32> {
    let len = sb_checksum_len(block_size) as usize;
    let mut buf = vec![0u8; len];
    dev.pread(&mut buf, SUPER_OFFSET)?;

    if buf[0..4] != SUPER_MAGIC_V1.to_le_bytes() {
        return Err(Error::Corrupt(format!(
            "superblock magic mismatch: {:02x?}",
            &buf[0..4]
        )));
    }

    let mut feature_compat = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    feature_compat |= FEATURE_COMPAT_SB_CHKSUM;
    buf[8..12].copy_from_slice(&feature_compat.to_le_bytes());
    buf[4..8].fill(0);

    let crc = crc32c(!0, &buf);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    dev.pwrite(&buf, SUPER_OFFSET)?;
    debug!("superblock checksum 0x{crc:08x} written");
    Ok(crc)
}
