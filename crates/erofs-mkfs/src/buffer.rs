//! The buffer/block allocator.
//!
//! Every byte that reaches a defined position in the output image goes
//! through this arena.  It hands out variable-length slices of
//! not-yet-assigned disk blocks, packs small metadata records into shared
//! blocks, assigns block addresses lazily, and flushes blocks to the device
//! in address order with zero padding up to each block boundary.
//!
//! Blocks and heads are addressed by small integer handles into two slabs;
//! a block keeps the ordered list of its head handles.

use std::cmp::Ordering;

use log::trace;

use crate::device::Device;
use crate::error::{Error, Result};

/// Allocation type of a buffer head.  The type picks the alignment of the
/// head inside its block and the class of block it may share with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufType {
    Data,
    Meta,
    Inode,
    Dira,
    Xattr,
    Devt,
}

/// Blocks are shared only between heads of the same class: file payload
/// lives in `Data` blocks, all metadata types collapse into `Meta` blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufClass {
    Data,
    Meta,
}

impl BufType {
    pub fn align(self, block_size: u32) -> u32 {
        match self {
            BufType::Data | BufType::Dira => block_size,
            BufType::Inode => 32,
            BufType::Xattr => 4,
            BufType::Devt => 128,
            BufType::Meta => 1,
        }
    }

    pub fn class(self) -> BufClass {
        match self {
            BufType::Data => BufClass::Data,
            _ => BufClass::Meta,
        }
    }
}

/// What `flush` does with a head once its block address is settled.
#[derive(Debug, Default)]
pub enum FlushOp {
    /// Nothing left to write; the bytes were already produced (or the
    /// region is intentionally left zero).
    #[default]
    Release,
    /// The owner patches this region through the device itself; the block
    /// must survive `flush` untouched.
    SkipWrite,
    /// Write the payload at the head's position.
    Write(Box<[u8]>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeadId(usize);

struct BufferHead {
    block: BlockId,
    off: u64,
    op: FlushOp,
}

struct BufferBlock {
    class: BufClass,
    blk_addr: Option<u32>,
    /// Byte cursor within the block; may exceed one block size for
    /// multi-block runs.
    buffers_off: u64,
    heads: Vec<HeadId>,
    /// Position in the allocation-order list.
    order_pos: usize,
    /// Index of the mapped-bucket currently holding this block.
    bucket: Option<usize>,
    /// Block contains a skip-write head and must not take packed
    /// allocations nor be flushed.
    pinned: bool,
    released: bool,
}

pub struct BufferAllocator {
    blkszbits: u8,
    blocks: Vec<BufferBlock>,
    heads: Vec<BufferHead>,
    /// Block handles in allocation order; released entries stay as
    /// tombstones so recorded positions remain valid.
    order: Vec<BlockId>,
    /// Mapped blocks indexed by `(class, buffers_off % block_size)` for the
    /// most-fit attach search.
    buckets: Vec<Vec<BlockId>>,
    last_mapped: Option<BlockId>,
    tail_blk_addr: u32,
    meta_blk_cnt: u32,
}

fn round_up(x: u64, to: u64) -> u64 {
    x.div_ceil(to) * to
}

fn round_down(x: u64, to: u64) -> u64 {
    x - x % to
}

impl BufferAllocator {
    pub fn new(blkszbits: u8, start_blk: u32) -> BufferAllocator {
        let block_size = 1usize << blkszbits;
        BufferAllocator {
            blkszbits,
            blocks: Vec::new(),
            heads: Vec::new(),
            order: Vec::new(),
            buckets: vec![Vec::new(); 2 * block_size],
            last_mapped: None,
            tail_blk_addr: start_blk,
            meta_blk_cnt: 0,
        }
    }

    pub fn block_size(&self) -> u64 {
        1 << self.blkszbits
    }

    pub fn tail_blk_addr(&self) -> u32 {
        self.tail_blk_addr
    }

    pub fn meta_blk_cnt(&self) -> u32 {
        self.meta_blk_cnt
    }

    /// Blocks needed to hold `off` bytes.
    fn blk_round_up(&self, off: u64) -> u32 {
        off.div_ceil(self.block_size()) as u32
    }

    fn bucket_index(&self, class: BufClass, rem: u64) -> usize {
        let class_idx = match class {
            BufClass::Data => 0,
            BufClass::Meta => 1,
        };
        class_idx * self.block_size() as usize + rem as usize
    }

    /// Allocate a head of `size` declared bytes.  `required_ext` bytes must
    /// follow in the same block; `inline_ext` bytes must merely fit within
    /// the block without being contiguous with the head.
    pub fn alloc(
        &mut self,
        ty: BufType,
        size: u64,
        required_ext: u32,
        inline_ext: u32,
    ) -> Result<HeadId> {
        let blksz = self.block_size();
        let align = ty.align(1 << self.blkszbits) as u64;
        let class = ty.class();

        let used0 = ((size + required_ext as u64) & (blksz - 1)) + inline_ext as u64;
        if used0 > blksz {
            return Err(Error::NoSpace("inline extension cannot fit in one block"));
        }

        let bid = match self.find_for_attach(class, align, size, required_ext as u64, inline_ext as u64) {
            Some(bid) => bid,
            None => self.new_block(class),
        };
        let head = self.new_head(bid);
        self.attach_internal(bid, Some(head), size, align, (required_ext + inline_ext) as u64, false)?;
        trace!(
            "alloc {ty:?} size {size} -> block {:?} off {}",
            bid,
            self.heads[head.0].off
        );
        Ok(head)
    }

    /// Place a new head after `after`, which must be the tail head of its
    /// block, at the alignment of `ty`.
    pub fn attach(&mut self, after: HeadId, ty: BufType, size: u64) -> Result<HeadId> {
        let bid = self.heads[after.0].block;
        if self.blocks[bid.0].heads.last() != Some(&after) {
            return Err(Error::InvalidHead("attach on a non-tail head"));
        }
        if ty.class() != self.blocks[bid.0].class {
            return Err(Error::InvalidHead("attach with a mismatched buffer class"));
        }
        let align = ty.align(1 << self.blkszbits) as u64;
        let head = self.new_head(bid);
        match self.attach_internal(bid, Some(head), size, align, 0, false) {
            Ok(_) => Ok(head),
            Err(e) => {
                self.blocks[bid.0].heads.pop();
                Err(e)
            }
        }
    }

    /// Extend the tail head by `incr` bytes in place.
    pub fn balloon(&mut self, head: HeadId, incr: u64) -> Result<()> {
        let bid = self.heads[head.0].block;
        if self.blocks[bid.0].heads.last() != Some(&head) {
            return Err(Error::InvalidHead("balloon on a non-tail head"));
        }
        self.attach_internal(bid, None, incr, 1, 0, false)?;
        Ok(())
    }

    pub fn set_op(&mut self, head: HeadId, op: FlushOp) {
        let bid = self.heads[head.0].block;
        if matches!(op, FlushOp::SkipWrite) {
            self.blocks[bid.0].pinned = true;
        }
        self.heads[head.0].op = op;
    }

    pub fn block_of(&self, head: HeadId) -> BlockId {
        self.heads[head.0].block
    }

    pub fn blk_addr(&self, block: BlockId) -> Option<u32> {
        self.blocks[block.0].blk_addr
    }

    /// Absolute byte offset of `head` in the image, or `None` while the
    /// owning block is unmapped (callers map first when a real position is
    /// needed).
    pub fn tell(&self, head: HeadId, at_end: bool) -> Option<u64> {
        let h = &self.heads[head.0];
        let block = &self.blocks[h.block.0];
        let addr = block.blk_addr?;
        let base = (addr as u64) << self.blkszbits;
        if at_end {
            let pos = block.heads.iter().position(|x| *x == head);
            let off = match pos.and_then(|p| block.heads.get(p + 1)) {
                Some(next) => self.heads[next.0].off,
                None => block.buffers_off,
            };
            Some(base + off)
        } else {
            Some(base + h.off)
        }
    }

    /// Assign addresses to every unmapped block up to and including `upto`
    /// (or the end of the list), in allocation order.  Idempotent on
    /// already-mapped blocks.  Returns `upto`'s address, or the tail block
    /// address when `upto` is `None`.
    pub fn map_bh(&mut self, upto: Option<BlockId>) -> u32 {
        if let Some(bid) = upto {
            if let Some(addr) = self.blocks[bid.0].blk_addr {
                return addr;
            }
        }
        let start = match self.last_mapped {
            Some(bid) => self.blocks[bid.0].order_pos + 1,
            None => 0,
        };
        for i in start..self.order.len() {
            let bid = self.order[i];
            if self.blocks[bid.0].released || self.blocks[bid.0].blk_addr.is_some() {
                continue;
            }
            let addr = self.tail_blk_addr;
            self.blocks[bid.0].blk_addr = Some(addr);
            self.tail_blk_addr = addr + self.blk_round_up(self.blocks[bid.0].buffers_off);
            self.last_mapped = Some(bid);
            self.update_mapped(bid);
            trace!("map block {bid:?} -> {addr}");
            if Some(bid) == upto {
                break;
            }
        }
        match upto {
            Some(bid) => self.blocks[bid.0].blk_addr.unwrap_or(self.tail_blk_addr),
            None => self.tail_blk_addr,
        }
    }

    /// Flush blocks in allocation order: write pending head payloads, zero
    /// the trailing partial block, account metadata blocks and release.
    /// Stops at `upto`; blocks pinned by a skip-write head are left intact.
    pub fn flush(&mut self, dev: &Device, upto: Option<BlockId>) -> Result<()> {
        for i in 0..self.order.len() {
            let bid = self.order[i];
            if self.blocks[bid.0].released {
                continue;
            }
            if Some(bid) == upto {
                break;
            }
            if self.blocks[bid.0].pinned {
                continue;
            }
            let addr = self.map_bh(Some(bid));
            let base = (addr as u64) << self.blkszbits;
            let heads = self.blocks[bid.0].heads.clone();
            for h in heads {
                let off = self.heads[h.0].off;
                if let FlushOp::Write(data) = std::mem::take(&mut self.heads[h.0].op) {
                    dev.pwrite(&data, base + off)?;
                }
            }
            let buffers_off = self.blocks[bid.0].buffers_off;
            let blksz = self.block_size();
            let padding = (blksz - (buffers_off & (blksz - 1))) & (blksz - 1);
            if padding != 0 {
                let end = (addr + self.blk_round_up(buffers_off)) as u64;
                dev.fill_zero((end << self.blkszbits) - padding, padding)?;
            }
            if self.blocks[bid.0].class != BufClass::Data {
                self.meta_blk_cnt += self.blk_round_up(buffers_off);
            }
            trace!("block {bid:?} @{addr} flushed");
            self.free_block(bid);
        }
        Ok(())
    }

    /// Cancel or retire a single head.  With `try_revoke`, a sole tail head
    /// whose block sits at the end of the assigned address space gives its
    /// blocks back to the allocator.
    pub fn drop_head(&mut self, dev: &Device, head: HeadId, try_revoke: bool) -> Result<()> {
        let bid = self.heads[head.0].block;
        let is_tail = self.blocks[bid.0].heads.last() == Some(&head);
        if let FlushOp::Write(data) = std::mem::take(&mut self.heads[head.0].op) {
            let addr = self.map_bh(Some(bid));
            let off = self.heads[head.0].off;
            dev.pwrite(&data, ((addr as u64) << self.blkszbits) + off)?;
        }
        self.blocks[bid.0].heads.retain(|h| *h != head);
        let pinned = self.blocks[bid.0]
            .heads
            .iter()
            .any(|h| matches!(self.heads[h.0].op, FlushOp::SkipWrite));
        self.blocks[bid.0].pinned = pinned;

        if self.blocks[bid.0].heads.is_empty() {
            if try_revoke && is_tail {
                if let Some(addr) = self.blocks[bid.0].blk_addr {
                    let nblocks = self.blk_round_up(self.blocks[bid.0].buffers_off);
                    if self.tail_blk_addr == addr + nblocks {
                        self.tail_blk_addr = addr;
                        trace!("revoked {nblocks} blocks, tail back to {addr}");
                    }
                }
            }
            self.free_block(bid);
        }
        Ok(())
    }

    fn new_block(&mut self, class: BufClass) -> BlockId {
        let bid = BlockId(self.blocks.len());
        self.blocks.push(BufferBlock {
            class,
            blk_addr: None,
            buffers_off: 0,
            heads: Vec::new(),
            order_pos: self.order.len(),
            bucket: None,
            pinned: false,
            released: false,
        });
        self.order.push(bid);
        bid
    }

    fn new_head(&mut self, block: BlockId) -> HeadId {
        let hid = HeadId(self.heads.len());
        self.heads.push(BufferHead {
            block,
            off: 0,
            op: FlushOp::Release,
        });
        self.blocks[block.0].heads.push(hid);
        hid
    }

    fn free_block(&mut self, bid: BlockId) {
        if let Some(bkt) = self.blocks[bid.0].bucket.take() {
            self.buckets[bkt].retain(|b| *b != bid);
        }
        if self.last_mapped == Some(bid) {
            // walk back to the previous mapped block so the attach scan and
            // the mapping walk keep a valid starting point
            let pos = self.blocks[bid.0].order_pos;
            self.last_mapped = self.order[..pos]
                .iter()
                .rev()
                .copied()
                .find(|b| !self.blocks[b.0].released && self.blocks[b.0].blk_addr.is_some());
        }
        self.blocks[bid.0].released = true;
        self.blocks[bid.0].heads.clear();
    }

    fn update_mapped(&mut self, bid: BlockId) {
        if self.blocks[bid.0].blk_addr.is_none() {
            return;
        }
        let rem = self.blocks[bid.0].buffers_off & (self.block_size() - 1);
        let idx = self.bucket_index(self.blocks[bid.0].class, rem);
        if self.blocks[bid.0].bucket == Some(idx) {
            return;
        }
        if let Some(old) = self.blocks[bid.0].bucket.take() {
            self.buckets[old].retain(|b| *b != bid);
        }
        self.buckets[idx].push(bid);
        self.blocks[bid.0].bucket = Some(idx);
    }

    /// The attach primitive shared by `alloc`, `attach` and `balloon`.
    ///
    /// Verifies that extending the block by `incr` (+`extrasize` of pending
    /// extensions) does not run into an already-mapped neighbour, places the
    /// optional head at the type alignment, and keeps `tail_blk_addr` in
    /// sync when the tail block run grows.  Returns the bytes occupied in
    /// the block's last disk block after the attach.
    fn attach_internal(
        &mut self,
        bid: BlockId,
        head: Option<HeadId>,
        incr: u64,
        align: u64,
        extrasize: u64,
        dryrun: bool,
    ) -> Result<u64> {
        let blksz = self.block_size();
        let blkmask = blksz - 1;
        let boff = self.blocks[bid.0].buffers_off;
        let aligned = round_up(boff, align);
        let tail_used = round_up(boff.wrapping_sub(1) & blkmask, align) + incr + extrasize;
        let oob = tail_used.cmp(&blksz);

        let mut tailupdate = false;
        let mut blkaddr = 0u32;
        if oob != Ordering::Less {
            // growing past the block boundary is only allowed at the end of
            // the assigned address space
            if oob == Ordering::Greater {
                let next_mapped = self.order[self.blocks[bid.0].order_pos + 1..]
                    .iter()
                    .any(|b| !self.blocks[b.0].released && self.blocks[b.0].blk_addr.is_some());
                if next_mapped {
                    return Err(Error::NoSpace("buffer block cannot grow past a mapped block"));
                }
            }
            if let Some(addr) = self.blocks[bid.0].blk_addr {
                blkaddr = addr;
                tailupdate = self.tail_blk_addr == addr + self.blk_round_up(boff);
                if oob == Ordering::Greater && !tailupdate {
                    return Err(Error::NoSpace("mapped buffer block is not the tail run"));
                }
            }
        }

        if !dryrun {
            if let Some(h) = head {
                self.heads[h.0].off = aligned;
            }
            let new_off = aligned + incr;
            self.blocks[bid.0].buffers_off = new_off;
            if tailupdate {
                self.tail_blk_addr = blkaddr + self.blk_round_up(new_off);
            }
            self.update_mapped(bid);
        }

        Ok(((aligned + incr - 1) & blkmask) + 1)
    }

    /// Search for a block that can take a new `size`-byte head: first the
    /// most-fit mapped block via the buckets, then every block from the
    /// last mapped one onwards (those can still be extended).
    fn find_for_attach(
        &mut self,
        class: BufClass,
        align: u64,
        size: u64,
        required_ext: u64,
        inline_ext: u64,
    ) -> Option<BlockId> {
        let blksz = self.block_size();
        let blkmask = blksz - 1;
        let used0 = ((size + required_ext) & blkmask) + inline_ext;
        if used0 == 0 || align == blksz {
            return None;
        }

        let mut best = None;
        let mut usedmax = 0u64;

        // (1) most-fit mapped block
        if size + required_ext + inline_ext < blksz {
            let mut used_before = round_down(blksz - (size + required_ext + inline_ext), align);
            while used_before > 0 {
                if let Some(bid) = self.bucket_first(class, used_before) {
                    // the last mapped block can still be extended; phase (2)
                    // handles it
                    if Some(bid) != self.last_mapped {
                        if let Ok(ret) =
                            self.attach_internal(bid, None, size, align, required_ext + inline_ext, true)
                        {
                            let used = ret + required_ext + inline_ext;
                            debug_assert!(used <= blksz);
                            best = Some(bid);
                            usedmax = used;
                            break;
                        }
                    }
                }
                used_before -= 1;
            }
        }

        // (2) from the last mapped block to the end of the list
        let start = match self.last_mapped {
            Some(bid) => self.blocks[bid.0].order_pos,
            None => 0,
        };
        for i in start..self.order.len() {
            let bid = self.order[i];
            let block = &self.blocks[bid.0];
            if block.released || block.pinned || block.class != class {
                continue;
            }
            let used_before = block.buffers_off & blkmask;
            if used_before == 0 {
                continue;
            }
            let ret = match self.attach_internal(bid, None, size, align, required_ext + inline_ext, true)
            {
                Ok(r) => r,
                Err(_) => continue,
            };
            // bytes occupied in the final block, with an exact fill counting
            // as a whole block rather than zero
            let used = ((ret + required_ext - 1) & blkmask) + 1 + inline_ext;
            if used > blksz {
                continue;
            }
            // remaining space should shrink, or beat a fresh block's fill
            if used < used_before && used < used0 {
                continue;
            }
            if usedmax < used {
                best = Some(bid);
                usedmax = used;
            }
        }

        best
    }

    fn bucket_first(&mut self, class: BufClass, rem: u64) -> Option<BlockId> {
        let idx = self.bucket_index(class, rem);
        let blkmask = self.block_size() - 1;
        loop {
            let bid = *self.buckets[idx].first()?;
            let block = &self.blocks[bid.0];
            let stale = block.released
                || block.blk_addr.is_none()
                || block.bucket != Some(idx)
                || (block.buffers_off & blkmask) != rem;
            if stale {
                self.buckets[idx].remove(0);
                continue;
            }
            if block.pinned {
                return None;
            }
            return Some(bid);
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device::Device;

    fn mgr() -> BufferAllocator {
        BufferAllocator::new(12, 0)
    }

    #[test]
    fn test_block_size_alloc_is_fresh() {
        let mut b = mgr();
        let h1 = b.alloc(BufType::Meta, 4096, 0, 0).unwrap();
        let h2 = b.alloc(BufType::Meta, 4096, 0, 0).unwrap();
        assert_ne!(b.block_of(h1), b.block_of(h2));
        assert_eq!(b.map_bh(None), 2);
    }

    #[test]
    fn test_meta_packs_to_exact_fill() {
        let mut b = mgr();
        let h1 = b.alloc(BufType::Meta, 1, 0, 0).unwrap();
        let h2 = b.alloc(BufType::Meta, 4095, 0, 0).unwrap();
        assert_eq!(b.block_of(h1), b.block_of(h2));
        assert_eq!(b.map_bh(None), 1);
    }

    #[test]
    fn test_inode_alignment() {
        let mut b = mgr();
        let h1 = b.alloc(BufType::Inode, 33, 0, 0).unwrap();
        let h2 = b.alloc(BufType::Inode, 32, 0, 0).unwrap();
        assert_eq!(b.block_of(h1), b.block_of(h2));
        b.map_bh(None);
        assert_eq!(b.tell(h1, false), Some(0));
        assert_eq!(b.tell(h2, false), Some(64));
    }

    #[test]
    fn test_tell_unmapped_is_none() {
        let mut b = mgr();
        let h = b.alloc(BufType::Meta, 10, 0, 0).unwrap();
        assert_eq!(b.tell(h, false), None);
        let bid = b.block_of(h);
        assert_eq!(b.map_bh(Some(bid)), 0);
        assert_eq!(b.tell(h, false), Some(0));
        assert_eq!(b.tell(h, true), Some(10));
    }

    #[test]
    fn test_balloon_and_attach() {
        let mut b = mgr();
        let sb = b.alloc(BufType::Meta, 0, 0, 0).unwrap();
        b.balloon(sb, 1152).unwrap();
        assert_eq!(b.map_bh(Some(b.block_of(sb))), 0);
        assert_eq!(b.tell(sb, false), Some(0));

        let cfg = b.attach(sb, BufType::Meta, 16).unwrap();
        assert_eq!(b.tell(cfg, false), Some(1152));

        // sb is no longer the tail
        assert!(matches!(
            b.attach(sb, BufType::Meta, 4),
            Err(Error::InvalidHead(_))
        ));
        assert!(matches!(b.balloon(sb, 4), Err(Error::InvalidHead(_))));
    }

    #[test]
    fn test_inline_ext_no_space() {
        let mut b = mgr();
        assert!(matches!(
            b.alloc(BufType::Inode, 64, 0, 4095),
            Err(Error::NoSpace(_))
        ));
    }

    #[test]
    fn test_inline_fits_with_head() {
        let mut b = mgr();
        let h = b.alloc(BufType::Inode, 32, 0, 44).unwrap();
        let inline = b.attach(h, BufType::Meta, 44).unwrap();
        b.map_bh(None);
        assert_eq!(b.tell(inline, false), Some(32));
    }

    #[test]
    fn test_lazy_chain_mapping() {
        let mut b = mgr();
        let h1 = b.alloc(BufType::Meta, 4096, 0, 0).unwrap();
        let h2 = b.alloc(BufType::Data, 8192, 0, 0).unwrap();
        let h3 = b.alloc(BufType::Meta, 4096, 0, 0).unwrap();
        // mapping the middle block maps everything before it as well
        assert_eq!(b.map_bh(Some(b.block_of(h2))), 1);
        assert_eq!(b.blk_addr(b.block_of(h1)), Some(0));
        assert_eq!(b.blk_addr(b.block_of(h2)), Some(1));
        assert_eq!(b.blk_addr(b.block_of(h3)), None);
        assert_eq!(b.map_bh(None), 4);
        assert_eq!(b.blk_addr(b.block_of(h3)), Some(3));
    }

    #[test]
    fn test_revoke_rewinds_tail() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::open(&dir.path().join("img"), 12, false).unwrap();
        let mut b = mgr();
        let keep = b.alloc(BufType::Data, 4096, 0, 0).unwrap();
        b.map_bh(Some(b.block_of(keep)));
        let gone = b.alloc(BufType::Data, 8192, 0, 0).unwrap();
        b.map_bh(Some(b.block_of(gone)));
        assert_eq!(b.tail_blk_addr(), 3);
        b.drop_head(&dev, gone, true).unwrap();
        assert_eq!(b.tail_blk_addr(), 1);
    }

    #[test]
    fn test_flush_pads_and_counts_meta() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::open(&dir.path().join("img"), 12, false).unwrap();
        let mut b = mgr();
        let h = b.alloc(BufType::Meta, 100, 0, 0).unwrap();
        b.set_op(h, FlushOp::Write(vec![0xAB; 100].into_boxed_slice()));
        b.flush(&dev, None).unwrap();
        assert_eq!(b.meta_blk_cnt(), 1);

        let mut buf = vec![0xFFu8; 4096];
        dev.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf[..100], &[0xAB; 100][..]);
        assert_eq!(&buf[100..], &[0u8; 3996][..]);
    }

    #[test]
    fn test_flush_leaves_pinned_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::open(&dir.path().join("img"), 12, false).unwrap();
        let mut b = mgr();
        let sb = b.alloc(BufType::Meta, 0, 0, 0).unwrap();
        b.set_op(sb, FlushOp::SkipWrite);
        b.balloon(sb, 1152).unwrap();
        b.map_bh(Some(b.block_of(sb)));
        let h = b.alloc(BufType::Meta, 8, 0, 0).unwrap();
        b.set_op(h, FlushOp::Write(vec![1; 8].into_boxed_slice()));
        b.flush(&dev, None).unwrap();
        // the pinned block survives and can still be dropped later
        assert_eq!(b.tell(sb, false), Some(0));
        b.drop_head(&dev, sb, false).unwrap();
        b.flush(&dev, None).unwrap();
    }

    #[test]
    fn test_pinned_block_not_packed() {
        let mut b = mgr();
        let sb = b.alloc(BufType::Meta, 0, 0, 0).unwrap();
        b.set_op(sb, FlushOp::SkipWrite);
        b.balloon(sb, 1152).unwrap();
        b.map_bh(Some(b.block_of(sb)));
        // an inode head must not share the reserved superblock block
        let ino = b.alloc(BufType::Inode, 32, 0, 0).unwrap();
        assert_ne!(b.block_of(ino), b.block_of(sb));
        b.map_bh(None);
        assert_eq!(b.tell(ino, false), Some(4096));
    }
}
