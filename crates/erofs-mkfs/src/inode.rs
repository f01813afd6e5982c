//! In-memory inodes and their on-disk emission.
//!
//! An inode picks the compact 32-byte form whenever every field fits and
//! its mtime matches the build time; anything else, and the packed inode,
//! uses the extended 64-byte form.  The encoded image is the header
//! followed by the inline xattr area and, for compressed files, the
//! compression metadata; inline tail data is attached as a separate
//! buffer head by the builder.

use zerocopy::IntoBytes;

use crate::buffer::HeadId;
use crate::format::{
    CompactInodeHeader, DataLayout, ExtendedInodeHeader, FileType, FormatField, InodeU,
    InodeVersion, COMPACT_INODE_SIZE, EXTENDED_INODE_SIZE,
};
use crate::xattr::{self, XAttr};

pub struct Inode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub mtime_nsec: u32,
    pub nlink: u32,
    /// Serial inode number, assigned in tree-walk order.
    pub ino: u32,
    pub size: u64,
    pub layout: DataLayout,
    pub u: InodeU,
    /// Inline tail bytes (file tail, symlink target or directory tail).
    pub idata: Box<[u8]>,
    pub xattrs: Vec<XAttr>,
    pub compress_meta: Option<Box<[u8]>>,
    pub extended: bool,
    pub is_packed: bool,

    pub bh: Option<HeadId>,
    pub inline_bh: Option<HeadId>,
    pub nid: u64,
}

impl Inode {
    pub fn new(ino: u32) -> Inode {
        Inode {
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            mtime_nsec: 0,
            nlink: 1,
            ino,
            size: 0,
            layout: DataLayout::FlatPlain,
            u: InodeU::RawBlkAddr(None),
            idata: Box::default(),
            xattrs: Vec::new(),
            compress_meta: None,
            extended: false,
            is_packed: false,
            bh: None,
            inline_bh: None,
            nid: 0,
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Whether the extended form is required.  Compact inodes derive their
    /// mtime from the superblock build time, so any differing timestamp
    /// forces the extended form unless timestamps are ignored outright.
    pub fn decide_extended(
        &mut self,
        build_time: u64,
        build_time_nsec: u32,
        ignore_mtime: bool,
    ) -> bool {
        self.extended = self.is_packed
            || self.size > u32::MAX as u64
            || self.uid > u16::MAX as u32
            || self.gid > u16::MAX as u32
            || self.nlink > u16::MAX as u32
            || (!ignore_mtime
                && (self.mtime != build_time || self.mtime_nsec != build_time_nsec));
        self.extended
    }

    pub fn inode_isize(&self) -> usize {
        if self.extended {
            EXTENDED_INODE_SIZE
        } else {
            COMPACT_INODE_SIZE
        }
    }

    pub fn xattr_isize(&self) -> usize {
        xattr::ibody_size(&self.xattrs)
    }

    /// Declared footprint of the inode head: header, xattr area and
    /// compression metadata.  Inline tail data is accounted separately.
    pub fn meta_isize(&self) -> usize {
        self.inode_isize() + self.xattr_isize() + self.compress_meta.as_deref().map_or(0, <[u8]>::len)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.meta_isize());
        let xattr_icount = xattr::icount(self.xattr_isize());

        if self.extended {
            out.extend_from_slice(
                ExtendedInodeHeader {
                    format: FormatField::new(InodeVersion::Extended, self.layout),
                    xattr_icount: xattr_icount.into(),
                    mode: (self.mode as u16).into(),
                    size: self.size.into(),
                    u: self.u.to_wire().into(),
                    ino: self.ino.into(),
                    uid: self.uid.into(),
                    gid: self.gid.into(),
                    mtime: self.mtime.into(),
                    mtime_nsec: self.mtime_nsec.into(),
                    nlink: self.nlink.into(),
                    ..Default::default()
                }
                .as_bytes(),
            );
        } else {
            out.extend_from_slice(
                CompactInodeHeader {
                    format: FormatField::new(InodeVersion::Compact, self.layout),
                    xattr_icount: xattr_icount.into(),
                    mode: (self.mode as u16).into(),
                    nlink: (self.nlink as u16).into(),
                    size: (self.size as u32).into(),
                    u: self.u.to_wire().into(),
                    ino: self.ino.into(),
                    uid: (self.uid as u16).into(),
                    gid: (self.gid as u16).into(),
                    ..Default::default()
                }
                .as_bytes(),
            );
        }

        xattr::write_ibody(&mut out, &self.xattrs);
        if let Some(meta) = &self.compress_meta {
            out.extend_from_slice(meta);
        }
        debug_assert_eq!(out.len(), self.meta_isize());
        out
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use zerocopy::FromBytes;

    use super::*;
    use crate::format::{NULL_ADDR, S_IFREG};

    fn inode() -> Inode {
        let mut i = Inode::new(3);
        i.mode = (S_IFREG | 0o644) as u32;
        i.size = 5;
        i.mtime = 1000;
        i
    }

    #[test]
    fn test_compact_when_everything_fits() {
        let mut i = inode();
        assert!(!i.decide_extended(1000, 0, false));
        assert_eq!(i.meta_isize(), 32);
        let bytes = i.encode();
        let hdr = CompactInodeHeader::read_from_bytes(&bytes).unwrap();
        assert_eq!(hdr.format.version(), InodeVersion::Compact);
        assert_eq!(hdr.size.get(), 5);
        assert_eq!(hdr.u.get(), NULL_ADDR);
    }

    #[test]
    fn test_extended_on_mtime_mismatch() {
        let mut i = inode();
        assert!(i.decide_extended(2000, 0, false));
        assert_eq!(i.meta_isize(), 64);
        let bytes = i.encode();
        let hdr = ExtendedInodeHeader::read_from_bytes(&bytes).unwrap();
        assert_eq!(hdr.format.version(), InodeVersion::Extended);
        assert_eq!(hdr.mtime.get(), 1000);
    }

    #[test]
    fn test_ignore_mtime_keeps_compact() {
        let mut i = inode();
        assert!(!i.decide_extended(2000, 0, true));
    }

    #[test]
    fn test_extended_on_wide_ids() {
        let mut i = inode();
        i.uid = 0x10000;
        assert!(i.decide_extended(1000, 0, false));

        let mut i = inode();
        i.size = 1 << 33;
        assert!(i.decide_extended(1000, 0, false));

        let mut i = inode();
        i.is_packed = true;
        assert!(i.decide_extended(1000, 0, false));
    }

    #[test]
    fn test_encode_appends_xattrs_and_meta() {
        let mut i = inode();
        i.xattrs.push(XAttr::new(b"user.k", b"v"));
        i.compress_meta = Some(Box::from([0u8; 32]));
        i.decide_extended(1000, 0, false);
        let bytes = i.encode();
        assert_eq!(bytes.len(), 32 + (12 + 8) + 32);
        assert_eq!(bytes.len(), i.meta_isize());
    }
}
