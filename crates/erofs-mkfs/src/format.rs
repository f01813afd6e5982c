//! On-disk format definitions.
//!
//! Every record written into the image is declared here exactly once, as a
//! `#[repr(C)]` struct of little-endian wire integers.  Encoding is
//! `IntoBytes::as_bytes`; decoding the same struct back out of a byte slice
//! is how the tests verify round-trips.

use std::fmt;

use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::error::{Error, Result};

pub const SUPER_MAGIC_V1: u32 = 0xE0F5_E1E0;
pub const SUPER_OFFSET: u64 = 1024;
pub const SUPER_END: u64 = SUPER_OFFSET + 128;

pub const MIN_BLKSZBITS: u8 = 9;
pub const MAX_BLKSZBITS: u8 = 12;
pub const MAX_BLOCK_SIZE: u32 = 1 << MAX_BLKSZBITS;

/// Inodes are addressed in 32-byte slots relative to `meta_blkaddr`.
pub const ISLOTBITS: u8 = 5;

/// On-disk sentinel for "no block assigned".
pub const NULL_ADDR: u32 = u32::MAX;

pub const MAX_NAME_LEN: usize = 255;

/* Superblock feature bits */

pub const FEATURE_COMPAT_SB_CHKSUM: u32 = 0x0000_0001;
pub const FEATURE_COMPAT_MTIME: u32 = 0x0000_0002;
pub const FEATURE_COMPAT_XATTR_FILTER: u32 = 0x0000_0004;

pub const FEATURE_INCOMPAT_ZERO_PADDING: u32 = 0x0000_0001;
pub const FEATURE_INCOMPAT_COMPR_CFGS: u32 = 0x0000_0002;
pub const FEATURE_INCOMPAT_BIG_PCLUSTER: u32 = 0x0000_0002;
pub const FEATURE_INCOMPAT_CHUNKED_FILE: u32 = 0x0000_0004;
pub const FEATURE_INCOMPAT_DEVICE_TABLE: u32 = 0x0000_0008;
pub const FEATURE_INCOMPAT_FRAGMENTS: u32 = 0x0000_0020;
pub const FEATURE_INCOMPAT_DEDUPE: u32 = 0x0000_0020;

/* Inode format field */

const I_VERSION_BIT: u16 = 0;
const I_DATALAYOUT_BIT: u16 = 1;
const I_VERSION_MASK: u16 = 0x01;
const I_DATALAYOUT_MASK: u16 = 0x07;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeVersion {
    Compact = 0,
    Extended = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DataLayout {
    FlatPlain = 0,
    CompressedFull = 1,
    FlatInline = 2,
    CompressedCompact = 3,
    ChunkBased = 4,
}

impl DataLayout {
    pub fn is_compressed(self) -> bool {
        matches!(self, DataLayout::CompressedFull | DataLayout::CompressedCompact)
    }
}

/// The first 16 bits of either inode form: `(version << 0) | (data_layout << 1)`.
#[derive(Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
pub struct FormatField(pub U16);

impl FormatField {
    pub fn new(version: InodeVersion, layout: DataLayout) -> Self {
        FormatField(
            (((version as u16) << I_VERSION_BIT) | ((layout as u16) << I_DATALAYOUT_BIT)).into(),
        )
    }

    pub fn version(self) -> InodeVersion {
        match (self.0.get() >> I_VERSION_BIT) & I_VERSION_MASK {
            0 => InodeVersion::Compact,
            _ => InodeVersion::Extended,
        }
    }

    pub fn data_layout(self) -> Result<DataLayout> {
        match (self.0.get() >> I_DATALAYOUT_BIT) & I_DATALAYOUT_MASK {
            0 => Ok(DataLayout::FlatPlain),
            1 => Ok(DataLayout::CompressedFull),
            2 => Ok(DataLayout::FlatInline),
            3 => Ok(DataLayout::CompressedCompact),
            4 => Ok(DataLayout::ChunkBased),
            n => Err(Error::Corrupt(format!("unknown data layout {n}"))),
        }
    }
}

impl fmt::Debug for FormatField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = {:?} | {:?}", self.0.get(), self.version(), self.data_layout())
    }
}

/* File types, as stored in directory entries */

pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegularFile = 1,
    Directory = 2,
    CharacterDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    pub fn from_mode(mode: u32) -> FileType {
        match mode as u16 & S_IFMT {
            S_IFREG => FileType::RegularFile,
            S_IFDIR => FileType::Directory,
            S_IFCHR => FileType::CharacterDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }
}

#[derive(Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
pub struct FileTypeField(pub u8);

impl From<FileType> for FileTypeField {
    fn from(value: FileType) -> Self {
        FileTypeField(value as u8)
    }
}

impl fmt::Debug for FileTypeField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ft = match self.0 {
            1 => FileType::RegularFile,
            2 => FileType::Directory,
            3 => FileType::CharacterDevice,
            4 => FileType::BlockDevice,
            5 => FileType::Fifo,
            6 => FileType::Socket,
            7 => FileType::Symlink,
            _ => FileType::Unknown,
        };
        fmt::Debug::fmt(&ft, f)
    }
}

/* Superblock */

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Superblock {
    // vertical whitespace every 16 bytes (hexdump-friendly)
    pub magic: U32,
    pub checksum: U32,
    pub feature_compat: U32,
    pub blkszbits: u8,
    pub sb_extslots: u8,
    pub root_nid: U16,

    pub inos: U64,
    pub build_time: U64,

    pub build_time_nsec: U32,
    pub blocks: U32,
    pub meta_blkaddr: U32,
    pub xattr_blkaddr: U32,

    pub uuid: [u8; 16],

    pub volume_name: [u8; 16],

    pub feature_incompat: U32,
    /// Union: `available_compr_algs` bitmap when `COMPR_CFGS` is set,
    /// `lz4_max_distance` otherwise.
    pub compr_info: U16,
    pub extra_devices: U16,
    pub devt_slotoff: U16,
    pub dirblkbits: u8,
    pub xattr_prefix_count: u8,
    pub xattr_prefix_start: U32,

    pub packed_nid: U64,
    pub xattr_filter_reserved: u8,
    pub reserved2: [u8; 23],
}

/// The wire arm for the 16-bit union at superblock offset 76.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComprInfo {
    Lz4MaxDistance(u16),
    AvailableComprAlgs(u16),
}

impl ComprInfo {
    pub fn to_wire(self) -> u16 {
        match self {
            ComprInfo::Lz4MaxDistance(v) | ComprInfo::AvailableComprAlgs(v) => v,
        }
    }
}

/* Inodes */

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CompactInodeHeader {
    pub format: FormatField,
    pub xattr_icount: U16,
    pub mode: U16,
    pub nlink: U16,

    pub size: U32,
    pub reserved: U32,

    pub u: U32,
    pub ino: U32, // only used for 32-bit stat compatibility

    pub uid: U16,
    pub gid: U16,
    pub reserved2: [u8; 4],
}

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtendedInodeHeader {
    pub format: FormatField,
    pub xattr_icount: U16,
    pub mode: U16,
    pub reserved: U16,

    pub size: U64,

    pub u: U32,
    pub reserved2: U32,
    pub ino: U32, // only used for 32-bit stat compatibility
    pub uid: U32,
    pub gid: U32,

    pub mtime: U64,
    pub mtime_nsec: U32,

    pub nlink: U32,
    pub reserved3: [u8; 12],
}

pub const COMPACT_INODE_SIZE: usize = 32;
pub const EXTENDED_INODE_SIZE: usize = 64;

/// The value stored in the 32-bit `i_u` union, discriminated by layout
/// and file type.  The sentinel `NULL_ADDR` only exists on the wire;
/// in-memory block addresses are `Option<u32>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeU {
    RawBlkAddr(Option<u32>),
    Rdev(u32),
    CompressedBlocks(u32),
    ChunkInfo { format: u16 },
}

impl InodeU {
    pub fn to_wire(self) -> u32 {
        match self {
            InodeU::RawBlkAddr(Some(addr)) => addr,
            InodeU::RawBlkAddr(None) => NULL_ADDR,
            InodeU::Rdev(rdev) => rdev,
            InodeU::CompressedBlocks(blocks) => blocks,
            InodeU::ChunkInfo { format } => format as u32,
        }
    }
}

/* Directories */

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirentHeader {
    pub nid: U64,
    /// Byte offset of this entry's name within the directory block.
    pub name_off: U16,
    pub file_type: FileTypeField,
    pub reserved: u8,
}

pub const DIRENT_SIZE: usize = 12;

/* Extended attributes */

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct InodeXAttrHeader {
    pub name_filter: U32,
    pub shared_count: u8,
    pub reserved: [u8; 7],
}

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XAttrEntryHeader {
    pub name_len: u8,
    pub name_index: u8,
    pub value_size: U16,
}

pub const XATTR_FILTER_SEED: u32 = 0x25BB_E08F;

pub const XATTR_PREFIXES: [&[u8]; 7] = [
    b"",
    b"user.",
    b"system.posix_acl_access",
    b"system.posix_acl_default",
    b"trusted.",
    b"lustre.",
    b"security.",
];

/* Device table */

#[derive(Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DeviceSlot {
    pub tag: [u8; 64],
    pub blocks: U32,
    pub mapped_blkaddr: U32,
    pub reserved: [u8; 56],
}

impl Default for DeviceSlot {
    fn default() -> Self {
        DeviceSlot {
            tag: [0; 64],
            blocks: 0.into(),
            mapped_blkaddr: 0.into(),
            reserved: [0; 56],
        }
    }
}

pub const DEVT_SLOT_SIZE: usize = 128;

/* Compression */

pub const COMPRESSION_LZ4: u8 = 0;
pub const COMPRESSION_LZMA: u8 = 1;
pub const COMPRESSION_DEFLATE: u8 = 2;
pub const COMPRESSION_ZSTD: u8 = 3;
pub const COMPRESSION_MAX: u8 = 4;

pub const PCLUSTER_MAX_SIZE: u32 = 1024 * 1024;

pub const LZ4_MAX_DISTANCE_DEFAULT: u16 = 65535;

/// Per-algorithm configuration payloads.  On disk each record is prefixed
/// with a 16-bit length and concatenated in algorithm-id order.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Lz4Cfg {
    pub max_distance: U16,
    pub max_pcluster_blks: U16,
    pub reserved: [u8; 10],
}

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct LzmaCfg {
    pub dict_size: U32,
    pub format: U16,
    pub reserved: [u8; 8],
}

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DeflateCfg {
    pub window_bits: u8,
    pub reserved: [u8; 5],
}

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ZstdCfg {
    pub format: u8,
    pub window_log: u8,
    pub reserved: [u8; 4],
}

/* Per-inode compression metadata */

pub const Z_ADVISE_BIG_PCLUSTER_1: u16 = 0x0002;
pub const Z_ADVISE_FRAGMENT_PCLUSTER: u16 = 0x0020;

/// Header of the per-inode compression metadata, followed by
/// [`ExtentRecord`]s until the accumulated uncompressed length plus
/// `fragment_size` reaches `i_size`.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ZMapHeader {
    pub fragment_off: U64,
    pub fragment_size: U32,
    pub advise: U16,
    pub algorithm: u8,
    pub cluster_bits: u8,
}

pub const Z_MAP_HEADER_SIZE: usize = 16;

pub const EXTENT_PLAIN: u16 = 0x0001;

#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtentRecord {
    pub compressed_blocks: U32,
    pub uncompressed_len: U32,
    pub blk_addr: U32,
    pub flags: U16,
    pub reserved: U16,
}

pub const EXTENT_RECORD_SIZE: usize = 16;

/// Encode `(major, minor)` of a device number the way the kernel packs
/// `new_encode_dev`.
pub fn encode_dev(rdev: u64) -> u32 {
    let major = ((rdev >> 8) & 0xfff) as u32 | ((rdev >> 32) as u32 & !0xfff);
    let minor = (rdev & 0xff) as u32 | ((rdev >> 12) as u32 & !0xff);
    (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use std::mem::size_of;
    use zerocopy::FromBytes;

    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(size_of::<Superblock>(), 128);
        assert_eq!(size_of::<CompactInodeHeader>(), COMPACT_INODE_SIZE);
        assert_eq!(size_of::<ExtendedInodeHeader>(), EXTENDED_INODE_SIZE);
        assert_eq!(size_of::<DirentHeader>(), DIRENT_SIZE);
        assert_eq!(size_of::<InodeXAttrHeader>(), 12);
        assert_eq!(size_of::<XAttrEntryHeader>(), 4);
        assert_eq!(size_of::<DeviceSlot>(), DEVT_SLOT_SIZE);
        assert_eq!(size_of::<ZMapHeader>(), Z_MAP_HEADER_SIZE);
        assert_eq!(size_of::<ExtentRecord>(), EXTENT_RECORD_SIZE);
        assert_eq!(size_of::<Lz4Cfg>(), 14);
        assert_eq!(size_of::<LzmaCfg>(), 14);
        assert_eq!(size_of::<DeflateCfg>(), 6);
        assert_eq!(size_of::<ZstdCfg>(), 6);
    }

    #[test]
    fn test_superblock_field_offsets() {
        // The checksum window and the verifier both rely on these.
        let sb = Superblock {
            magic: SUPER_MAGIC_V1.into(),
            checksum: 0x11223344.into(),
            blkszbits: 12,
            compr_info: 0xBEEF.into(),
            ..Default::default()
        };
        let bytes = sb.as_bytes();
        assert_eq!(&bytes[0..4], &SUPER_MAGIC_V1.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x11223344u32.to_le_bytes());
        assert_eq!(bytes[12], 12);
        assert_eq!(&bytes[76..78], &0xBEEFu16.to_le_bytes());
    }

    #[test]
    fn test_inode_roundtrip() {
        let hdr = ExtendedInodeHeader {
            format: FormatField::new(InodeVersion::Extended, DataLayout::FlatInline),
            xattr_icount: 3.into(),
            mode: (S_IFREG | 0o644).into(),
            size: 0x1_0000_0001u64.into(),
            u: NULL_ADDR.into(),
            ino: 7.into(),
            uid: 1000.into(),
            gid: 1000.into(),
            mtime: 1700000000.into(),
            mtime_nsec: 999.into(),
            nlink: 2.into(),
            ..Default::default()
        };
        let bytes = hdr.as_bytes().to_vec();
        let parsed = ExtendedInodeHeader::read_from_bytes(&bytes).unwrap();
        assert_eq!(parsed.as_bytes(), &bytes[..]);
        assert_eq!(parsed.format.version(), InodeVersion::Extended);
        assert_eq!(parsed.format.data_layout().unwrap(), DataLayout::FlatInline);
        assert_eq!(parsed.size.get(), 0x1_0000_0001);
        assert_eq!(parsed.nlink.get(), 2);
    }

    #[test]
    fn test_format_field() {
        let f = FormatField::new(InodeVersion::Compact, DataLayout::CompressedFull);
        assert_eq!(f.0.get(), 0b010);
        assert_eq!(f.version(), InodeVersion::Compact);
        assert_eq!(f.data_layout().unwrap(), DataLayout::CompressedFull);
    }

    #[test]
    fn test_encode_dev() {
        // (major 8, minor 1) => classic dev_t 0x0801
        assert_eq!(encode_dev(0x0801), (1 & 0xff) | (8 << 8));
        // a minor above 255 spills into the high bits
        assert_eq!(encode_dev(0x0010_0800), 0x0010_0800);
    }
}
