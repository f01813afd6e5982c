//! Inline extended-attribute serialisation.
//!
//! Xattrs live in the inode body between the header and the inline data,
//! as an [`InodeXAttrHeader`] followed by 4-byte-aligned entries.  A
//! 32-bit xxh32 bloom filter over the attribute names is kept in the
//! header so readers can skip absent lookups.

use std::mem::size_of;

use xxhash_rust::xxh32::xxh32;
use zerocopy::IntoBytes;

use crate::format::{
    InodeXAttrHeader, XAttrEntryHeader, XATTR_FILTER_SEED, XATTR_PREFIXES,
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct XAttr {
    prefix: u8,
    suffix: Box<[u8]>,
    value: Box<[u8]>,
}

impl XAttr {
    /// Split a full attribute name on the longest known prefix.  The empty
    /// prefix at index 0 always matches.
    pub fn new(name: &[u8], value: &[u8]) -> XAttr {
        for (idx, prefix) in XATTR_PREFIXES.iter().enumerate().rev() {
            if let Some(suffix) = name.strip_prefix(*prefix) {
                return XAttr {
                    prefix: idx as u8,
                    suffix: Box::from(suffix),
                    value: Box::from(value),
                };
            }
        }
        unreachable!()
    }

    fn entry_size(&self) -> usize {
        (size_of::<XAttrEntryHeader>() + self.suffix.len() + self.value.len()).next_multiple_of(4)
    }

    fn filter_bit(&self) -> u32 {
        1 << (xxh32(&self.suffix, XATTR_FILTER_SEED + self.prefix as u32) % 32)
    }
}

/// Bytes the inline xattr area occupies, zero when there are no xattrs.
pub fn ibody_size(xattrs: &[XAttr]) -> usize {
    if xattrs.is_empty() {
        return 0;
    }
    size_of::<InodeXAttrHeader>() + xattrs.iter().map(XAttr::entry_size).sum::<usize>()
}

/// `i_xattr_icount` for a given inline area size.
pub fn icount(ibody_size: usize) -> u16 {
    match ibody_size {
        0 => 0,
        n => (1 + (n - size_of::<InodeXAttrHeader>()) / 4) as u16,
    }
}

/// Append the inline xattr area to `out`.  Entries must already be sorted
/// by full name; every entry is padded to a 4-byte boundary.
pub fn write_ibody(out: &mut Vec<u8>, xattrs: &[XAttr]) {
    if xattrs.is_empty() {
        return;
    }
    let mut filter = 0u32;
    for attr in xattrs {
        filter |= attr.filter_bit();
    }
    out.extend_from_slice(
        InodeXAttrHeader {
            name_filter: (!filter).into(),
            shared_count: 0,
            ..Default::default()
        }
        .as_bytes(),
    );
    for attr in xattrs {
        let start = out.len();
        out.extend_from_slice(
            XAttrEntryHeader {
                name_len: attr.suffix.len() as u8,
                name_index: attr.prefix,
                value_size: (attr.value.len() as u16).into(),
            }
            .as_bytes(),
        );
        out.extend_from_slice(&attr.suffix);
        out.extend_from_slice(&attr.value);
        out.resize((out.len() - start).next_multiple_of(4) + start, 0);
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_prefix_split() {
        let a = XAttr::new(b"user.mime_type", b"text/plain");
        assert_eq!(a.prefix, 1);
        assert_eq!(&*a.suffix, b"mime_type");

        let b = XAttr::new(b"security.capability", b"x");
        assert_eq!(b.prefix, 6);

        let c = XAttr::new(b"unprefixed", b"x");
        assert_eq!(c.prefix, 0);
        assert_eq!(&*c.suffix, b"unprefixed");
    }

    #[test]
    fn test_ibody_size_and_icount() {
        assert_eq!(ibody_size(&[]), 0);
        assert_eq!(icount(0), 0);

        let attrs = [XAttr::new(b"user.a", b"bc")];
        // 12-byte header + (4 + 1 + 2 rounded up to 8)
        assert_eq!(ibody_size(&attrs), 20);
        assert_eq!(icount(20), 3);

        let mut out = Vec::new();
        write_ibody(&mut out, &attrs);
        assert_eq!(out.len(), 20);
        // entry header: name_len 1, index 1 (user.), value_size 2
        assert_eq!(&out[12..16], &[1, 1, 2, 0]);
        assert_eq!(&out[16..19], b"abc");
        assert_eq!(out[19], 0);
    }

    #[test]
    fn test_every_entry_multiple_of_four() {
        let attrs = [
            XAttr::new(b"user.a", b""),
            XAttr::new(b"trusted.xyz", b"0123456"),
            XAttr::new(b"plain", b"v"),
        ];
        let mut out = Vec::new();
        write_ibody(&mut out, &attrs);
        assert_eq!(out.len() % 4, 0);
        assert_eq!(out.len(), ibody_size(&attrs));
    }
}
