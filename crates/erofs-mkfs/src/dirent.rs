//! Directory block encoding.
//!
//! A directory's entries are sorted by byte-wise name comparison, split
//! greedily into block-sized groups, and each group is encoded as packed
//! 12-byte headers followed by the concatenated names.  The u16 in each
//! header is the name's start offset within the block, so the first name
//! begins at `12 * entry_count`.

use zerocopy::IntoBytes;

use crate::format::{DirentHeader, FileType, DIRENT_SIZE};

#[derive(Clone, Debug)]
pub struct Dirent {
    pub name: Box<[u8]>,
    pub file_type: FileType,
    /// Index of the referenced node; resolved to an nid at encode time.
    pub node: usize,
}

impl Dirent {
    fn encoded_size(&self) -> u64 {
        (DIRENT_SIZE + self.name.len()) as u64
    }
}

/// How a sorted entry list lays out on disk: per-group entry counts, with
/// the final group stored inline when `tail_size > 0`.
#[derive(Clone, Debug, Default)]
pub struct DirLayout {
    /// Entry count of each full directory block.
    pub blocks: Vec<usize>,
    /// Entries of the trailing inline group (0 if it ended on a boundary).
    pub tail_entries: usize,
    pub tail_size: u64,
    /// Total directory size: full blocks plus the inline tail.
    pub size: u64,
}

/// Split `entries` into block-sized groups.  Entries must be sorted.
pub fn plan(entries: &[Dirent], block_size: u64) -> DirLayout {
    let mut layout = DirLayout::default();
    let mut group = 0usize;
    let mut n_bytes = 0u64;

    for entry in entries {
        let sz = entry.encoded_size();
        debug_assert!(sz <= block_size);
        if n_bytes + sz > block_size {
            layout.blocks.push(group);
            group = 0;
            n_bytes = 0;
        }
        group += 1;
        n_bytes += sz;
    }
    if n_bytes == block_size {
        // an exactly-full trailing group is a regular block, not a tail
        layout.blocks.push(group);
        group = 0;
        n_bytes = 0;
    }
    layout.tail_entries = group;
    layout.tail_size = n_bytes;
    layout.size = layout.blocks.len() as u64 * block_size + n_bytes;
    layout
}

/// Encode one group of entries; `nid_of` resolves an entry's node index.
pub fn encode_block(entries: &[Dirent], nid_of: impl Fn(usize) -> u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut name_off = DIRENT_SIZE * entries.len();
    for entry in entries {
        out.extend_from_slice(
            DirentHeader {
                nid: nid_of(entry.node).into(),
                name_off: (name_off as u16).into(),
                file_type: entry.file_type.into(),
                reserved: 0,
            }
            .as_bytes(),
        );
        name_off += entry.name.len();
    }
    for entry in entries {
        out.extend_from_slice(&entry.name);
    }
    out
}

/// Insert an entry into an already-sorted list, keeping byte-wise order.
pub fn insert_sorted(entries: &mut Vec<Dirent>, entry: Dirent) {
    let point = entries.partition_point(|e| e.name < entry.name);
    entries.insert(point, entry);
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn ent(name: &str) -> Dirent {
        Dirent {
            name: name.as_bytes().into(),
            file_type: FileType::RegularFile,
            node: 0,
        }
    }

    #[test]
    fn test_plan_single_tail() {
        // ".", ".." and one file fit inline
        let entries = [ent("."), ent(".."), ent("hello")];
        let layout = plan(&entries, 4096);
        assert_eq!(layout.blocks.len(), 0);
        assert_eq!(layout.tail_entries, 3);
        assert_eq!(layout.tail_size, 36 + 8);
        assert_eq!(layout.size, 44);
    }

    #[test]
    fn test_plan_splits_blocks() {
        // 1000 entries of 12 + 5 = 17 bytes each; 240 fit per 4096 block
        let entries: Vec<_> = (0..1000).map(|i| ent(&format!("f{i:04}"))).collect();
        let layout = plan(&entries, 4096);
        assert_eq!(layout.blocks, vec![240, 240, 240, 240]);
        assert_eq!(layout.tail_entries, 40);
        assert_eq!(layout.size, 4 * 4096 + 40 * 17);
    }

    #[test]
    fn test_plan_exact_fill_is_a_block() {
        // 256 entries of exactly 16 bytes fill one 4096-byte block
        let entries: Vec<_> = (0..256).map(|i| ent(&format!("a{i:03}"))).collect();
        let layout = plan(&entries, 4096);
        assert_eq!(layout.blocks, vec![256]);
        assert_eq!(layout.tail_entries, 0);
        assert_eq!(layout.tail_size, 0);
        assert_eq!(layout.size, 4096);
    }

    #[test]
    fn test_encode_block() {
        let entries = [ent("."), ent(".."), ent("hello")];
        let out = encode_block(&entries, |_| 7);
        assert_eq!(out.len(), 44);
        // first name starts right after the last header
        assert_eq!(u16::from_le_bytes([out[8], out[9]]), 36);
        assert_eq!(u16::from_le_bytes([out[20], out[21]]), 37);
        assert_eq!(u16::from_le_bytes([out[32], out[33]]), 39);
        assert_eq!(&out[36..], b"...hello".as_ref());
        assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 7);
    }

    #[test]
    fn test_insert_sorted() {
        let mut entries = vec![ent("b"), ent("d")];
        insert_sorted(&mut entries, ent("c"));
        insert_sorted(&mut entries, ent("a"));
        let names: Vec<&[u8]> = entries.iter().map(|e| &*e.name).collect();
        assert_eq!(names, vec![b"a" as &[u8], b"b", b"c", b"d"]);
    }
}
