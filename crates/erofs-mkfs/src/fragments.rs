//! Tail-fragment deduplication against the packed inode.
//!
//! File tails are appended to a scratch file that later becomes the packed
//! inode's payload.  A 65536-bucket index keyed by the CRC32C of a tail's
//! last 16 bytes content-addresses windows of the scratch file; `find`
//! returns the longest match whose overlap extends past the 16-byte key
//! via a byte-by-byte back-scan, ties broken by earliest insertion.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, trace};

use crate::checksum::crc32c;
use crate::error::Result;

/// Bytes of a file tail hashed into the index key.
pub const TOF_HASHLEN: u64 = 16;

const FRAGMENT_HASHSIZE: usize = 65536;

/// Upper bound on the candidate window held in memory during a lookup;
/// longer overlaps are confirmed by re-reading both files.
const FRAGMENT_INMEM_MAX: u64 = 256 * 1024;

struct FragmentItem {
    pos: u64,
    data: Box<[u8]>,
}

pub struct FragmentIndex {
    buckets: Vec<Vec<FragmentItem>>,
    packed: File,
    packed_len: u64,
    saved_by_deduplication: u64,
}

fn bucket_of(crc: u32) -> usize {
    (crc & 0xFFFF) as usize
}

impl FragmentIndex {
    /// The scratch file is created under `TMPDIR` and unlinked immediately.
    pub fn new() -> Result<FragmentIndex> {
        let mut buckets = Vec::with_capacity(FRAGMENT_HASHSIZE);
        buckets.resize_with(FRAGMENT_HASHSIZE, Vec::new);
        Ok(FragmentIndex {
            buckets,
            packed: tempfile::tempfile_in(std::env::temp_dir())?,
            packed_len: 0,
            saved_by_deduplication: 0,
        })
    }

    pub fn packed_file(&self) -> &File {
        &self.packed
    }

    pub fn packed_len(&self) -> u64 {
        self.packed_len
    }

    pub fn saved_by_deduplication(&self) -> u64 {
        self.saved_by_deduplication
    }

    pub(crate) fn forfeit_saved(&mut self, amount: u64) {
        self.saved_by_deduplication -= amount.min(self.saved_by_deduplication);
    }

    /// CRC32C of the last 16 bytes of `file`; files not longer than the
    /// hash window are never fragmented.
    pub fn tof_crc(file: &File, size: u64) -> Result<Option<u32>> {
        if size <= TOF_HASHLEN {
            return Ok(None);
        }
        let mut tail = [0u8; TOF_HASHLEN as usize];
        file.read_exact_at(&mut tail, size - TOF_HASHLEN)?;
        Ok(Some(crc32c(!0, &tail)))
    }

    /// Longest already-packed window ending in the same 16 tail bytes as
    /// `file`.  Returns the fragment `(pos, len)` inside the packed inode.
    pub fn find(&mut self, file: &File, size: u64, crc: u32) -> Result<Option<(u64, u64)>> {
        let bucket = &self.buckets[bucket_of(crc)];
        if bucket.is_empty() {
            return Ok(None);
        }

        let s1 = size.min(FRAGMENT_INMEM_MAX);
        let mut data = vec![0u8; s1 as usize];
        file.read_exact_at(&mut data, size - s1)?;
        let e1 = (s1 - TOF_HASHLEN) as usize;

        let mut best: Option<(&FragmentItem, u64)> = None;
        for item in bucket {
            let len = item.data.len() as u64;
            if len <= TOF_HASHLEN {
                continue;
            }
            let e2 = (len - TOF_HASHLEN) as usize;
            if data[e1..e1 + TOF_HASHLEN as usize] != item.data[e2..e2 + TOF_HASHLEN as usize] {
                continue;
            }

            // extend the match backwards from the key
            let mn = e1.min(e2);
            let mut i = 0usize;
            while i < mn && item.data[e2 - i - 1] == data[e1 - i - 1] {
                i += 1;
            }
            let mut deduped = i as u64 + TOF_HASHLEN;

            if deduped >= s1 {
                // the in-memory window fully matched; keep comparing
                // backwards through the packed file itself
                deduped = s1;
                let mut pos = item.pos + len - s1;
                let mut buf0 = [0u8; 16384];
                let mut buf1 = [0u8; 16384];
                while deduped < size && pos > 0 {
                    let sz = pos.min(16384).min(size - deduped);
                    if self
                        .packed
                        .read_exact_at(&mut buf0[..sz as usize], pos - sz)
                        .is_err()
                    {
                        break;
                    }
                    if file
                        .read_exact_at(&mut buf1[..sz as usize], size - deduped - sz)
                        .is_err()
                    {
                        break;
                    }
                    if buf0[..sz as usize] != buf1[..sz as usize] {
                        break;
                    }
                    pos -= sz;
                    deduped += sz;
                }
            }

            let improved = match best {
                Some((_, prev)) => deduped > prev,
                None => true,
            };
            if improved {
                best = Some((item, deduped));
                if deduped == size {
                    break;
                }
            }
        }

        let found =
            best.map(|(item, deduped)| (item.pos + item.data.len() as u64 - deduped, deduped));
        if let Some((pos, deduped)) = found {
            debug!("deduped {deduped} tail bytes at packed offset {pos}");
            self.saved_by_deduplication += deduped;
        }
        Ok(found)
    }

    /// Append `tail_len` trailing bytes of `file` to the packed inode and
    /// index them for later matches.  Returns the fragment `(pos, len)`.
    pub fn append_tail(&mut self, file: &File, size: u64, tail_len: u64) -> Result<(u64, u64)> {
        let mut data = vec![0u8; tail_len as usize];
        file.read_exact_at(&mut data, size - tail_len)?;

        let pos = self.packed_len;
        self.packed.write_all_at(&data, pos)?;
        self.packed_len += tail_len;

        if tail_len > TOF_HASHLEN {
            let key = crc32c(!0, &data[(tail_len - TOF_HASHLEN) as usize..]);
            trace!("pack {tail_len} tail bytes at {pos}, bucket {}", bucket_of(key));
            self.buckets[bucket_of(key)].push(FragmentItem {
                pos,
                data: data.into_boxed_slice(),
            });
        }
        Ok((pos, tail_len))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use std::io::Write;

    use super::*;

    fn file_with(content: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f
    }

    #[test]
    fn test_short_files_have_no_key() {
        let f = file_with(&[7u8; 16]);
        assert_eq!(FragmentIndex::tof_crc(&f, 16).unwrap(), None);
        let f = file_with(&[7u8; 17]);
        assert!(FragmentIndex::tof_crc(&f, 17).unwrap().is_some());
    }

    #[test]
    fn test_identical_tails_dedupe_to_same_offset() {
        let mut idx = FragmentIndex::new().unwrap();
        let content = vec![0x5Au8; 1024];

        let a = file_with(&content);
        let crc = FragmentIndex::tof_crc(&a, 1024).unwrap().unwrap();
        assert_eq!(idx.find(&a, 1024, crc).unwrap(), None);
        let (pos_a, len_a) = idx.append_tail(&a, 1024, 1024).unwrap();
        assert_eq!((pos_a, len_a), (0, 1024));

        let b = file_with(&content);
        let (pos_b, len_b) = idx.find(&b, 1024, crc).unwrap().unwrap();
        assert_eq!(pos_b, pos_a);
        assert_eq!(len_b, 1024);
        assert!(idx.saved_by_deduplication() >= 1024);
    }

    #[test]
    fn test_partial_tail_match() {
        let mut idx = FragmentIndex::new().unwrap();

        // first file: 100 bytes, all 0xAA tail
        let a = file_with(&[0xAA; 100]);
        idx.append_tail(&a, 100, 100).unwrap();

        // second file shares only the last 40 bytes
        let mut content = vec![0x11u8; 60];
        content.extend_from_slice(&[0xAA; 40]);
        let b = file_with(&content);
        let crc = FragmentIndex::tof_crc(&b, 100).unwrap().unwrap();
        let (pos, len) = idx.find(&b, 100, crc).unwrap().unwrap();
        assert_eq!(len, 40);
        assert_eq!(pos, 60);
    }

    #[test]
    fn test_ties_break_to_earliest_insertion() {
        let mut idx = FragmentIndex::new().unwrap();
        let content = vec![0xCCu8; 64];

        let a = file_with(&content);
        let (first_pos, _) = idx.append_tail(&a, 64, 64).unwrap();
        let b = file_with(&content);
        // force a second identical window into the index
        idx.append_tail(&b, 64, 64).unwrap();

        let c = file_with(&content);
        let crc = FragmentIndex::tof_crc(&c, 64).unwrap().unwrap();
        let (pos, len) = idx.find(&c, 64, crc).unwrap().unwrap();
        assert_eq!((pos, len), (first_pos, 64));
    }
}
