//! Path-regex compression hints.
//!
//! Each non-comment line of a hints file reads
//! `<pclustersize> [<compressor_slot>] <regex>`, selecting the physical
//! cluster size and compressor slot for every file whose root-relative
//! path matches the regex.  When a hints file is configured it acts as an
//! allow-list: files matching no line are stored uncompressed.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::debug;
use regex_automata::meta::Regex;

use crate::error::{Error, Result};

struct CompressHint {
    regex: Regex,
    pcluster_blks: u32,
    slot: usize,
}

pub struct CompressHints {
    hints: Vec<CompressHint>,
    /// Cluster size (in blocks) used when no hints file is configured.
    default_pcluster_blks: u32,
}

/// The compression decision for one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HintMatch {
    pub pcluster_blks: u32,
    pub slot: usize,
}

impl CompressHints {
    /// With no hints file, every file compresses with slot 0 and a
    /// single-block cluster.
    pub fn all_files(default_pcluster_blks: u32) -> CompressHints {
        CompressHints {
            hints: Vec::new(),
            default_pcluster_blks,
        }
    }

    /// Parse a hints file.  Returns the hints and the largest cluster size
    /// (in bytes) any line requested, which may raise the global maximum.
    pub fn load(path: &Path, block_size: u32, n_slots: usize) -> Result<(CompressHints, u32)> {
        let file = File::open(path)?;
        let mut hints = Vec::new();
        let mut max_pcluster = 0u32;

        for (line_nr, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line_nr = line_nr + 1;

            let mut parts = line.split_whitespace();
            let pclustersize = match parts.next() {
                None => continue,
                Some(comment) if comment.starts_with('#') => continue,
                Some(field) => field.parse::<u32>().map_err(|_| {
                    Error::InvalidArgument(format!("line {line_nr}: invalid pclustersize"))
                })?,
            };
            if pclustersize == 0 || pclustersize % block_size != 0 {
                return Error::invalid(format!(
                    "line {line_nr}: pclustersize {pclustersize} is not a positive multiple of the block size"
                ));
            }

            let (slot, pattern) = match (parts.next(), parts.next()) {
                (Some(pattern), None) => (0usize, pattern),
                (Some(slot), Some(pattern)) => {
                    let slot = slot.parse::<usize>().map_err(|_| {
                        Error::InvalidArgument(format!("line {line_nr}: invalid compressor slot"))
                    })?;
                    if slot >= n_slots {
                        return Error::invalid(format!(
                            "line {line_nr}: compressor slot {slot} is not configured"
                        ));
                    }
                    (slot, pattern)
                }
                (None, _) => {
                    return Error::invalid(format!("line {line_nr}: missing match pattern"))
                }
            };
            if parts.next().is_some() {
                return Error::invalid(format!("line {line_nr}: trailing data"));
            }

            let regex = Regex::new(pattern).map_err(|e| {
                Error::InvalidArgument(format!("line {line_nr}: invalid regex {pattern:?} ({e})"))
            })?;
            debug!("compress hint {pattern:?} ({} blocks, slot {slot})", pclustersize / block_size);
            hints.push(CompressHint {
                regex,
                pcluster_blks: pclustersize / block_size,
                slot,
            });
            max_pcluster = max_pcluster.max(pclustersize);
        }

        Ok((
            CompressHints {
                hints,
                default_pcluster_blks: 0,
            },
            max_pcluster,
        ))
    }

    /// First matching hint wins, in file order.  `None` means the file is
    /// stored uncompressed.
    pub fn apply(&self, rel_path: &str) -> Option<HintMatch> {
        for hint in &self.hints {
            if hint.regex.is_match(rel_path) {
                return Some(HintMatch {
                    pcluster_blks: hint.pcluster_blks,
                    slot: hint.slot,
                });
            }
        }
        if self.default_pcluster_blks > 0 {
            return Some(HintMatch {
                pcluster_blks: self.default_pcluster_blks,
                slot: 0,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use std::io::Write;

    use super::*;

    fn write_hints(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_parse_and_apply() {
        let f = write_hints("# logs compress well\n8192 0 \\.log$\n\n4096 1 ^data/\n");
        let (hints, max) = CompressHints::load(f.path(), 4096, 2).unwrap();
        assert_eq!(max, 8192);

        assert_eq!(
            hints.apply("var/app.log"),
            Some(HintMatch {
                pcluster_blks: 2,
                slot: 0
            })
        );
        assert_eq!(
            hints.apply("data/blob"),
            Some(HintMatch {
                pcluster_blks: 1,
                slot: 1
            })
        );
        assert_eq!(hints.apply("app.bin"), None);
    }

    #[test]
    fn test_first_match_wins() {
        let f = write_hints("8192 \\.log$\n4096 .*\n");
        let (hints, _) = CompressHints::load(f.path(), 4096, 1).unwrap();
        assert_eq!(hints.apply("x.log").unwrap().pcluster_blks, 2);
        assert_eq!(hints.apply("x.txt").unwrap().pcluster_blks, 1);
    }

    #[test]
    fn test_bad_lines_rejected() {
        for bad in [
            "12 \\.log$\n",        // not a block multiple
            "0 \\.log$\n",         // zero
            "4096\n",              // missing pattern
            "4096 5 \\.log$\n",    // unconfigured slot
            "4096 0 f[oo\n",       // bad regex
            "4096 0 \\.log$ x\n",  // trailing junk
        ] {
            let f = write_hints(bad);
            assert!(
                CompressHints::load(f.path(), 4096, 1).is_err(),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn test_all_files_default() {
        let hints = CompressHints::all_files(1);
        assert_eq!(
            hints.apply("anything"),
            Some(HintMatch {
                pcluster_blks: 1,
                slot: 0
            })
        );
    }
}
