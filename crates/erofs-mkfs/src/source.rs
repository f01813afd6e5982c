//! Source tree scanning.
//!
//! The builder consumes the source directory through a pull interface:
//! `scan` walks the tree once, capturing per-entry metadata, xattrs and
//! symlink targets, and recording hardlinks by `(st_dev, st_ino)`.
//! Regular-file payload is not read here; the builder streams it later
//! through the stored path.

use std::{
    collections::HashMap,
    ffi::{CStr, OsStr, OsString},
    mem::MaybeUninit,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::{
    fd::{AsFd, AsRawFd, OwnedFd},
    fs::{fstat, openat, readlinkat, AtFlags, Dir, FileType, Mode, OFlags, CWD},
    io::Errno,
};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default)]
pub struct NodeStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub mtime_nsec: u32,
    pub size: u64,
    pub rdev: u64,
    pub dev: u64,
    pub ino: u64,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Directory { children: Vec<usize> },
    Regular,
    Symlink { target: Box<[u8]> },
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
    /// A later visit of an already-seen `(dev, ino)` pair.
    Hardlink { original: usize },
}

#[derive(Clone, Debug)]
pub struct SourceNode {
    pub name: OsString,
    /// Path relative to the scan root, used for compression-hint matching.
    pub rel_path: String,
    /// Full path for re-opening regular files at write time.
    pub path: PathBuf,
    pub stat: NodeStat,
    /// Sorted by full attribute name.
    pub xattrs: Vec<(Box<[u8]>, Box<[u8]>)>,
    pub kind: NodeKind,
}

pub struct SourceTree {
    pub nodes: Vec<SourceNode>,
    pub root: usize,
}

impl SourceTree {
    pub fn scan(path: &Path) -> Result<SourceTree> {
        let mut scanner = Scanner {
            nodes: Vec::new(),
            hardlinks: HashMap::new(),
        };
        let root = scanner.read_directory(CWD, path, OsStr::new(""), String::new(), path)?;
        Ok(SourceTree {
            nodes: scanner.nodes,
            root,
        })
    }

    /// Node indices in breadth-first order, directories before their
    /// contents and children in sorted name order.  This is the tree-walk
    /// order that fixes inode numbering.
    pub fn walk_order(&self) -> Vec<usize> {
        let mut order = vec![self.root];
        let mut queue = std::collections::VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            if let NodeKind::Directory { children } = &self.nodes[idx].kind {
                for &child in children {
                    if !matches!(self.nodes[child].kind, NodeKind::Hardlink { .. }) {
                        order.push(child);
                    }
                    if matches!(self.nodes[child].kind, NodeKind::Directory { .. }) {
                        queue.push_back(child);
                    }
                }
            }
        }
        order
    }
}

struct Scanner {
    nodes: Vec<SourceNode>,
    hardlinks: HashMap<(u64, u64), usize>,
}

/// Formats a string like "/proc/self/fd/3" for the given fd, usable with
/// kernel interfaces that reject the fd itself (xattr calls on O_PATH).
fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}

fn read_xattrs(fd: impl AsFd) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
    use rustix::fs::{getxattr, listxattr};

    let filename = proc_self_fd(&fd);
    let mut xattrs = Vec::new();

    let mut names = [MaybeUninit::new(0u8); 65536];
    let names = match listxattr(&filename, &mut names) {
        Ok((names, _)) => names,
        Err(Errno::OPNOTSUPP) => return Ok(xattrs),
        Err(e) => return Err(Error::Io(e.into())),
    };

    for name in names.split_inclusive(|c| *c == 0) {
        let name = CStr::from_bytes_with_nul(name)
            .map_err(|_| Error::Corrupt("malformed xattr name list".into()))?;
        let mut buffer = [MaybeUninit::new(0u8); 65536];
        let (value, _) = getxattr(&filename, name, &mut buffer).map_err(std::io::Error::from)?;
        xattrs.push((Box::from(name.to_bytes()), Box::from(value)));
    }

    xattrs.sort();
    Ok(xattrs)
}

fn node_stat(fd: impl AsFd) -> Result<NodeStat> {
    let buf = fstat(fd).map_err(std::io::Error::from)?;
    Ok(NodeStat {
        mode: buf.st_mode as u32,
        uid: buf.st_uid,
        gid: buf.st_gid,
        mtime: buf.st_mtime as i64,
        mtime_nsec: buf.st_mtime_nsec as u32,
        size: buf.st_size as u64,
        rdev: buf.st_rdev as u64,
        dev: buf.st_dev as u64,
        ino: buf.st_ino as u64,
    })
}

impl Scanner {
    fn read_leaf(
        &mut self,
        dirfd: &OwnedFd,
        name: &OsStr,
        rel_path: String,
        full_path: PathBuf,
        ifmt: FileType,
    ) -> Result<usize> {
        let oflags = match ifmt {
            FileType::RegularFile => OFlags::RDONLY,
            _ => OFlags::PATH,
        };
        let fd = openat(
            dirfd,
            name,
            oflags | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(std::io::Error::from)?;

        let stat = node_stat(&fd)?;

        // NB: checking st_nlink > 1 here would miss hardlinks on
        // filesystems that report it unreliably, so every leaf is tracked.
        let key = (stat.dev, stat.ino);
        if let Some(&original) = self.hardlinks.get(&key) {
            debug!("hardlink {rel_path} -> node {original}");
            self.nodes.push(SourceNode {
                name: name.to_os_string(),
                rel_path,
                path: full_path,
                stat,
                xattrs: Vec::new(),
                kind: NodeKind::Hardlink { original },
            });
            return Ok(self.nodes.len() - 1);
        }

        let kind = match ifmt {
            FileType::RegularFile => NodeKind::Regular,
            FileType::Symlink => {
                let target = readlinkat(&fd, "", Vec::new()).map_err(std::io::Error::from)?;
                NodeKind::Symlink {
                    target: Box::from(target.as_bytes()),
                }
            }
            FileType::CharacterDevice => NodeKind::CharacterDevice,
            FileType::BlockDevice => NodeKind::BlockDevice,
            FileType::Fifo => NodeKind::Fifo,
            FileType::Socket => NodeKind::Socket,
            FileType::Directory | FileType::Unknown => {
                return Error::invalid(format!("unexpected file type for {rel_path:?}"))
            }
        };

        let xattrs = read_xattrs(&fd)?;
        self.nodes.push(SourceNode {
            name: name.to_os_string(),
            rel_path,
            path: full_path,
            stat,
            xattrs,
            kind,
        });
        let idx = self.nodes.len() - 1;
        self.hardlinks.insert(key, idx);
        Ok(idx)
    }

    fn read_directory(
        &mut self,
        dirfd: impl AsFd,
        open_as: impl rustix::path::Arg,
        name: &OsStr,
        rel_path: String,
        full_path: &Path,
    ) -> Result<usize> {
        let fd = openat(
            dirfd,
            open_as,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(std::io::Error::from)?;

        let stat = node_stat(&fd)?;
        let xattrs = read_xattrs(&fd)?;

        // reserve the slot so the directory precedes its contents
        let idx = self.nodes.len();
        self.nodes.push(SourceNode {
            name: name.to_os_string(),
            rel_path: rel_path.clone(),
            path: full_path.to_path_buf(),
            stat,
            xattrs,
            kind: NodeKind::Directory {
                children: Vec::new(),
            },
        });

        let mut names = Vec::new();
        for item in Dir::read_from(&fd).map_err(std::io::Error::from)? {
            let entry = item.map_err(std::io::Error::from)?;
            let entry_name = OsStr::from_bytes(entry.file_name().to_bytes()).to_os_string();
            if entry_name == "." || entry_name == ".." {
                continue;
            }
            if entry_name.as_bytes().len() > crate::format::MAX_NAME_LEN {
                return Error::invalid(format!("entry name too long under {rel_path:?}"));
            }
            let mut ifmt = entry.file_type();
            if ifmt == FileType::Unknown {
                // some filesystems do not fill d_type; fall back to fstatat
                let st = rustix::fs::statat(&fd, &entry_name, AtFlags::SYMLINK_NOFOLLOW)
                    .map_err(std::io::Error::from)?;
                ifmt = FileType::from_raw_mode(st.st_mode);
            }
            names.push((entry_name, ifmt));
        }
        names.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let mut children = Vec::with_capacity(names.len());
        for (entry_name, ifmt) in names {
            let child_rel = if rel_path.is_empty() {
                entry_name.to_string_lossy().into_owned()
            } else {
                format!("{}/{}", rel_path, entry_name.to_string_lossy())
            };
            let child_path = full_path.join(&entry_name);
            let child = if ifmt == FileType::Directory {
                self.read_directory(&fd, entry_name.as_os_str(), &entry_name, child_rel, &child_path)?
            } else {
                match self.read_leaf(&fd, &entry_name, child_rel, child_path, ifmt) {
                    Ok(child) => child,
                    Err(Error::Io(e)) if e.raw_os_error() == Some(Errno::NOENT.raw_os_error()) => {
                        warn!("entry vanished during scan: {entry_name:?}");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };
            children.push(child);
        }

        if let NodeKind::Directory {
            children: slot,
        } = &mut self.nodes[idx].kind
        {
            *slot = children;
        }
        Ok(idx)
    }
}
