//! Error types shared by every subsystem of the image builder.

use std::io;

use thiserror::Error;

/// Failures that abort or redirect an image build.
///
/// Allocator and serializer errors are fatal to the build; `NoSpace` and
/// `CodecFailure` are additionally used as control flow by the compression
/// driver, which falls back to an uncompressed layout instead of aborting.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer head (plus its required extension) cannot fit into a single
    /// block, or an inline tail will not fit next to its inode.
    #[error("no space in buffer block: {0}")]
    NoSpace(&'static str),

    /// `attach` or `balloon` was called on a head that is not the tail of
    /// its buffer block.
    #[error("operation requires the tail buffer head: {0}")]
    InvalidHead(&'static str),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("I/O error")]
    Io(#[from] io::Error),

    /// The superblock read back for checksum finalisation does not carry
    /// the expected magic number.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    #[error("compression codec failure: {0}")]
    CodecFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid<T>(msg: impl Into<String>) -> Result<T> {
        Err(Error::InvalidArgument(msg.into()))
    }
}
