//! Failure taxonomy for package unpacking and import.
//!
//! The leaf components (archive reader, header parser, tree builder) return
//! these directly.  Orchestration code wraps them in [`anyhow::Error`] with
//! added context; callers can still recover the kind with
//! `err.downcast_ref::<Error>()`.

use thiserror::Error;

/// A fatal error while reading, reconciling or importing a package.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    /// Decompression or framing failure in the payload.
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),
    /// Header record count or shape mismatch.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),
    /// A device node, fifo or socket in the payload.
    #[error("Unsupported file type for path '{0}'")]
    UnsupportedFileType(String),
    #[error("Hardlink target '{0}' not found")]
    HardlinkTargetMissing(String),
    #[error("Hardlink target '{0}' is a directory")]
    HardlinkTargetIsDirectory(String),
    /// A hardlink to a symbolic link or other non-regular file.
    #[error("Hardlink target '{0}' is not a regular file")]
    HardlinkTargetNotRegular(String),
    /// Two entries of different kinds declared at the same path.
    #[error("Conflicting entry at '{0}'")]
    AlreadyExists(String),
    /// A path whose ancestor is not a directory.
    #[error("Parent of '{0}' is not a directory")]
    InvalidParent(String),
    /// Uplinks, embedded NUL or non-UTF-8 names.
    #[error("Invalid path '{0}'")]
    InvalidPath(String),
    #[error("Too many levels of symbolic links resolving '{0}'")]
    SymlinkLoop(String),
    #[error("Unknown user '{0}'")]
    UnknownUser(String),
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),
    #[error("Invalid capabilities '{0}'")]
    InvalidCapabilities(String),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Expected package {expected}, found {found}")]
    NevraMismatch { expected: String, found: String },
}

/// The type of Result.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Find the first [`Error`] in an error chain, if any.  This also looks
    /// inside [`std::io::Error`] values, which is how failures surface from
    /// streams read through [`std::io::Read`].
    pub fn find(e: &anyhow::Error) -> Option<&Error> {
        e.chain().find_map(|c| {
            c.downcast_ref::<Error>().or_else(|| {
                c.downcast_ref::<std::io::Error>()
                    .and_then(|e| e.get_ref())
                    .and_then(|e| e.downcast_ref::<Error>())
            })
        })
    }

    /// Wrap into an [`std::io::Error`] for use inside a reader.
    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }
}
