//! Error taxonomy shared by the allocator, the redo machinery, and the
//! filesystem collaborator surface. Every public operation returns
//! [`Result`]; callers that speak errno obtain the value via
//! [`Error::errno`].

use thiserror::Error;

/// Errors surfaced by pool, allocator and filesystem-object operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The allocator could not satisfy a reservation.
    #[error("out of persistent memory")]
    NoSpace,

    /// The allocation constructor asked for the operation to be unwound.
    #[error("operation canceled by constructor")]
    Canceled,

    /// A malformed argument: bad flag combination, bad offset, bad size.
    #[error("invalid argument: {0}")]
    Inval(&'static str),

    /// The named entry does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// The named entry already exists.
    #[error("file exists")]
    Exists,

    /// A directory operation was applied to a non-directory inode.
    #[error("not a directory")]
    NotDir,

    /// A file operation was applied to a directory inode.
    #[error("is a directory")]
    IsDir,

    /// A path component exceeds the 255-byte limit.
    #[error("file name too long")]
    NameTooLong,

    /// An open flag that the pool refuses outright (`O_ASYNC`, `O_PATH`,
    /// unknown bits).
    #[error("unsupported open flag")]
    UnsupportedFlag,

    /// The operation context ran out of redo-log capacity. This is a
    /// programming error in the caller: the batch must be split.
    #[error("redo log capacity exceeded")]
    Capacity,

    /// The pool image is damaged: checksum mismatch on a finished redo log,
    /// an impossible chunk state, or a half-formatted superblock. Never
    /// repaired silently.
    #[error("pool corruption: {0}")]
    Corruption(&'static str),

    /// An underlying file operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The process-local errno value this error maps to.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoSpace => libc::ENOSPC,
            Error::Canceled => libc::ECANCELED,
            Error::Inval(_) => libc::EINVAL,
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::NotDir => libc::ENOTDIR,
            Error::IsDir => libc::EISDIR,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::UnsupportedFlag => libc::EINVAL,
            Error::Capacity => libc::ENOMEM,
            Error::Corruption(_) => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// A `Result` with the crate-wide error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(Error::Canceled.errno(), libc::ECANCELED);
        assert_eq!(Error::Exists.errno(), libc::EEXIST);
        assert_eq!(Error::NameTooLong.errno(), libc::ENAMETOOLONG);
        assert_eq!(Error::UnsupportedFlag.errno(), libc::EINVAL);
    }
}
