//! The interfaces the filesystem collaborator consumes: on-media inode,
//! directory and block-extent objects ([`inode`]), the orphaned-inode list
//! ([`orphan`]), volatile reference-counted inode handles ([`vinode`]) and
//! the argument-validation surface ([`flags`]). Path resolution and the
//! POSIX syscall layer live outside this crate; everything here is the
//! durable and transactional substrate they build on.

pub mod flags;
pub mod inode;
pub mod orphan;
pub mod vinode;

pub use flags::{validate_open_flags, Access, OpenFlags, AT_CWD, NAME_MAX};
pub use inode::{FileType, Inode, Metadata};
pub use orphan::{InodeArray, OrphanSlot};
pub use vinode::{Vinode, VinodeSet};
