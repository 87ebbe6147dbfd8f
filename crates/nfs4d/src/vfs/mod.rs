//! Filesystem backend interface
//!
//! Operations reach file data and metadata only through [`VirtualFileSystem`].
//! Objects are addressed by [`FileHandle`]; the backend owns the mapping from
//! handles to whatever it stores.

mod memory;

use std::time::SystemTime;

use bytes::Bytes;
use nfs4d_common::FileHandle;
use thiserror::Error;

use crate::error::NfsStatus;
use crate::rpc::RpcCredential;

pub use memory::MemoryFs;

/// ACCESS4_READ
pub const ACCESS_READ: u32 = 0x01;
/// ACCESS4_LOOKUP
pub const ACCESS_LOOKUP: u32 = 0x02;
/// ACCESS4_MODIFY
pub const ACCESS_MODIFY: u32 = 0x04;
/// ACCESS4_EXTEND
pub const ACCESS_EXTEND: u32 = 0x08;
/// ACCESS4_DELETE
pub const ACCESS_DELETE: u32 = 0x10;
/// ACCESS4_EXECUTE
pub const ACCESS_EXECUTE: u32 = 0x20;

/// Filesystem backend errors
#[derive(Debug, Error)]
pub enum VfsError {
    /// No such file or directory
    #[error("not found")]
    NotFound,
    /// Target already exists
    #[error("already exists")]
    Exists,
    /// Expected a directory
    #[error("not a directory")]
    NotDir,
    /// Expected a non-directory
    #[error("is a directory")]
    IsDir,
    /// Permission denied
    #[error("access denied")]
    Access,
    /// Handle no longer refers to a live object
    #[error("stale handle")]
    Stale,
    /// Unusable name or argument
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Backend I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfsError {
    /// NFS status for this error
    pub fn status(&self) -> NfsStatus {
        match self {
            VfsError::NotFound => NfsStatus::Noent,
            VfsError::Exists => NfsStatus::Exist,
            VfsError::NotDir => NfsStatus::Notdir,
            VfsError::IsDir => NfsStatus::Isdir,
            VfsError::Access => NfsStatus::Access,
            VfsError::Stale => NfsStatus::Stale,
            VfsError::Invalid(_) => NfsStatus::Inval,
            VfsError::Io(_) => NfsStatus::Io,
        }
    }
}

/// Result type for filesystem operations
pub type VfsResult<T> = Result<T, VfsError>;

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

/// File attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// File id
    pub file_id: u64,
    /// File type
    pub file_type: FileType,
    /// Permission bits
    pub mode: u32,
    /// Link count
    pub nlink: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Last access
    pub atime: SystemTime,
    /// Last data modification
    pub mtime: SystemTime,
    /// Last metadata change
    pub ctime: SystemTime,
    /// Change counter, bumped on every modification
    pub change: u64,
}

/// Time value requested by SETATTR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// Use the server's clock
    ServerTime,
    /// Use the client-supplied time
    ClientTime(SystemTime),
}

impl SetTime {
    /// Resolve to an absolute time
    pub fn resolve(self) -> SystemTime {
        match self {
            SetTime::ServerTime => SystemTime::now(),
            SetTime::ClientTime(t) => t,
        }
    }
}

/// Attribute changes requested by SETATTR or OPEN(create)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrs {
    /// New size (truncate or extend)
    pub size: Option<u64>,
    /// New permission bits
    pub mode: Option<u32>,
    /// New owner
    pub uid: Option<u32>,
    /// New group
    pub gid: Option<u32>,
    /// New access time
    pub atime: Option<SetTime>,
    /// New modification time
    pub mtime: Option<SetTime>,
}

impl SetAttrs {
    /// True if nothing is requested
    pub fn is_empty(&self) -> bool {
        *self == SetAttrs::default()
    }
}

/// Filesystem backend
pub trait VirtualFileSystem: Send + Sync {
    /// Handle of the exported root directory
    fn root(&self) -> FileHandle;

    /// Read attributes
    fn getattr(&self, fh: &FileHandle) -> VfsResult<Stat>;

    /// Change attributes, returning the updated attributes
    fn setattr(&self, fh: &FileHandle, attrs: &SetAttrs) -> VfsResult<Stat>;

    /// Resolve `name` inside directory `dir`
    fn lookup(&self, dir: &FileHandle, name: &str) -> VfsResult<FileHandle>;

    /// Create `name` inside directory `dir`
    fn create(
        &self,
        dir: &FileHandle,
        name: &str,
        file_type: FileType,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> VfsResult<FileHandle>;

    /// Read up to `count` bytes at `offset`; the flag is true at end of file
    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> VfsResult<(Bytes, bool)>;

    /// Write `data` at `offset`, returning the number of bytes written
    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> VfsResult<u32>;

    /// Move `from_name` in `from_dir` to `to_name` in `to_dir`
    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
    ) -> VfsResult<()>;

    /// Subset of the ACCESS4 bits in `mask` that `cred` is granted
    fn access(&self, fh: &FileHandle, cred: &RpcCredential, mask: u32) -> VfsResult<u32>;
}
