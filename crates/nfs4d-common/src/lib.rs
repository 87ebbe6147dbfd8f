//! Building blocks shared by the nfs4d server
//!
//! This crate holds the protocol-neutral pieces the NFSv4 state core relies on:
//! - Filehandle generation (stable, opaque, checksummed handles)
//! - Byte-range lock management with owner-scoped conflicts

#![warn(missing_docs)]

pub mod error;
pub mod filehandle;
pub mod lock;

pub use error::{CommonError, CommonResult};
pub use filehandle::{FileHandle, FileHandleVersion};
pub use lock::{
    ByteRangeLock, FileId, InMemoryLockManager, LockError, LockManager, LockMode, LockOwner,
    LockToken,
};
