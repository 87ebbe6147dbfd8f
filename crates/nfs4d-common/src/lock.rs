//! Byte-range lock manager
//!
//! Locks are owned by a [`LockOwner`], the pair of a client id and the opaque
//! owner string the client chose. Locks held by the same owner never conflict
//! with each other, so an owner can re-lock or upgrade a range it already holds.
//!
//! Ranges follow NFSv4 conventions: a length of `u64::MAX` extends to the end
//! of the file and a zero length is rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;

use crate::error::CommonError;

/// Unique identifier for a file (file id from its handle)
pub type FileId = u64;

/// Lock token for tracking active locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(u64);

impl LockToken {
    /// Create a new lock token
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the token value
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Lock owner: client id plus client-chosen owner bytes
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    /// Owning client
    pub client_id: u64,
    /// Opaque owner identifier
    pub owner: Bytes,
}

impl LockOwner {
    /// Create a lock owner
    pub fn new(client_id: u64, owner: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            owner: owner.into(),
        }
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}/{}", self.client_id, hex::encode(&self.owner))
    }
}

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared/read lock (multiple allowed)
    Shared,
    /// Exclusive/write lock (single holder)
    Exclusive,
}

/// Byte-range lock
#[derive(Debug, Clone)]
pub struct ByteRangeLock {
    /// Lock token (assigned by the manager on acquire)
    pub token: LockToken,
    /// Lock owner
    pub owner: LockOwner,
    /// File being locked
    pub file_id: FileId,
    /// Start offset
    pub offset: u64,
    /// Length of range (`u64::MAX` = to end of file)
    pub length: u64,
    /// Lock mode
    pub mode: LockMode,
    /// When the lock was acquired
    pub acquired_at: Instant,
}

impl ByteRangeLock {
    /// Create a new byte-range lock request
    pub fn new(owner: LockOwner, file_id: FileId, offset: u64, length: u64, mode: LockMode) -> Self {
        Self {
            token: LockToken::new(0),
            owner,
            file_id,
            offset,
            length,
            mode,
            acquired_at: Instant::now(),
        }
    }

    /// Exclusive end of the range
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Check if this lock overlaps with a range
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        self.offset < offset.saturating_add(length) && offset < self.end()
    }

    /// Check if this lock conflicts with another lock request
    pub fn conflicts_with(&self, offset: u64, length: u64, mode: LockMode) -> bool {
        if !self.overlaps(offset, length) {
            return false;
        }
        !(self.mode == LockMode::Shared && mode == LockMode::Shared)
    }
}

/// Lock error types
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// Lock conflicts with an existing lock
    #[error("conflicts with lock {:?} held by {:?}", .0.token, .0.owner)]
    Conflict(ByteRangeLock),
    /// Invalid lock parameters
    #[error("invalid lock: {0}")]
    Invalid(String),
}

impl From<LockError> for CommonError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict(lock) => {
                CommonError::LockConflict(format!("conflicts with lock {:?}", lock.token))
            }
            LockError::Invalid(msg) => CommonError::LockRange(msg),
        }
    }
}

/// Lock manager trait
pub trait LockManager: Send + Sync {
    /// Acquire a byte-range lock
    fn acquire(&self, lock: ByteRangeLock) -> Result<LockToken, LockError>;

    /// Release every lock of `owner` on `file_id` overlapping the range
    fn unlock(&self, file_id: FileId, owner: &LockOwner, offset: u64, length: u64) -> usize;

    /// Find a lock that would conflict with the request, ignoring `owner`'s own locks
    fn test(
        &self,
        file_id: FileId,
        owner: Option<&LockOwner>,
        offset: u64,
        length: u64,
        mode: LockMode,
    ) -> Option<ByteRangeLock>;

    /// Get all locks for a file
    fn file_locks(&self, file_id: FileId) -> Vec<ByteRangeLock>;
}

/// File lock state
#[derive(Default)]
struct FileLockState {
    locks: BTreeMap<(u64, LockToken), ByteRangeLock>,
}

impl FileLockState {
    fn find_conflict(
        &self,
        offset: u64,
        length: u64,
        mode: LockMode,
        exclude_owner: Option<&LockOwner>,
    ) -> Option<&ByteRangeLock> {
        self.locks.values().find(|lock| {
            exclude_owner != Some(&lock.owner) && lock.conflicts_with(offset, length, mode)
        })
    }
}

/// In-memory lock manager for single-node deployments
#[derive(Default)]
pub struct InMemoryLockManager {
    /// Locks by file ID
    file_locks: DashMap<FileId, RwLock<FileLockState>>,
    /// Next token ID
    next_token: AtomicU64,
}

impl InMemoryLockManager {
    /// Create a new in-memory lock manager
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            ..Default::default()
        }
    }

    fn allocate_token(&self) -> LockToken {
        LockToken::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire(&self, mut lock: ByteRangeLock) -> Result<LockToken, LockError> {
        if lock.length == 0 {
            return Err(LockError::Invalid("zero length".to_string()));
        }
        if lock.offset.checked_add(lock.length).is_none() && lock.length != u64::MAX {
            return Err(LockError::Invalid("range overflows".to_string()));
        }

        let token = self.allocate_token();
        lock.token = token;

        let state = self.file_locks.entry(lock.file_id).or_default();
        let mut state = state.write();

        if let Some(conflict) =
            state.find_conflict(lock.offset, lock.length, lock.mode, Some(&lock.owner))
        {
            return Err(LockError::Conflict(conflict.clone()));
        }

        state.locks.insert((lock.offset, token), lock);
        Ok(token)
    }

    fn unlock(&self, file_id: FileId, owner: &LockOwner, offset: u64, length: u64) -> usize {
        let Some(state) = self.file_locks.get(&file_id) else {
            return 0;
        };
        let mut state = state.write();
        let before = state.locks.len();
        state
            .locks
            .retain(|_, lock| !(lock.owner == *owner && lock.overlaps(offset, length)));
        before - state.locks.len()
    }

    fn test(
        &self,
        file_id: FileId,
        owner: Option<&LockOwner>,
        offset: u64,
        length: u64,
        mode: LockMode,
    ) -> Option<ByteRangeLock> {
        let state = self.file_locks.get(&file_id)?;
        let state = state.read();
        state.find_conflict(offset, length, mode, owner).cloned()
    }

    fn file_locks(&self, file_id: FileId) -> Vec<ByteRangeLock> {
        self.file_locks
            .get(&file_id)
            .map(|state| state.read().locks.values().cloned().collect())
            .unwrap_or_default()
    }
}
