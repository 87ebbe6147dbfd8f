//! Open and lock state
//!
//! An [`Nfs4State`] is one piece of server-held state named by a stateid:
//! an open of a file by an open-owner, or the byte-range locks a lock-owner
//! holds under one of those opens. Every modification bumps the stateid's
//! sequence number so clients can detect stale copies.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use nfs4d_common::{FileHandle, LockOwner};
use parking_lot::Mutex;
use tracing::trace;

use super::{ClientId, StateId};
use crate::error::NfsStatus;

/// Owner of a state: client id plus the opaque owner the client chose
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StateOwner {
    /// Owning client
    pub client_id: ClientId,
    /// Owner identifier (opaque)
    pub owner: Bytes,
}

impl StateOwner {
    /// Create a new state owner
    pub fn new(client_id: ClientId, owner: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            owner: owner.into(),
        }
    }

    /// Same owner as seen by the lock manager
    pub fn to_lock_owner(&self) -> LockOwner {
        LockOwner::new(self.client_id, self.owner.clone())
    }
}

impl fmt::Debug for StateOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}/{}", self.client_id, hex::encode(&self.owner))
    }
}

/// Share access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareAccess(u32);

impl ShareAccess {
    /// Read access
    pub const READ: Self = Self(0x1);
    /// Write access
    pub const WRITE: Self = Self(0x2);
    /// Both read and write
    pub const BOTH: Self = Self(0x3);

    const MASK: u32 = 0x3;

    /// Decode the access part of `share_access`, ignoring delegation wants
    pub fn from_wire(bits: u32) -> Result<Self, NfsStatus> {
        match bits & 0xFF {
            0 => Err(NfsStatus::Inval),
            access if access & !Self::MASK != 0 => Err(NfsStatus::Inval),
            access => Ok(Self(access)),
        }
    }

    /// Check if contains a flag
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if every bit of `self` is also in `other`
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Access granted by either mode (OPEN upgrade)
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Share deny mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareDeny(u32);

impl ShareDeny {
    /// No deny
    pub const NONE: Self = Self(0x0);
    /// Deny read
    pub const READ: Self = Self(0x1);
    /// Deny write
    pub const WRITE: Self = Self(0x2);
    /// Deny both
    pub const BOTH: Self = Self(0x3);

    /// Decode `share_deny`
    pub fn from_wire(bits: u32) -> Result<Self, NfsStatus> {
        if bits & !0x3 != 0 {
            return Err(NfsStatus::Inval);
        }
        Ok(Self(bits))
    }

    /// True if every bit of `self` is also in `other`
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Deny both modes deny
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// What a state represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// An open of a file
    Open,
    /// Byte-range locks held under an open
    Lock,
}

type DisposeListener = Box<dyn FnOnce(&Nfs4State) + Send>;

/// One open or lock state
pub struct Nfs4State {
    other: [u8; 12],
    seqid: AtomicU32,
    owner: StateOwner,
    parent: Option<Arc<Nfs4State>>,
    file: OnceLock<FileHandle>,
    share: Mutex<(ShareAccess, ShareDeny)>,
    confirmed: AtomicBool,
    disposed: AtomicBool,
    listeners: Mutex<Vec<DisposeListener>>,
}

impl Nfs4State {
    /// Create a state named by `other`; lock states pass their open state as `parent`
    pub fn new(other: [u8; 12], owner: StateOwner, parent: Option<Arc<Nfs4State>>) -> Self {
        Self {
            other,
            seqid: AtomicU32::new(1),
            owner,
            parent,
            file: OnceLock::new(),
            share: Mutex::new((ShareAccess::default(), ShareDeny::NONE)),
            confirmed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current stateid
    pub fn stateid(&self) -> StateId {
        StateId::new(self.seqid.load(Ordering::Acquire), self.other)
    }

    /// The 12-byte `other` field naming this state
    pub fn other(&self) -> &[u8; 12] {
        &self.other
    }

    /// Open or lock
    pub fn kind(&self) -> StateKind {
        if self.parent.is_some() {
            StateKind::Lock
        } else {
            StateKind::Open
        }
    }

    /// Owner
    pub fn owner(&self) -> &StateOwner {
        &self.owner
    }

    /// Parent open state of a lock state
    pub fn parent(&self) -> Option<&Arc<Nfs4State>> {
        self.parent.as_ref()
    }

    /// Advance the sequence id after a state-modifying operation
    pub fn bump_sequence(&self) -> StateId {
        let seqid = self
            .seqid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                // seqid 0 is reserved for "current" in v4.1
                Some(if s == u32::MAX { 1 } else { s + 1 })
            })
            .map_or(1, |prev| if prev == u32::MAX { 1 } else { prev + 1 });
        StateId::new(seqid, self.other)
    }

    /// Compare a client-presented stateid with this state
    ///
    /// A presented sequence behind ours is `OldStateid`, one ahead of ours is
    /// `BadStateid`.
    pub fn validate_against(&self, presented: &StateId) -> Result<(), NfsStatus> {
        if presented.other != self.other {
            return Err(NfsStatus::BadStateid);
        }
        let current = self.seqid.load(Ordering::Acquire);
        match presented.seqid.cmp(&current) {
            std::cmp::Ordering::Less => Err(NfsStatus::OldStateid),
            std::cmp::Ordering::Greater => Err(NfsStatus::BadStateid),
            std::cmp::Ordering::Equal => Ok(()),
        }
    }

    /// Associate the file this state refers to; only the first call sticks
    pub fn bind_file(&self, fh: FileHandle) {
        let _ = self.file.set(fh);
    }

    /// File this state refers to; lock states inherit their open's file
    pub fn file(&self) -> Option<FileHandle> {
        self.file
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.file()))
    }

    /// Share access and deny of an open; lock states report their open's
    pub fn share(&self) -> (ShareAccess, ShareDeny) {
        match &self.parent {
            Some(parent) => parent.share(),
            None => *self.share.lock(),
        }
    }

    /// Replace share access and deny (OPEN upgrade, OPEN_DOWNGRADE)
    pub fn set_share(&self, access: ShareAccess, deny: ShareDeny) {
        *self.share.lock() = (access, deny);
    }

    /// v4.0 open confirmation
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Mark a v4.0 open as confirmed
    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::Release);
    }

    /// Register a callback run once when the state is disposed
    ///
    /// Registering on an already disposed state runs the callback immediately.
    pub fn add_dispose_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Nfs4State) + Send + 'static,
    {
        {
            let mut listeners = self.listeners.lock();
            if !self.disposed.load(Ordering::Acquire) {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    /// Run dispose listeners in registration order, once
    pub fn dispose(&self) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *listeners)
        };
        trace!(stateid = %self.stateid(), count = listeners.len(), "disposing state");
        for listener in listeners {
            listener(self);
        }
    }

    /// True once disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Nfs4State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nfs4State")
            .field("stateid", &self.stateid())
            .field("kind", &self.kind())
            .field("owner", &self.owner)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn open_state() -> Nfs4State {
        Nfs4State::new(StateId::other_for(1, 1), StateOwner::new(1, "owner"), None)
    }

    #[test]
    fn test_bump_and_validate() {
        let state = open_state();
        let first = state.stateid();
        assert_eq!(first.seqid, 1);
        assert!(state.validate_against(&first).is_ok());

        let second = state.bump_sequence();
        assert_eq!(second.seqid, 2);
        assert_eq!(state.validate_against(&first), Err(NfsStatus::OldStateid));
        assert!(state.validate_against(&second).is_ok());

        let ahead = StateId::new(5, *state.other());
        assert_eq!(state.validate_against(&ahead), Err(NfsStatus::BadStateid));
    }

    #[test]
    fn test_validate_other_mismatch() {
        let state = open_state();
        let foreign = StateId::new(1, StateId::other_for(1, 2));
        assert_eq!(state.validate_against(&foreign), Err(NfsStatus::BadStateid));
    }

    #[test]
    fn test_dispose_runs_listeners_once_in_order() {
        let state = open_state();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let calls = calls.clone();
            state.add_dispose_listener(move |_| calls.lock().push(i));
        }

        state.dispose();
        state.dispose();
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
        assert!(state.is_disposed());
    }

    #[test]
    fn test_listener_after_dispose_runs_immediately() {
        let state = open_state();
        state.dispose();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        state.add_dispose_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_state_inherits_from_parent() {
        let open = Arc::new(open_state());
        open.bind_file(FileHandle::new(9, 1, 0));
        open.set_share(ShareAccess::READ, ShareDeny::NONE);

        let lock = Nfs4State::new(
            StateId::other_for(1, 2),
            StateOwner::new(1, "lock-owner"),
            Some(open.clone()),
        );
        assert_eq!(lock.kind(), StateKind::Lock);
        assert_eq!(lock.file().map(|fh| fh.file_id()), Some(9));
        assert_eq!(lock.share().0, ShareAccess::READ);
    }

    #[test]
    fn test_share_access_wire() {
        assert_eq!(ShareAccess::from_wire(0x3).unwrap(), ShareAccess::BOTH);
        // delegation want bits are ignored
        assert_eq!(ShareAccess::from_wire(0x101).unwrap(), ShareAccess::READ);
        assert_eq!(ShareAccess::from_wire(0), Err(NfsStatus::Inval));
        assert!(ShareAccess::READ.is_subset_of(ShareAccess::BOTH));
        assert!(!ShareAccess::BOTH.is_subset_of(ShareAccess::WRITE));
        assert_eq!(ShareAccess::READ.union(ShareAccess::WRITE), ShareAccess::BOTH);
        assert_eq!(ShareDeny::from_wire(4), Err(NfsStatus::Inval));
    }
}
