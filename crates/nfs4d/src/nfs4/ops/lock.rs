//! Byte-range locking: LOCK, LOCKT, LOCKU
//!
//! A lock state is created under an open state the first time a lock-owner
//! locks through that open. Disposing the lock state (CLOSE, lease expiry,
//! client removal) drops every range it still holds.

use std::sync::Arc;

use bytes::Bytes;
use nfs4d_common::{ByteRangeLock, CommonError, FileHandle, LockError, LockMode, LockOwner};
use tracing::debug;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::client::Nfs4Client;
use crate::nfs4::compound::{CompoundContext, Nfs4Op, Nfs4OpRes, OpResBody};
use crate::nfs4::state::{Nfs4State, ShareAccess, StateKind, StateOwner};
use crate::nfs4::{ClientId, StateId};

/// Lock type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockType {
    /// Read lock
    ReadLt = 1,
    /// Write lock
    WriteLt = 2,
    /// Read lock with wait
    ReadW = 3,
    /// Write lock with wait
    WriteW = 4,
}

impl TryFrom<u32> for LockType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ReadLt),
            2 => Ok(Self::WriteLt),
            3 => Ok(Self::ReadW),
            4 => Ok(Self::WriteW),
            _ => Err(NfsStatus::Inval),
        }
    }
}

impl LockType {
    /// Check if this is a write lock
    pub fn is_write(&self) -> bool {
        matches!(self, Self::WriteLt | Self::WriteW)
    }

    fn mode(&self) -> LockMode {
        if self.is_write() {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

/// Who is locking
#[derive(Debug, Clone)]
pub enum Locker {
    /// First lock by this lock-owner under an open
    New {
        /// Open-owner sequence id (v4.0)
        open_seqid: u32,
        /// Open stateid the lock state is created under
        open_stateid: StateId,
        /// Lock-owner sequence id
        lock_seqid: u32,
        /// Lock-owner
        owner: Bytes,
    },
    /// Lock-owner already has a lock state
    Existing {
        /// Lock stateid
        lock_stateid: StateId,
        /// Lock-owner sequence id
        lock_seqid: u32,
    },
}

/// LOCK arguments
#[derive(Debug, Clone)]
pub struct LockArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Reclaim after server restart
    pub reclaim: bool,
    /// Start offset
    pub offset: u64,
    /// Length (`u64::MAX` = to end of file)
    pub length: u64,
    /// Lock-owner and state
    pub locker: Locker,
}

/// Conflicting lock reported with `NFS4ERR_DENIED`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenied {
    /// Start of the conflicting range
    pub offset: u64,
    /// Length of the conflicting range
    pub length: u64,
    /// Type of the conflicting lock
    pub lock_type: LockType,
    /// Holder of the conflicting lock
    pub owner: LockOwner,
}

impl From<ByteRangeLock> for LockDenied {
    fn from(lock: ByteRangeLock) -> Self {
        Self {
            offset: lock.offset,
            length: lock.length,
            lock_type: match lock.mode {
                LockMode::Exclusive => LockType::WriteLt,
                LockMode::Shared => LockType::ReadLt,
            },
            owner: lock.owner,
        }
    }
}

/// Reject empty and overflowing ranges
fn check_range(offset: u64, length: u64) -> Result<(), NfsStatus> {
    if length == 0 {
        return Err(NfsStatus::Inval);
    }
    if length != u64::MAX && offset.checked_add(length).is_none() {
        return Err(NfsStatus::Inval);
    }
    Ok(())
}

/// The state must refer to the current file
fn check_file(state: &Nfs4State, fh: &FileHandle) -> Result<(), NfsStatus> {
    if state.file().as_ref() == Some(fh) {
        Ok(())
    } else {
        Err(NfsStatus::BadStateid)
    }
}

/// Find or create the lock state for a LOCK request
///
/// The flag is true when the state was created by this request.
fn lock_state(
    ctx: &CompoundContext,
    fh: &FileHandle,
    args: &LockArgs,
) -> NfsResult<(Arc<Nfs4Client>, Arc<Nfs4State>, bool)> {
    match &args.locker {
        Locker::New {
            open_seqid,
            open_stateid,
            owner,
            ..
        } => {
            let open = super::lookup_state(ctx, open_stateid, Some(StateKind::Open))?;
            let client = ctx
                .state_handler()
                .resolve_client_for_state(&open.stateid())?;
            if ctx.minor_version() == 0 {
                client.update_lease()?;
                client.validate_open_sequence(*open_seqid)?;
            }
            check_file(&open, fh)?;
            if args.lock_type.is_write() && !open.share().0.contains(ShareAccess::WRITE) {
                return Err(NfsStatus::OpenMode.into());
            }

            let lock_owner = StateOwner::new(client.id(), owner.clone());
            if let Some(state) = client.lock_state_for(&open.stateid(), &lock_owner) {
                return Ok((client, state, false));
            }
            let state = client.create_state(lock_owner, Some(open))?;
            let manager = Arc::clone(ctx.lock_manager());
            let file_id = fh.file_id();
            let held_by = state.owner().to_lock_owner();
            state.add_dispose_listener(move |_| {
                manager.unlock(file_id, &held_by, 0, u64::MAX);
            });
            Ok((client, state, true))
        }
        Locker::Existing { lock_stateid, .. } => {
            let state = super::lookup_state(ctx, lock_stateid, Some(StateKind::Lock))?;
            let client = ctx
                .state_handler()
                .resolve_client_for_state(&state.stateid())?;
            if ctx.minor_version() == 0 {
                client.update_lease()?;
            }
            check_file(&state, fh)?;
            if args.lock_type.is_write() && !state.share().0.contains(ShareAccess::WRITE) {
                return Err(NfsStatus::OpenMode.into());
            }
            Ok((client, state, false))
        }
    }
}

/// Process LOCK operation
pub fn process_lock(ctx: &mut CompoundContext, args: &LockArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    check_range(args.offset, args.length)?;
    if args.reclaim
        && (ctx.minor_version() > 0 && ctx.session_client()?.is_reclaim_completed()
            || ctx.state_handler().has_grace_period_expired())
    {
        return Err(NfsStatus::NoGrace.into());
    }

    let (client, state, created) = lock_state(ctx, &fh, args)?;
    let request = ByteRangeLock::new(
        state.owner().to_lock_owner(),
        fh.file_id(),
        args.offset,
        args.length,
        args.lock_type.mode(),
    );

    match ctx.lock_manager().acquire(request) {
        Ok(_) => {
            let stateid = if created {
                state.stateid()
            } else {
                state.bump_sequence()
            };
            ctx.set_current_stateid(stateid);
            Ok(Nfs4OpRes::ok(Nfs4Op::Lock, OpResBody::StateId(stateid)))
        }
        Err(LockError::Conflict(conflict)) => {
            if created {
                client.release_state(&state.stateid())?;
            }
            debug!(
                file_id = fh.file_id(),
                offset = args.offset,
                length = args.length,
                holder = ?conflict.owner,
                "lock denied"
            );
            Ok(Nfs4OpRes::denied(Nfs4Op::Lock, conflict.into()))
        }
        Err(err) => {
            if created {
                client.release_state(&state.stateid())?;
            }
            Err(CommonError::from(err).into())
        }
    }
}

/// LOCKT arguments
#[derive(Debug, Clone)]
pub struct LockTArgs {
    /// Lock type to test
    pub lock_type: LockType,
    /// Start offset
    pub offset: u64,
    /// Length
    pub length: u64,
    /// Client id of the lock-owner (v4.0; v4.1 uses the session's client)
    pub client_id: ClientId,
    /// Lock-owner whose own locks are ignored
    pub owner: Bytes,
}

/// Process LOCKT operation
pub fn process_lockt(ctx: &mut CompoundContext, args: &LockTArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    check_range(args.offset, args.length)?;
    let client_id = if ctx.minor_version() > 0 {
        ctx.session_client()?.id()
    } else {
        let client = ctx.state_handler().client_by_id(args.client_id)?;
        client.update_lease()?;
        client.id()
    };
    let owner = LockOwner::new(client_id, args.owner.clone());

    match ctx.lock_manager().test(
        fh.file_id(),
        Some(&owner),
        args.offset,
        args.length,
        args.lock_type.mode(),
    ) {
        Some(conflict) => Ok(Nfs4OpRes::denied(Nfs4Op::LockT, conflict.into())),
        None => Ok(Nfs4OpRes::ok(Nfs4Op::LockT, OpResBody::None)),
    }
}

/// LOCKU arguments
#[derive(Debug, Clone)]
pub struct LockUArgs {
    /// Lock type being released
    pub lock_type: LockType,
    /// Lock-owner sequence id
    pub seqid: u32,
    /// Lock stateid
    pub lock_stateid: StateId,
    /// Start offset
    pub offset: u64,
    /// Length
    pub length: u64,
}

/// Process LOCKU operation
///
/// Releases every lock of the owner overlapping the range; ranges are not split.
pub fn process_locku(ctx: &mut CompoundContext, args: &LockUArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    check_range(args.offset, args.length)?;
    let state = super::lookup_state(ctx, &args.lock_stateid, Some(StateKind::Lock))?;
    check_file(&state, &fh)?;
    if ctx.minor_version() == 0 {
        ctx.state_handler()
            .update_client_lease_by_stateid(&state.stateid())?;
    }

    let released = ctx.lock_manager().unlock(
        fh.file_id(),
        &state.owner().to_lock_owner(),
        args.offset,
        args.length,
    );
    let stateid = state.bump_sequence();
    debug!(stateid = %stateid, released, "unlock");
    ctx.set_current_stateid(stateid);
    Ok(Nfs4OpRes::ok(Nfs4Op::LockU, OpResBody::StateId(stateid)))
}
