//! OPEN, OPEN_CONFIRM, OPEN_DOWNGRADE and CLOSE
//!
//! An open-owner holds at most one open state per file. Opening the same file
//! again upgrades that state's share modes and bumps its seqid; a first open
//! creates the state with seqid 1.

use std::sync::Arc;

use bytes::Bytes;
use nfs4d_common::FileHandle;
use tracing::debug;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::attr::AttributeMap;
use crate::nfs4::client::Nfs4Client;
use crate::nfs4::compound::{CompoundContext, Nfs4Op, Nfs4OpRes, OpResBody};
use crate::nfs4::state::{ShareAccess, ShareDeny, StateKind, StateOwner};
use crate::nfs4::{ChangeInfo, ClientId, StateId, Verifier};
use crate::vfs::{FileType, VfsError, ACCESS_EXTEND, ACCESS_MODIFY, ACCESS_READ};

/// Client must confirm the open with OPEN_CONFIRM (v4.0 only)
pub const OPEN4_RESULT_CONFIRM: u32 = 0x2;
/// Byte-range locks follow POSIX semantics
pub const OPEN4_RESULT_LOCKTYPE_POSIX: u32 = 0x4;

/// Attributes supplied with a create, still XDR-encoded
#[derive(Debug, Clone, Default)]
pub struct CreateAttrs {
    /// Attribute bitmap
    pub attr_mask: Vec<u32>,
    /// Attribute values
    pub attr_vals: Bytes,
}

/// createmode4
#[derive(Debug, Clone)]
pub enum CreateMode {
    /// Create, or open an existing file
    Unchecked(CreateAttrs),
    /// Create; fail if the file exists
    Guarded(CreateAttrs),
    /// Exclusive create keyed by a client verifier
    Exclusive(Verifier),
}

/// openflag4
#[derive(Debug, Clone)]
pub enum OpenHow {
    /// Open an existing file
    NoCreate,
    /// Create the file
    Create(CreateMode),
}

/// open_claim4
#[derive(Debug, Clone)]
pub enum OpenClaim {
    /// Open `name` in the current directory
    Null(String),
    /// Reclaim after a server restart; the current fh is the file
    Previous(u32),
    /// Open the current fh (v4.1)
    Fh,
    /// Delegation claims
    Other(u32),
}

/// OPEN arguments
#[derive(Debug, Clone)]
pub struct OpenArgs {
    /// Open-owner sequence id (v4.0)
    pub seqid: u32,
    /// OPEN4_SHARE_ACCESS_*
    pub share_access: u32,
    /// OPEN4_SHARE_DENY_*
    pub share_deny: u32,
    /// Client id of the open-owner
    pub client_id: ClientId,
    /// Open-owner
    pub owner: Bytes,
    /// Create or not
    pub how: OpenHow,
    /// What to open
    pub claim: OpenClaim,
}

/// OPEN result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRes {
    /// Open stateid
    pub stateid: StateId,
    /// Directory change for a named open
    pub change_info: ChangeInfo,
    /// OPEN4_RESULT_* flags
    pub rflags: u32,
    /// Attributes applied on create
    pub attrset: Vec<u32>,
}

/// Client performing an OPEN
///
/// v4.0 names the client in the arguments and runs the open-owner sequence
/// check; v4.1 takes the client from the session.
fn open_client(ctx: &CompoundContext, args: &OpenArgs) -> NfsResult<Arc<Nfs4Client>> {
    if ctx.minor_version() > 0 {
        return Ok(ctx.session_client()?);
    }
    let client = ctx.state_handler().client_by_id(args.client_id)?;
    if !client.is_confirmed() {
        return Err(NfsStatus::StaleClientId.into());
    }
    client.update_lease()?;
    client.validate_open_sequence(args.seqid)?;
    Ok(client)
}

/// Look up or create `name` in the current directory
fn open_by_name(
    ctx: &CompoundContext,
    name: &str,
    how: &OpenHow,
) -> NfsResult<(FileHandle, ChangeInfo, Vec<u32>)> {
    if name.is_empty() {
        return Err(NfsStatus::Inval.into());
    }
    let dir = ctx.current_fh()?;
    let fs = ctx.fs();
    let dir_stat = fs.getattr(&dir)?;
    match dir_stat.file_type {
        FileType::Directory => {}
        FileType::Symlink => return Err(NfsStatus::Symlink.into()),
        FileType::Regular => return Err(NfsStatus::Notdir.into()),
    }
    let before = dir_stat.change;

    let mode = match how {
        OpenHow::NoCreate => {
            let fh = fs.lookup(&dir, name)?;
            return Ok((fh, ChangeInfo::new(before, before, true), Vec::new()));
        }
        OpenHow::Create(mode) => mode,
    };

    match fs.lookup(&dir, name) {
        Ok(fh) => match mode {
            CreateMode::Unchecked(_) => Ok((fh, ChangeInfo::new(before, before, true), Vec::new())),
            CreateMode::Guarded(_) | CreateMode::Exclusive(_) => Err(NfsStatus::Exist.into()),
        },
        Err(VfsError::NotFound) => {
            let cred = &ctx.call().credential;
            if fs.access(&dir, cred, ACCESS_EXTEND)? & ACCESS_EXTEND == 0 {
                return Err(NfsStatus::Access.into());
            }
            let attrs = match mode {
                CreateMode::Unchecked(attrs) | CreateMode::Guarded(attrs) => {
                    AttributeMap::decode(&attrs.attr_mask, &attrs.attr_vals)?
                }
                CreateMode::Exclusive(_) => AttributeMap::default(),
            };
            let mut changes = attrs.to_set_attrs()?;
            let mode_bits = changes.mode.take().unwrap_or(0o644);
            let fh = fs.create(&dir, name, FileType::Regular, cred.uid, cred.gid, mode_bits)?;
            if !changes.is_empty() {
                fs.setattr(&fh, &changes)?;
            }
            let after = fs.getattr(&dir)?.change;
            Ok((fh, ChangeInfo::new(before, after, true), attrs.applied_bitmap()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Process OPEN operation
pub fn process_open(ctx: &mut CompoundContext, args: &OpenArgs) -> OpResult {
    let access = ShareAccess::from_wire(args.share_access)?;
    let deny = ShareDeny::from_wire(args.share_deny)?;
    let client = open_client(ctx, args)?;

    let unchanged = ChangeInfo::new(0, 0, true);
    let (fh, change_info, attrset) = match &args.claim {
        OpenClaim::Null(name) => open_by_name(ctx, name, &args.how)?,
        OpenClaim::Previous(_) => {
            if ctx.state_handler().has_grace_period_expired() || client.is_reclaim_completed() {
                return Err(NfsStatus::NoGrace.into());
            }
            (ctx.current_fh()?, unchanged, Vec::new())
        }
        OpenClaim::Fh if ctx.minor_version() > 0 => (ctx.current_fh()?, unchanged, Vec::new()),
        OpenClaim::Fh | OpenClaim::Other(_) => return Err(NfsStatus::Notsupp.into()),
    };

    match ctx.fs().getattr(&fh)?.file_type {
        FileType::Regular => {}
        FileType::Directory => return Err(NfsStatus::Isdir.into()),
        FileType::Symlink => return Err(NfsStatus::Symlink.into()),
    }
    let mut wanted = 0;
    if access.contains(ShareAccess::READ) {
        wanted |= ACCESS_READ;
    }
    if access.contains(ShareAccess::WRITE) {
        wanted |= ACCESS_MODIFY;
    }
    if ctx.fs().access(&fh, &ctx.call().credential, wanted)? != wanted {
        return Err(NfsStatus::Access.into());
    }

    let owner = StateOwner::new(client.id(), args.owner.clone());
    let (state, stateid) = match client.open_state_for(&owner, &fh) {
        Some(state) => {
            let (current_access, current_deny) = state.share();
            state.set_share(current_access.union(access), current_deny.union(deny));
            let stateid = state.bump_sequence();
            (state, stateid)
        }
        None => {
            let state = client.create_state(owner, None)?;
            state.bind_file(fh);
            state.set_share(access, deny);
            let stateid = state.stateid();
            (state, stateid)
        }
    };

    let mut rflags = OPEN4_RESULT_LOCKTYPE_POSIX;
    if ctx.minor_version() == 0 && !state.is_confirmed() {
        rflags |= OPEN4_RESULT_CONFIRM;
    } else {
        state.confirm();
    }

    debug!(stateid = %stateid, access = access.bits(), deny = deny.bits(), "open");
    ctx.set_current_fh(fh);
    ctx.set_current_stateid(stateid);
    Ok(Nfs4OpRes::ok(
        Nfs4Op::Open,
        OpResBody::Open(OpenRes {
            stateid,
            change_info,
            rflags,
            attrset,
        }),
    ))
}

/// OPEN_CONFIRM arguments
#[derive(Debug, Clone)]
pub struct OpenConfirmArgs {
    /// Stateid returned by OPEN
    pub open_stateid: StateId,
    /// Open-owner sequence id
    pub seqid: u32,
}

/// Process OPEN_CONFIRM operation (v4.0)
pub fn process_open_confirm(ctx: &mut CompoundContext, args: &OpenConfirmArgs) -> OpResult {
    let state = super::lookup_state(ctx, &args.open_stateid, Some(StateKind::Open))?;
    let client = ctx
        .state_handler()
        .resolve_client_for_state(&state.stateid())?;
    client.validate_open_sequence(args.seqid)?;
    state.confirm();
    let stateid = state.bump_sequence();
    ctx.set_current_stateid(stateid);
    Ok(Nfs4OpRes::ok(Nfs4Op::OpenConfirm, OpResBody::StateId(stateid)))
}

/// OPEN_DOWNGRADE arguments
#[derive(Debug, Clone)]
pub struct OpenDowngradeArgs {
    /// Open stateid
    pub open_stateid: StateId,
    /// Open-owner sequence id (v4.0)
    pub seqid: u32,
    /// New share access
    pub share_access: u32,
    /// New share deny
    pub share_deny: u32,
}

/// Process OPEN_DOWNGRADE operation
pub fn process_open_downgrade(ctx: &mut CompoundContext, args: &OpenDowngradeArgs) -> OpResult {
    let state = super::lookup_state(ctx, &args.open_stateid, Some(StateKind::Open))?;
    if ctx.minor_version() == 0 {
        ctx.state_handler()
            .resolve_client_for_state(&state.stateid())?
            .validate_open_sequence(args.seqid)?;
    }
    let access = ShareAccess::from_wire(args.share_access)?;
    let deny = ShareDeny::from_wire(args.share_deny)?;
    let (current_access, current_deny) = state.share();
    if !access.is_subset_of(current_access) || !deny.is_subset_of(current_deny) {
        return Err(NfsStatus::Inval.into());
    }
    state.set_share(access, deny);
    let stateid = state.bump_sequence();
    ctx.set_current_stateid(stateid);
    Ok(Nfs4OpRes::ok(Nfs4Op::OpenDowngrade, OpResBody::StateId(stateid)))
}

/// CLOSE arguments
#[derive(Debug, Clone)]
pub struct CloseArgs {
    /// Open-owner sequence id (v4.0)
    pub seqid: u32,
    /// Open stateid
    pub open_stateid: StateId,
}

/// Process CLOSE operation
///
/// Lock states opened under the open state are released with it.
pub fn process_close(ctx: &mut CompoundContext, args: &CloseArgs) -> OpResult {
    let state = super::lookup_state(ctx, &args.open_stateid, Some(StateKind::Open))?;
    let client = ctx
        .state_handler()
        .resolve_client_for_state(&state.stateid())?;
    let closed = if ctx.minor_version() == 0 {
        client.validate_open_sequence(args.seqid)?;
        state.bump_sequence()
    } else {
        StateId::INVALID
    };
    client.release_state(&state.stateid())?;
    debug!(stateid = %args.open_stateid, "close");
    Ok(Nfs4OpRes::ok(Nfs4Op::Close, OpResBody::StateId(closed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::compound::tests::{context, session_context};

    fn open_args(name: &str, access: u32, how: OpenHow) -> OpenArgs {
        OpenArgs {
            seqid: 0,
            share_access: access,
            share_deny: 0,
            client_id: 0,
            owner: Bytes::from_static(b"open-owner"),
            how,
            claim: OpenClaim::Null(name.to_string()),
        }
    }

    fn open(ctx: &mut CompoundContext, args: &OpenArgs) -> NfsResult<OpenRes> {
        ctx.set_current_fh(ctx.fs().root());
        match process_open(ctx, args)?.body {
            OpResBody::Open(res) => Ok(res),
            other => panic!("unexpected body {other:?}"),
        }
    }

    fn create() -> OpenHow {
        OpenHow::Create(CreateMode::Unchecked(CreateAttrs::default()))
    }

    #[test]
    fn test_open_create_and_close() {
        let (mut ctx, client) = session_context();
        let res = open(&mut ctx, &open_args("file", 1, create())).unwrap();
        assert_eq!(res.stateid.seqid, 1);
        assert_eq!(res.rflags & OPEN4_RESULT_CONFIRM, 0);
        assert!(res.change_info.after > res.change_info.before);
        assert_eq!(ctx.current_stateid().unwrap(), res.stateid);
        assert!(client.has_state(&res.stateid));

        let close = CloseArgs {
            seqid: 0,
            open_stateid: res.stateid,
        };
        process_close(&mut ctx, &close).unwrap();
        assert!(!client.has_state(&res.stateid));
        assert_eq!(
            process_close(&mut ctx, &close).unwrap_err().status(),
            NfsStatus::BadStateid
        );
    }

    #[test]
    fn test_open_missing_without_create() {
        let (mut ctx, _client) = session_context();
        let err = open(&mut ctx, &open_args("missing", 1, OpenHow::NoCreate)).unwrap_err();
        assert_eq!(err.status(), NfsStatus::Noent);
    }

    #[test]
    fn test_guarded_create_of_existing_file() {
        let (mut ctx, _client) = session_context();
        open(&mut ctx, &open_args("file", 1, create())).unwrap();
        let guarded = OpenHow::Create(CreateMode::Guarded(CreateAttrs::default()));
        let err = open(&mut ctx, &open_args("file", 1, guarded)).unwrap_err();
        assert_eq!(err.status(), NfsStatus::Exist);
    }

    #[test]
    fn test_open_directory_is_rejected() {
        let (mut ctx, _client) = session_context();
        let root = ctx.fs().root();
        ctx.fs()
            .create(&root, "dir", FileType::Directory, 0, 0, 0o755)
            .unwrap();
        let err = open(&mut ctx, &open_args("dir", 1, OpenHow::NoCreate)).unwrap_err();
        assert_eq!(err.status(), NfsStatus::Isdir);
    }

    #[test]
    fn test_reopen_upgrades_existing_state() {
        let (mut ctx, client) = session_context();
        let first = open(&mut ctx, &open_args("file", 1, create())).unwrap();
        let second = open(&mut ctx, &open_args("file", 2, create())).unwrap();
        assert!(first.stateid.same_state(&second.stateid));
        assert_eq!(second.stateid.seqid, 2);
        assert_eq!(client.state_count(), 1);

        let state = client.state(&second.stateid).unwrap();
        assert_eq!(state.share().0, ShareAccess::BOTH);
    }

    #[test]
    fn test_downgrade_must_narrow() {
        let (mut ctx, client) = session_context();
        let res = open(&mut ctx, &open_args("file", 3, create())).unwrap();

        let mut args = OpenDowngradeArgs {
            open_stateid: res.stateid,
            seqid: 0,
            share_access: 1,
            share_deny: 0,
        };
        let downgraded = match process_open_downgrade(&mut ctx, &args).unwrap().body {
            OpResBody::StateId(stateid) => stateid,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(downgraded.seqid, 2);
        assert_eq!(
            client.state(&downgraded).unwrap().share().0,
            ShareAccess::READ
        );

        args.open_stateid = downgraded;
        args.share_access = 3;
        assert_eq!(
            process_open_downgrade(&mut ctx, &args).unwrap_err().status(),
            NfsStatus::Inval
        );
    }

    #[test]
    fn test_old_stateid_after_upgrade() {
        let (mut ctx, _client) = session_context();
        let first = open(&mut ctx, &open_args("file", 1, create())).unwrap();
        open(&mut ctx, &open_args("file", 1, create())).unwrap();
        let close = CloseArgs {
            seqid: 0,
            open_stateid: first.stateid,
        };
        assert_eq!(
            process_close(&mut ctx, &close).unwrap_err().status(),
            NfsStatus::OldStateid
        );
    }

    #[test]
    fn test_reclaim_after_grace() {
        let (mut ctx, client) = session_context();
        client.reclaim_complete().unwrap();
        let mut args = open_args("file", 1, OpenHow::NoCreate);
        args.claim = OpenClaim::Previous(0);
        let err = open(&mut ctx, &args).unwrap_err();
        assert_eq!(err.status(), NfsStatus::NoGrace);
    }

    #[test]
    fn test_v40_open_needs_confirm() {
        let mut ctx = context(0);
        let client = ctx
            .state_handler()
            .register_client(crate::nfs4::client::tests::registration("v40"));
        client.set_confirmed();

        let mut args = open_args("file", 1, create());
        args.client_id = client.id();
        args.seqid = 7;
        let res = open(&mut ctx, &args).unwrap();
        assert_ne!(res.rflags & OPEN4_RESULT_CONFIRM, 0);

        let confirm = OpenConfirmArgs {
            open_stateid: res.stateid,
            seqid: 8,
        };
        let confirmed = match process_open_confirm(&mut ctx, &confirm).unwrap().body {
            OpResBody::StateId(stateid) => stateid,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(confirmed.seqid, 2);
        assert!(client.state(&confirmed).unwrap().is_confirmed());

        // replayed open-owner seqid
        let replay = OpenConfirmArgs {
            open_stateid: confirmed,
            seqid: 8,
        };
        assert_eq!(
            process_open_confirm(&mut ctx, &replay).unwrap_err().status(),
            NfsStatus::SeqMisordered
        );
    }

    #[test]
    fn test_v40_open_unconfirmed_client() {
        let mut ctx = context(0);
        let client = ctx
            .state_handler()
            .register_client(crate::nfs4::client::tests::registration("v40"));
        let mut args = open_args("file", 1, create());
        args.client_id = client.id();
        let err = open(&mut ctx, &args).unwrap_err();
        assert_eq!(err.status(), NfsStatus::StaleClientId);
    }
}
