//! NFSv4 operation handlers
//!
//! One handler per operation. Handlers see only the [`CompoundContext`]; they
//! return `Err` for a plain failure status and `Ok` with a non-OK status only
//! when the failure carries data (LOCK/LOCKT `Denied`).

pub mod clientid;
pub mod filehandle;
pub mod io;
pub mod lock;
pub mod open;
pub mod session;

use super::compound::{CompoundContext, Nfs4OpArgs, Nfs4OpRes};
use super::state::{Nfs4State, StateKind};
use super::StateId;
use crate::error::{NfsResult, NfsStatus};

/// Result of an operation
pub type OpResult = NfsResult<Nfs4OpRes>;

/// Run one operation against the context
pub fn execute(ctx: &mut CompoundContext, args: &Nfs4OpArgs) -> OpResult {
    match args {
        Nfs4OpArgs::Access(args) => filehandle::process_access(ctx, args),
        Nfs4OpArgs::Close(args) => open::process_close(ctx, args),
        Nfs4OpArgs::GetAttr(args) => filehandle::process_getattr(ctx, args),
        Nfs4OpArgs::GetFh => filehandle::process_getfh(ctx),
        Nfs4OpArgs::Lock(args) => lock::process_lock(ctx, args),
        Nfs4OpArgs::LockT(args) => lock::process_lockt(ctx, args),
        Nfs4OpArgs::LockU(args) => lock::process_locku(ctx, args),
        Nfs4OpArgs::Lookup(args) => filehandle::process_lookup(ctx, args),
        Nfs4OpArgs::Open(args) => open::process_open(ctx, args),
        Nfs4OpArgs::OpenConfirm(args) => open::process_open_confirm(ctx, args),
        Nfs4OpArgs::OpenDowngrade(args) => open::process_open_downgrade(ctx, args),
        Nfs4OpArgs::PutFh(args) => filehandle::process_putfh(ctx, args),
        Nfs4OpArgs::PutRootFh => filehandle::process_putrootfh(ctx),
        Nfs4OpArgs::Read(args) => io::process_read(ctx, args),
        Nfs4OpArgs::Rename(args) => filehandle::process_rename(ctx, args),
        Nfs4OpArgs::Renew(args) => clientid::process_renew(ctx, args),
        Nfs4OpArgs::RestoreFh => filehandle::process_restorefh(ctx),
        Nfs4OpArgs::SaveFh => filehandle::process_savefh(ctx),
        Nfs4OpArgs::SetAttr(args) => filehandle::process_setattr(ctx, args),
        Nfs4OpArgs::SetClientId(args) => clientid::process_setclientid(ctx, args),
        Nfs4OpArgs::SetClientIdConfirm(args) => {
            clientid::process_setclientid_confirm(ctx, args)
        }
        Nfs4OpArgs::Write(args) => io::process_write(ctx, args),
        Nfs4OpArgs::ExchangeId(args) => session::process_exchange_id(ctx, args),
        Nfs4OpArgs::CreateSession(args) => session::process_create_session(ctx, args),
        Nfs4OpArgs::DestroySession(args) => session::process_destroy_session(ctx, args),
        Nfs4OpArgs::Sequence(args) => session::process_sequence(ctx, args),
        Nfs4OpArgs::DestroyClientId(args) => session::process_destroy_clientid(ctx, args),
        Nfs4OpArgs::ReclaimComplete(args) => session::process_reclaim_complete(ctx, args),
        Nfs4OpArgs::Unsupported(_) => Err(NfsStatus::Notsupp.into()),
        Nfs4OpArgs::Illegal => Err(NfsStatus::OpIllegal.into()),
    }
}

/// Resolve a client-presented stateid to the state it names
///
/// Resolves the current-stateid sentinel, checks the state's kind (if given)
/// and its sequence number. In v4.1 a seqid of 0 means "whatever is current".
pub(crate) fn lookup_state(
    ctx: &CompoundContext,
    presented: &StateId,
    kind: Option<StateKind>,
) -> NfsResult<std::sync::Arc<Nfs4State>> {
    let stateid = ctx.resolve_stateid(presented)?;
    if stateid.is_special() {
        return Err(NfsStatus::BadStateid.into());
    }
    let client = ctx
        .state_handler()
        .resolve_client_for_state(&stateid)
        .map_err(|_| unknown_client_status(ctx))?;
    let state = client.state(&stateid)?;
    if kind.is_some_and(|kind| state.kind() != kind) {
        return Err(NfsStatus::BadStateid.into());
    }
    if !(ctx.minor_version() > 0 && stateid.seqid == 0) {
        state.validate_against(&stateid)?;
    }
    Ok(state)
}

/// Status for a stateid whose client is gone
pub(crate) fn unknown_client_status(ctx: &CompoundContext) -> NfsStatus {
    if ctx.minor_version() == 0 {
        NfsStatus::StaleStateid
    } else {
        NfsStatus::BadStateid
    }
}
