//! Client and session establishment (NFSv4.1)
//!
//! EXCHANGE_ID registers a client, CREATE_SESSION confirms it and opens a
//! session, SEQUENCE binds a compound to a session slot.

use bytes::Bytes;
use tracing::{debug, info};

use super::OpResult;
use crate::error::NfsStatus;
use crate::nfs4::client::ClientRegistration;
use crate::nfs4::compound::{CompoundContext, Nfs4Op, Nfs4OpRes, OpResBody, SlotClaim};
use crate::nfs4::session::{ChannelAttrs, SlotSequence};
use crate::nfs4::state_handler::OwnerAction;
use crate::nfs4::{ClientId, SessionId, Verifier};

/// EXCHGID4_FLAG_USE_NON_PNFS
pub const EXCHGID4_FLAG_USE_NON_PNFS: u32 = 0x0001_0000;
/// EXCHGID4_FLAG_UPD_CONFIRMED_REC_A
pub const EXCHGID4_FLAG_UPD_CONFIRMED_REC_A: u32 = 0x4000_0000;
/// EXCHGID4_FLAG_CONFIRMED_R
pub const EXCHGID4_FLAG_CONFIRMED_R: u32 = 0x8000_0000;

/// EXCHANGE_ID arguments
#[derive(Debug, Clone)]
pub struct ExchangeIdArgs {
    /// Client owner id
    pub owner: Bytes,
    /// Client boot verifier
    pub verifier: Verifier,
    /// EXCHGID4_FLAG_* bits
    pub flags: u32,
    /// State protection; only SP4_NONE (0) is supported
    pub state_protect: u32,
}

/// EXCHANGE_ID result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeIdRes {
    /// Assigned client id
    pub client_id: ClientId,
    /// Sequence the first CREATE_SESSION must use
    pub sequence_id: u32,
    /// EXCHGID4_FLAG_* bits
    pub flags: u32,
    /// Server owner major id
    pub server_owner: String,
    /// Server scope
    pub server_scope: String,
}

/// Process EXCHANGE_ID operation
pub fn process_exchange_id(ctx: &mut CompoundContext, args: &ExchangeIdArgs) -> OpResult {
    if args.state_protect != 0 {
        return Err(NfsStatus::Notsupp.into());
    }

    let principal = ctx.call().credential.principal().to_string();
    let registration = ClientRegistration {
        owner: args.owner.clone(),
        verifier: args.verifier,
        principal: principal.clone(),
        remote_addr: ctx.call().remote_addr,
        local_addr: ctx.call().local_addr,
        minor_version: ctx.minor_version(),
    };
    let handler = ctx.state_handler();
    let update = args.flags & EXCHGID4_FLAG_UPD_CONFIRMED_REC_A != 0;

    let client = handler.register_owner(registration, |existing| match existing {
        None if update => Err(NfsStatus::Noent),
        None => Ok(OwnerAction::Register),
        Some(existing) if !existing.is_lease_valid() => {
            debug!(
                client = format_args!("{:016x}", existing.id()),
                "replacing client with expired lease"
            );
            Ok(OwnerAction::Register)
        }
        Some(existing) if existing.principal() != principal && existing.is_confirmed() => {
            Err(NfsStatus::ClidInUse)
        }
        Some(existing) if existing.verifier() == args.verifier || update => Ok(OwnerAction::Keep),
        Some(existing) => {
            info!(
                client = format_args!("{:016x}", existing.id()),
                "client rebooted, dropping its state"
            );
            Ok(OwnerAction::Register)
        }
    })?;

    let mut flags = EXCHGID4_FLAG_USE_NON_PNFS;
    if client.is_confirmed() {
        flags |= EXCHGID4_FLAG_CONFIRMED_R;
    }
    Ok(Nfs4OpRes::ok(
        Nfs4Op::ExchangeId,
        OpResBody::ExchangeId(ExchangeIdRes {
            client_id: client.id(),
            sequence_id: client.current_session_sequence(),
            flags,
            server_owner: ctx.config().server_owner.clone(),
            server_scope: ctx.config().server_scope.clone(),
        }),
    ))
}

/// CREATE_SESSION arguments
#[derive(Debug, Clone)]
pub struct CreateSessionArgs {
    /// Client id from EXCHANGE_ID
    pub client_id: ClientId,
    /// CREATE_SESSION sequence
    pub sequence: u32,
    /// CREATE_SESSION4_FLAG_* bits
    pub flags: u32,
    /// Requested fore channel attributes
    pub fore_channel: ChannelAttrs,
    /// Requested back channel attributes
    pub back_channel: ChannelAttrs,
}

/// CREATE_SESSION result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRes {
    /// New session id
    pub session_id: SessionId,
    /// Echoed sequence
    pub sequence: u32,
    /// Granted flags (no persistence, no back channel)
    pub flags: u32,
    /// Negotiated fore channel
    pub fore_channel: ChannelAttrs,
    /// Negotiated back channel
    pub back_channel: ChannelAttrs,
}

/// Process CREATE_SESSION operation
pub fn process_create_session(ctx: &mut CompoundContext, args: &CreateSessionArgs) -> OpResult {
    let handler = ctx.state_handler();
    let client = handler.client_by_id(args.client_id)?;
    if client.principal() != ctx.call().credential.principal() {
        return Err(NfsStatus::ClidInUse.into());
    }

    let config = ctx.config();
    let limits = ChannelAttrs {
        max_request_size: config.max_write_size.saturating_add(1024),
        max_response_size: config.max_read_size.saturating_add(1024),
        max_ops: config.max_compound_ops,
        max_requests: config.max_session_slots,
        ..ChannelAttrs::default()
    };
    let fore_channel = limits.negotiate(&args.fore_channel);
    let back_channel = ChannelAttrs::default().negotiate(&args.back_channel);

    let session = handler.create_session(&client, args.sequence, fore_channel)?;
    Ok(Nfs4OpRes::ok(
        Nfs4Op::CreateSession,
        OpResBody::CreateSession(CreateSessionRes {
            session_id: session.id(),
            sequence: session.sequence(),
            flags: 0,
            fore_channel: session.fore_channel().clone(),
            back_channel,
        }),
    ))
}

/// DESTROY_SESSION arguments
#[derive(Debug, Clone)]
pub struct DestroySessionArgs {
    /// Session to destroy
    pub session_id: SessionId,
}

/// Process DESTROY_SESSION operation
pub fn process_destroy_session(ctx: &mut CompoundContext, args: &DestroySessionArgs) -> OpResult {
    ctx.state_handler().remove_session_by_id(&args.session_id)?;
    Ok(Nfs4OpRes::ok(Nfs4Op::DestroySession, OpResBody::None))
}

/// DESTROY_CLIENTID arguments
#[derive(Debug, Clone)]
pub struct DestroyClientIdArgs {
    /// Client to destroy
    pub client_id: ClientId,
}

/// Process DESTROY_CLIENTID operation
pub fn process_destroy_clientid(
    ctx: &mut CompoundContext,
    args: &DestroyClientIdArgs,
) -> OpResult {
    let handler = ctx.state_handler();
    let client = handler.client_by_id(args.client_id)?;
    if client.has_sessions() {
        return Err(NfsStatus::ClientIdBusy.into());
    }
    handler.remove_client(client.id())?;
    Ok(Nfs4OpRes::ok(Nfs4Op::DestroyClientId, OpResBody::None))
}

/// SEQUENCE arguments
#[derive(Debug, Clone)]
pub struct SequenceArgs {
    /// Session
    pub session_id: SessionId,
    /// Slot sequence id
    pub sequence_id: u32,
    /// Slot index
    pub slot_id: u32,
    /// Highest slot the client is using
    pub highest_slot_id: u32,
    /// Cache the reply for replay
    pub cache_this: bool,
}

/// SEQUENCE result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRes {
    /// Session
    pub session_id: SessionId,
    /// Echoed sequence id
    pub sequence_id: u32,
    /// Echoed slot index
    pub slot_id: u32,
    /// Highest slot the server will accept
    pub highest_slot_id: u32,
    /// Highest slot the server wants the client to use
    pub target_highest_slot_id: u32,
    /// SEQ4_STATUS_* bits
    pub status_flags: u32,
}

/// Process SEQUENCE operation
pub fn process_sequence(ctx: &mut CompoundContext, args: &SequenceArgs) -> OpResult {
    let session = ctx.state_handler().session_by_id(&args.session_id)?;
    let client = ctx
        .state_handler()
        .client_by_id(session.client_id())
        .map_err(|_| NfsStatus::BadSession)?;
    client.update_lease()?;

    if ctx.total_ops() > session.fore_channel().max_ops as usize {
        return Err(NfsStatus::TooManyOps.into());
    }

    let slot = session.slot(args.slot_id)?;
    slot.acquire()?;
    let check = match slot.check_sequence(args.sequence_id, args.cache_this) {
        Ok(check) => check,
        Err(status) => {
            slot.release();
            return Err(status.into());
        }
    };

    let fresh = matches!(check, SlotSequence::New);
    if let SlotSequence::Replay(reply) = check {
        debug!(
            session = %session.id(),
            slot = args.slot_id,
            sequence = args.sequence_id,
            "replaying cached reply"
        );
        ctx.set_cache(reply);
    }
    ctx.claim_slot(SlotClaim {
        session: session.clone(),
        slot_id: args.slot_id,
        fresh,
        cache_this: args.cache_this,
    });

    Ok(Nfs4OpRes::ok(
        Nfs4Op::Sequence,
        OpResBody::Sequence(SequenceRes {
            session_id: session.id(),
            sequence_id: args.sequence_id,
            slot_id: args.slot_id,
            highest_slot_id: session.highest_slot(),
            target_highest_slot_id: session.highest_slot(),
            status_flags: 0,
        }),
    ))
}

/// RECLAIM_COMPLETE arguments
#[derive(Debug, Clone, Default)]
pub struct ReclaimCompleteArgs {
    /// Reclaim finished for the current filesystem only
    pub one_fs: bool,
}

/// Process RECLAIM_COMPLETE operation
pub fn process_reclaim_complete(
    ctx: &mut CompoundContext,
    args: &ReclaimCompleteArgs,
) -> OpResult {
    if args.one_fs {
        // single export: per-filesystem reclaim needs a current handle and nothing else
        ctx.current_fh()?;
        return Ok(Nfs4OpRes::ok(Nfs4Op::ReclaimComplete, OpResBody::None));
    }
    ctx.session_client()?.reclaim_complete()?;
    Ok(Nfs4OpRes::ok(Nfs4Op::ReclaimComplete, OpResBody::None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::compound::tests::context;

    fn exchange_id(owner: &'static str, verifier: u64) -> ExchangeIdArgs {
        ExchangeIdArgs {
            owner: Bytes::from_static(owner.as_bytes()),
            verifier: Verifier::from_u64(verifier),
            flags: 0,
            state_protect: 0,
        }
    }

    fn exchange(ctx: &mut CompoundContext, args: &ExchangeIdArgs) -> ExchangeIdRes {
        match process_exchange_id(ctx, args).unwrap().body {
            OpResBody::ExchangeId(res) => res,
            other => panic!("unexpected body {other:?}"),
        }
    }

    fn create_session_args(client_id: ClientId, sequence: u32) -> CreateSessionArgs {
        CreateSessionArgs {
            client_id,
            sequence,
            flags: 0,
            fore_channel: ChannelAttrs::default(),
            back_channel: ChannelAttrs::default(),
        }
    }

    #[test]
    fn test_exchange_id_is_idempotent() {
        let mut ctx = context(1);
        let first = exchange(&mut ctx, &exchange_id("host", 1));
        let again = exchange(&mut ctx, &exchange_id("host", 1));
        assert_eq!(first.client_id, again.client_id);
        assert_eq!(first.sequence_id, 0);
        assert_eq!(first.flags & EXCHGID4_FLAG_CONFIRMED_R, 0);
    }

    #[test]
    fn test_exchange_id_reboot_replaces_client() {
        let mut ctx = context(1);
        let before = exchange(&mut ctx, &exchange_id("host", 1));
        let after = exchange(&mut ctx, &exchange_id("host", 2));
        assert_ne!(before.client_id, after.client_id);
        assert_eq!(
            ctx.state_handler().client_by_id(before.client_id).unwrap_err(),
            NfsStatus::StaleClientId
        );
    }

    #[test]
    fn test_create_and_destroy_session() {
        let mut ctx = context(1);
        let client_id = exchange(&mut ctx, &exchange_id("host", 1)).client_id;

        let res = process_create_session(&mut ctx, &create_session_args(client_id, 0)).unwrap();
        let session_id = match res.body {
            OpResBody::CreateSession(res) => res.session_id,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(session_id.client_id(), client_id);

        let confirmed = exchange(&mut ctx, &exchange_id("host", 1));
        assert_ne!(confirmed.flags & EXCHGID4_FLAG_CONFIRMED_R, 0);

        let busy = process_destroy_clientid(&mut ctx, &DestroyClientIdArgs { client_id });
        assert_eq!(busy.unwrap_err().status(), NfsStatus::ClientIdBusy);

        process_destroy_session(&mut ctx, &DestroySessionArgs { session_id }).unwrap();
        // the last session took the client with it
        assert!(ctx.state_handler().client_by_id(client_id).is_err());
    }

    #[test]
    fn test_create_session_misordered() {
        let mut ctx = context(1);
        let client_id = exchange(&mut ctx, &exchange_id("host", 1)).client_id;
        let err = process_create_session(&mut ctx, &create_session_args(client_id, 5)).unwrap_err();
        assert_eq!(err.status(), NfsStatus::SeqMisordered);

        let err = process_create_session(&mut ctx, &create_session_args(999, 0)).unwrap_err();
        assert_eq!(err.status(), NfsStatus::StaleClientId);
    }

    #[test]
    fn test_sequence_unknown_session() {
        let mut ctx = context(1);
        let args = SequenceArgs {
            session_id: SessionId::new(1, 0),
            sequence_id: 1,
            slot_id: 0,
            highest_slot_id: 0,
            cache_this: false,
        };
        assert_eq!(
            process_sequence(&mut ctx, &args).unwrap_err().status(),
            NfsStatus::BadSession
        );
    }

    #[test]
    fn test_destroy_unknown_clientid() {
        let mut ctx = context(1);
        let err = process_destroy_clientid(&mut ctx, &DestroyClientIdArgs { client_id: 7 });
        assert_eq!(err.unwrap_err().status(), NfsStatus::StaleClientId);
    }
}
