//! NFSv4.0 client id establishment and lease renewal

use bytes::Bytes;
use tracing::debug;

use super::OpResult;
use crate::error::NfsStatus;
use crate::nfs4::client::ClientRegistration;
use crate::nfs4::compound::{CompoundContext, Nfs4Op, Nfs4OpRes, OpResBody};
use crate::nfs4::state_handler::OwnerAction;
use crate::nfs4::{ClientId, Verifier};

/// SETCLIENTID arguments
#[derive(Debug, Clone)]
pub struct SetClientIdArgs {
    /// Client boot verifier
    pub verifier: Verifier,
    /// Client owner id
    pub id: Bytes,
    /// Callback program (recorded, callbacks are not issued)
    pub callback_program: u32,
}

/// SETCLIENTID result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetClientIdRes {
    /// Assigned client id
    pub client_id: ClientId,
    /// Verifier SETCLIENTID_CONFIRM must echo
    pub confirm: Verifier,
}

/// Verifier handed out for `client_id`'s confirmation
fn confirm_verifier(client_id: ClientId) -> Verifier {
    Verifier::from_u64(client_id.rotate_left(32) ^ 0x6e66_7334_6466_0000)
}

/// Process SETCLIENTID operation
pub fn process_setclientid(ctx: &mut CompoundContext, args: &SetClientIdArgs) -> OpResult {
    let principal = ctx.call().credential.principal().to_string();
    let registration = ClientRegistration {
        owner: args.id.clone(),
        verifier: args.verifier,
        principal: principal.clone(),
        remote_addr: ctx.call().remote_addr,
        local_addr: ctx.call().local_addr,
        minor_version: 0,
    };
    let handler = ctx.state_handler();

    let client = handler.register_owner(registration, |existing| match existing {
        None => Ok(OwnerAction::Register),
        Some(existing) if existing.is_confirmed() && existing.principal() != principal => {
            Err(NfsStatus::ClidInUse)
        }
        Some(existing) if existing.verifier() == args.verifier && existing.is_lease_valid() => {
            Ok(OwnerAction::Keep)
        }
        Some(existing) => {
            debug!(
                client = format_args!("{:016x}", existing.id()),
                "new client incarnation"
            );
            Ok(OwnerAction::Register)
        }
    })?;

    Ok(Nfs4OpRes::ok(
        Nfs4Op::SetClientId,
        OpResBody::SetClientId(SetClientIdRes {
            client_id: client.id(),
            confirm: confirm_verifier(client.id()),
        }),
    ))
}

/// SETCLIENTID_CONFIRM arguments
#[derive(Debug, Clone)]
pub struct SetClientIdConfirmArgs {
    /// Client id from SETCLIENTID
    pub client_id: ClientId,
    /// Verifier from SETCLIENTID
    pub confirm: Verifier,
}

/// Process SETCLIENTID_CONFIRM operation
pub fn process_setclientid_confirm(
    ctx: &mut CompoundContext,
    args: &SetClientIdConfirmArgs,
) -> OpResult {
    let client = ctx.state_handler().client_by_id(args.client_id)?;
    if args.confirm != confirm_verifier(client.id()) {
        return Err(NfsStatus::StaleClientId.into());
    }
    if client.principal() != ctx.call().credential.principal() {
        return Err(NfsStatus::ClidInUse.into());
    }
    client.set_confirmed();
    Ok(Nfs4OpRes::ok(Nfs4Op::SetClientIdConfirm, OpResBody::None))
}

/// RENEW arguments
#[derive(Debug, Clone)]
pub struct RenewArgs {
    /// Client whose lease to renew
    pub client_id: ClientId,
}

/// Process RENEW operation
pub fn process_renew(ctx: &mut CompoundContext, args: &RenewArgs) -> OpResult {
    let client = ctx.state_handler().client_by_id(args.client_id)?;
    client.update_lease()?;
    Ok(Nfs4OpRes::ok(Nfs4Op::Renew, OpResBody::None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::compound::tests::context;

    fn setclientid(ctx: &mut CompoundContext, verifier: u64) -> SetClientIdRes {
        let args = SetClientIdArgs {
            verifier: Verifier::from_u64(verifier),
            id: Bytes::from_static(b"linux-client"),
            callback_program: 0x4000_0000,
        };
        match process_setclientid(ctx, &args).unwrap().body {
            OpResBody::SetClientId(res) => res,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_setclientid_confirm_renew() {
        let mut ctx = context(0);
        let res = setclientid(&mut ctx, 1);
        let client = ctx.state_handler().client_by_id(res.client_id).unwrap();
        assert!(!client.is_confirmed());

        let bad = SetClientIdConfirmArgs {
            client_id: res.client_id,
            confirm: Verifier::from_u64(0),
        };
        assert_eq!(
            process_setclientid_confirm(&mut ctx, &bad).unwrap_err().status(),
            NfsStatus::StaleClientId
        );

        let good = SetClientIdConfirmArgs {
            client_id: res.client_id,
            confirm: res.confirm,
        };
        process_setclientid_confirm(&mut ctx, &good).unwrap();
        assert!(client.is_confirmed());

        let renew = RenewArgs {
            client_id: res.client_id,
        };
        assert!(process_renew(&mut ctx, &renew).is_ok());
    }

    #[test]
    fn test_setclientid_same_verifier_keeps_client() {
        let mut ctx = context(0);
        let first = setclientid(&mut ctx, 1);
        assert_eq!(setclientid(&mut ctx, 1).client_id, first.client_id);
        assert_ne!(setclientid(&mut ctx, 2).client_id, first.client_id);
    }

    #[test]
    fn test_renew_unknown_client() {
        let mut ctx = context(0);
        let err = process_renew(&mut ctx, &RenewArgs { client_id: 42 }).unwrap_err();
        assert_eq!(err.status(), NfsStatus::StaleClientId);
    }
}
