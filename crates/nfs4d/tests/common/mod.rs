//! Shared helpers for compound-level tests

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use nfs4d::nfs4::compound::OpResBody;
use nfs4d::nfs4::ops::open::{CloseArgs, CreateAttrs, CreateMode, OpenArgs, OpenClaim, OpenHow};
use nfs4d::nfs4::ops::session::{CreateSessionArgs, ExchangeIdArgs, SequenceArgs};
use nfs4d::nfs4::session::ChannelAttrs;
use nfs4d::nfs4::{ClientId, SessionId, StateId, Verifier};
use nfs4d::vfs::VirtualFileSystem;
use nfs4d::{
    CompoundArgs, CompoundRes, MemoryFs, NfsConfig, NfsServer, NfsStatus, Nfs4OpArgs, Nfs4OpRes,
    RpcCall,
};

/// Server over a fresh in-memory filesystem
pub fn server(config: NfsConfig) -> NfsServer {
    NfsServer::new(config, Arc::new(MemoryFs::new()))
}

/// Server over a caller-supplied filesystem
pub fn server_with_fs(config: NfsConfig, fs: Arc<dyn VirtualFileSystem>) -> NfsServer {
    NfsServer::new(config, fs)
}

/// Root caller on localhost
pub fn call() -> RpcCall {
    RpcCall::local(0, 0)
}

/// Run a compound as the default caller
pub fn run(server: &NfsServer, minor_version: u32, ops: Vec<Nfs4OpArgs>) -> CompoundRes {
    server.execute_compound(&call(), CompoundArgs::new(minor_version, "test", ops))
}

/// Statuses of every result, in order
pub fn statuses(res: &CompoundRes) -> Vec<NfsStatus> {
    res.results.iter().map(|r| r.status).collect()
}

/// EXCHANGE_ID for `owner`, returning the client id
pub fn exchange_id(server: &NfsServer, owner: &'static str) -> ClientId {
    let args = ExchangeIdArgs {
        owner: Bytes::from_static(owner.as_bytes()),
        verifier: Verifier::from_u64(1),
        flags: 0,
        state_protect: 0,
    };
    let res = run(server, 1, vec![Nfs4OpArgs::ExchangeId(args)]);
    assert_eq!(res.status, NfsStatus::Ok);
    match &res.results[0].body {
        OpResBody::ExchangeId(res) => res.client_id,
        other => panic!("unexpected body {other:?}"),
    }
}

/// CREATE_SESSION for a client at sequence 0
pub fn create_session(server: &NfsServer, client_id: ClientId) -> SessionId {
    let args = CreateSessionArgs {
        client_id,
        sequence: 0,
        flags: 0,
        fore_channel: ChannelAttrs::default(),
        back_channel: ChannelAttrs::default(),
    };
    let res = run(server, 1, vec![Nfs4OpArgs::CreateSession(args)]);
    assert_eq!(res.status, NfsStatus::Ok);
    match &res.results[0].body {
        OpResBody::CreateSession(res) => res.session_id,
        other => panic!("unexpected body {other:?}"),
    }
}

/// A confirmed v4.1 client with one session
pub fn mount(server: &NfsServer, owner: &'static str) -> (ClientId, SessionId) {
    let client_id = exchange_id(server, owner);
    (client_id, create_session(server, client_id))
}

/// SEQUENCE on `slot_id`
pub fn sequence(session_id: SessionId, slot_id: u32, sequence_id: u32) -> Nfs4OpArgs {
    Nfs4OpArgs::Sequence(SequenceArgs {
        session_id,
        sequence_id,
        slot_id,
        highest_slot_id: slot_id,
        cache_this: true,
    })
}

/// OPEN (create if missing) of `name` in the current directory
pub fn open(name: &str, owner: &'static str, share_access: u32) -> Nfs4OpArgs {
    Nfs4OpArgs::Open(OpenArgs {
        seqid: 0,
        share_access,
        share_deny: 0,
        client_id: 0,
        owner: Bytes::from_static(owner.as_bytes()),
        how: OpenHow::Create(CreateMode::Unchecked(CreateAttrs::default())),
        claim: OpenClaim::Null(name.to_string()),
    })
}

/// CLOSE of `stateid`
pub fn close(stateid: StateId) -> Nfs4OpArgs {
    Nfs4OpArgs::Close(CloseArgs {
        seqid: 0,
        open_stateid: stateid,
    })
}

/// Stateid carried by an OPEN, OPEN_CONFIRM, LOCK or LOCKU result
pub fn stateid(result: &Nfs4OpRes) -> StateId {
    match &result.body {
        OpResBody::Open(res) => res.stateid,
        OpResBody::StateId(stateid) => *stateid,
        other => panic!("no stateid in {other:?}"),
    }
}
