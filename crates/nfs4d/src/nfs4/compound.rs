//! NFSv4 COMPOUND operation handling
//!
//! COMPOUND is the only real NFSv4 procedure: an ordered list of operations
//! executed against one shared [`CompoundContext`], stopping at the first
//! failure.

use std::sync::Arc;

use nfs4d_common::{FileHandle, LockManager};

use super::client::Nfs4Client;
use super::ops::clientid::{RenewArgs, SetClientIdArgs, SetClientIdConfirmArgs, SetClientIdRes};
use super::ops::filehandle::{
    AccessArgs, AccessRes, GetAttrArgs, GetAttrRes, LookupArgs, PutFhArgs, RenameArgs,
    RenameRes, SetAttrArgs,
};
use super::ops::io::{ReadArgs, ReadRes, WriteArgs, WriteRes};
use super::ops::lock::{LockArgs, LockDenied, LockTArgs, LockUArgs};
use super::ops::open::{CloseArgs, OpenArgs, OpenConfirmArgs, OpenDowngradeArgs, OpenRes};
use super::ops::session::{
    CreateSessionArgs, CreateSessionRes, DestroyClientIdArgs, DestroySessionArgs,
    ExchangeIdArgs, ExchangeIdRes, ReclaimCompleteArgs, SequenceArgs, SequenceRes,
};
use super::session::{CachedReply, Nfs4Session};
use super::state_handler::StateHandler;
use super::StateId;
use crate::config::NfsConfig;
use crate::error::NfsStatus;
use crate::rpc::RpcCall;
use crate::vfs::VirtualFileSystem;

/// NFSv4.1 operation codes (RFC 8881)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Nfs4Op {
    Access = 3,
    Close = 4,
    Commit = 5,
    Create = 6,
    DelegPurge = 7,
    DelegReturn = 8,
    GetAttr = 9,
    GetFh = 10,
    Link = 11,
    Lock = 12,
    LockT = 13,
    LockU = 14,
    Lookup = 15,
    LookupP = 16,
    NVerify = 17,
    Open = 18,
    OpenAttr = 19,
    OpenConfirm = 20,
    OpenDowngrade = 21,
    PutFh = 22,
    PutPubFh = 23,
    PutRootFh = 24,
    Read = 25,
    ReadDir = 26,
    ReadLink = 27,
    Remove = 28,
    Rename = 29,
    Renew = 30,
    RestoreFh = 31,
    SaveFh = 32,
    SecInfo = 33,
    SetAttr = 34,
    SetClientId = 35,
    SetClientIdConfirm = 36,
    Verify = 37,
    Write = 38,
    ReleaseLockOwner = 39,
    // NFSv4.1 operations
    BackchannelCtl = 40,
    BindConnToSession = 41,
    ExchangeId = 42,
    CreateSession = 43,
    DestroySession = 44,
    FreeStateId = 45,
    GetDirDelegation = 46,
    GetDeviceInfo = 47,
    GetDeviceList = 48,
    LayoutCommit = 49,
    LayoutGet = 50,
    LayoutReturn = 51,
    SecInfoNoName = 52,
    Sequence = 53,
    SetSsv = 54,
    TestStateId = 55,
    WantDelegation = 56,
    DestroyClientId = 57,
    ReclaimComplete = 58,
    // Illegal operation marker
    Illegal = 10044,
}

impl TryFrom<u32> for Nfs4Op {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Access),
            4 => Ok(Self::Close),
            5 => Ok(Self::Commit),
            6 => Ok(Self::Create),
            7 => Ok(Self::DelegPurge),
            8 => Ok(Self::DelegReturn),
            9 => Ok(Self::GetAttr),
            10 => Ok(Self::GetFh),
            11 => Ok(Self::Link),
            12 => Ok(Self::Lock),
            13 => Ok(Self::LockT),
            14 => Ok(Self::LockU),
            15 => Ok(Self::Lookup),
            16 => Ok(Self::LookupP),
            17 => Ok(Self::NVerify),
            18 => Ok(Self::Open),
            19 => Ok(Self::OpenAttr),
            20 => Ok(Self::OpenConfirm),
            21 => Ok(Self::OpenDowngrade),
            22 => Ok(Self::PutFh),
            23 => Ok(Self::PutPubFh),
            24 => Ok(Self::PutRootFh),
            25 => Ok(Self::Read),
            26 => Ok(Self::ReadDir),
            27 => Ok(Self::ReadLink),
            28 => Ok(Self::Remove),
            29 => Ok(Self::Rename),
            30 => Ok(Self::Renew),
            31 => Ok(Self::RestoreFh),
            32 => Ok(Self::SaveFh),
            33 => Ok(Self::SecInfo),
            34 => Ok(Self::SetAttr),
            35 => Ok(Self::SetClientId),
            36 => Ok(Self::SetClientIdConfirm),
            37 => Ok(Self::Verify),
            38 => Ok(Self::Write),
            39 => Ok(Self::ReleaseLockOwner),
            40 => Ok(Self::BackchannelCtl),
            41 => Ok(Self::BindConnToSession),
            42 => Ok(Self::ExchangeId),
            43 => Ok(Self::CreateSession),
            44 => Ok(Self::DestroySession),
            45 => Ok(Self::FreeStateId),
            46 => Ok(Self::GetDirDelegation),
            47 => Ok(Self::GetDeviceInfo),
            48 => Ok(Self::GetDeviceList),
            49 => Ok(Self::LayoutCommit),
            50 => Ok(Self::LayoutGet),
            51 => Ok(Self::LayoutReturn),
            52 => Ok(Self::SecInfoNoName),
            53 => Ok(Self::Sequence),
            54 => Ok(Self::SetSsv),
            55 => Ok(Self::TestStateId),
            56 => Ok(Self::WantDelegation),
            57 => Ok(Self::DestroyClientId),
            58 => Ok(Self::ReclaimComplete),
            10044 => Ok(Self::Illegal),
            _ => Err(NfsStatus::OpIllegal),
        }
    }
}

impl Nfs4Op {
    /// Opcodes subject to compound position rules
    pub fn is_position_checked(self) -> bool {
        (Nfs4Op::Access as u32..=Nfs4Op::ReclaimComplete as u32).contains(&(self as u32))
    }

    /// Operations allowed to open a v4.1 compound without a SEQUENCE
    pub fn may_start_compound(self) -> bool {
        matches!(
            self,
            Nfs4Op::Sequence
                | Nfs4Op::CreateSession
                | Nfs4Op::ExchangeId
                | Nfs4Op::DestroySession
                | Nfs4Op::DestroyClientId
        )
    }

    /// Check the operation exists in `minor_version`
    pub fn check_minor_version(self, minor_version: u32) -> Result<(), NfsStatus> {
        let code = self as u32;
        match minor_version {
            // v4.0 ends at RELEASE_LOCKOWNER
            0 if code > Nfs4Op::ReleaseLockOwner as u32 && self != Nfs4Op::Illegal => {
                Err(NfsStatus::OpIllegal)
            }
            m if m > 0
                && matches!(
                    self,
                    Nfs4Op::SetClientId
                        | Nfs4Op::SetClientIdConfirm
                        | Nfs4Op::Renew
                        | Nfs4Op::OpenConfirm
                        | Nfs4Op::ReleaseLockOwner
                ) =>
            {
                Err(NfsStatus::Notsupp)
            }
            _ => Ok(()),
        }
    }
}

/// COMPOUND request arguments
#[derive(Debug, Clone)]
pub struct CompoundArgs {
    /// Minor version
    pub minor_version: u32,
    /// Tag (for debugging)
    pub tag: String,
    /// Operations
    pub ops: Vec<Nfs4OpArgs>,
}

impl CompoundArgs {
    /// Create a request
    pub fn new(minor_version: u32, tag: impl Into<String>, ops: Vec<Nfs4OpArgs>) -> Self {
        Self {
            minor_version,
            tag: tag.into(),
            ops,
        }
    }
}

/// Decoded arguments of one operation
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Nfs4OpArgs {
    Access(AccessArgs),
    Close(CloseArgs),
    GetAttr(GetAttrArgs),
    GetFh,
    Lock(LockArgs),
    LockT(LockTArgs),
    LockU(LockUArgs),
    Lookup(LookupArgs),
    Open(OpenArgs),
    OpenConfirm(OpenConfirmArgs),
    OpenDowngrade(OpenDowngradeArgs),
    PutFh(PutFhArgs),
    PutRootFh,
    Read(ReadArgs),
    Rename(RenameArgs),
    Renew(RenewArgs),
    RestoreFh,
    SaveFh,
    SetAttr(SetAttrArgs),
    SetClientId(SetClientIdArgs),
    SetClientIdConfirm(SetClientIdConfirmArgs),
    Write(WriteArgs),
    ExchangeId(ExchangeIdArgs),
    CreateSession(CreateSessionArgs),
    DestroySession(DestroySessionArgs),
    Sequence(SequenceArgs),
    DestroyClientId(DestroyClientIdArgs),
    ReclaimComplete(ReclaimCompleteArgs),
    /// A known operation this server does not implement
    Unsupported(Nfs4Op),
    Illegal,
}

impl Nfs4OpArgs {
    /// Operation code
    pub fn op(&self) -> Nfs4Op {
        match self {
            Nfs4OpArgs::Access(_) => Nfs4Op::Access,
            Nfs4OpArgs::Close(_) => Nfs4Op::Close,
            Nfs4OpArgs::GetAttr(_) => Nfs4Op::GetAttr,
            Nfs4OpArgs::GetFh => Nfs4Op::GetFh,
            Nfs4OpArgs::Lock(_) => Nfs4Op::Lock,
            Nfs4OpArgs::LockT(_) => Nfs4Op::LockT,
            Nfs4OpArgs::LockU(_) => Nfs4Op::LockU,
            Nfs4OpArgs::Lookup(_) => Nfs4Op::Lookup,
            Nfs4OpArgs::Open(_) => Nfs4Op::Open,
            Nfs4OpArgs::OpenConfirm(_) => Nfs4Op::OpenConfirm,
            Nfs4OpArgs::OpenDowngrade(_) => Nfs4Op::OpenDowngrade,
            Nfs4OpArgs::PutFh(_) => Nfs4Op::PutFh,
            Nfs4OpArgs::PutRootFh => Nfs4Op::PutRootFh,
            Nfs4OpArgs::Read(_) => Nfs4Op::Read,
            Nfs4OpArgs::Rename(_) => Nfs4Op::Rename,
            Nfs4OpArgs::Renew(_) => Nfs4Op::Renew,
            Nfs4OpArgs::RestoreFh => Nfs4Op::RestoreFh,
            Nfs4OpArgs::SaveFh => Nfs4Op::SaveFh,
            Nfs4OpArgs::SetAttr(_) => Nfs4Op::SetAttr,
            Nfs4OpArgs::SetClientId(_) => Nfs4Op::SetClientId,
            Nfs4OpArgs::SetClientIdConfirm(_) => Nfs4Op::SetClientIdConfirm,
            Nfs4OpArgs::Write(_) => Nfs4Op::Write,
            Nfs4OpArgs::ExchangeId(_) => Nfs4Op::ExchangeId,
            Nfs4OpArgs::CreateSession(_) => Nfs4Op::CreateSession,
            Nfs4OpArgs::DestroySession(_) => Nfs4Op::DestroySession,
            Nfs4OpArgs::Sequence(_) => Nfs4Op::Sequence,
            Nfs4OpArgs::DestroyClientId(_) => Nfs4Op::DestroyClientId,
            Nfs4OpArgs::ReclaimComplete(_) => Nfs4Op::ReclaimComplete,
            Nfs4OpArgs::Unsupported(op) => *op,
            Nfs4OpArgs::Illegal => Nfs4Op::Illegal,
        }
    }
}

/// COMPOUND response
#[derive(Debug, Clone)]
pub struct CompoundRes {
    /// Status of last operation
    pub status: NfsStatus,
    /// Tag (echoed from request)
    pub tag: String,
    /// Operation results
    pub results: Vec<Nfs4OpRes>,
}

impl CompoundRes {
    /// Create a new response
    pub fn new(tag: String) -> Self {
        Self {
            status: NfsStatus::Ok,
            tag,
            results: Vec::new(),
        }
    }

    /// Add an operation result
    pub fn add_result(&mut self, result: Nfs4OpRes) {
        if result.status != NfsStatus::Ok {
            self.status = result.status;
        }
        self.results.push(result);
    }
}

/// Operation-specific result data
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub enum OpResBody {
    #[default]
    None,
    Access(AccessRes),
    ExchangeId(ExchangeIdRes),
    CreateSession(CreateSessionRes),
    Sequence(SequenceRes),
    SetClientId(SetClientIdRes),
    GetFh(FileHandle),
    GetAttr(GetAttrRes),
    /// Attributes applied by SETATTR
    SetAttr(Vec<u32>),
    Rename(RenameRes),
    Open(OpenRes),
    /// New stateid (OPEN_CONFIRM, OPEN_DOWNGRADE, CLOSE, LOCK, LOCKU)
    StateId(StateId),
    /// Conflicting lock (LOCK, LOCKT)
    Denied(LockDenied),
    Read(ReadRes),
    Write(WriteRes),
}

/// Individual operation result
#[derive(Debug, Clone)]
pub struct Nfs4OpRes {
    /// Operation code
    pub op: Nfs4Op,
    /// Status
    pub status: NfsStatus,
    /// Operation-specific result
    pub body: OpResBody,
}

impl Nfs4OpRes {
    /// Create a successful result
    pub fn ok(op: Nfs4Op, body: OpResBody) -> Self {
        Self {
            op,
            status: NfsStatus::Ok,
            body,
        }
    }

    /// Create an error result
    pub fn error(op: Nfs4Op, status: NfsStatus) -> Self {
        Self {
            op,
            status,
            body: OpResBody::None,
        }
    }

    /// Create a `Denied` result carrying the conflicting lock
    pub fn denied(op: Nfs4Op, conflict: LockDenied) -> Self {
        Self {
            op,
            status: NfsStatus::Denied,
            body: OpResBody::Denied(conflict),
        }
    }
}

/// Shared server objects every compound runs against
#[derive(Clone)]
pub struct ServerResources {
    /// Server configuration
    pub config: Arc<NfsConfig>,
    /// Filesystem backend
    pub fs: Arc<dyn VirtualFileSystem>,
    /// Client/session registry
    pub state_handler: Arc<StateHandler>,
    /// Byte-range lock manager
    pub lock_manager: Arc<dyn LockManager>,
}

/// Slot held by the compound after a successful SEQUENCE
#[derive(Debug, Clone)]
pub struct SlotClaim {
    /// Session the slot belongs to
    pub session: Arc<Nfs4Session>,
    /// Slot index
    pub slot_id: u32,
    /// False for retransmissions; only fresh requests advance the slot
    pub fresh: bool,
    /// Client asked for the reply to be cached
    pub cache_this: bool,
}

/// COMPOUND execution context
pub struct CompoundContext {
    resources: ServerResources,
    call: RpcCall,
    minor_version: u32,
    total_ops: usize,
    position: Option<usize>,
    current_fh: Option<FileHandle>,
    saved_fh: Option<FileHandle>,
    current_stateid: Option<StateId>,
    saved_stateid: Option<StateId>,
    slot: Option<SlotClaim>,
    cache: Option<CachedReply>,
}

impl CompoundContext {
    /// Create a context for a compound of `total_ops` operations
    pub fn new(
        resources: ServerResources,
        call: RpcCall,
        minor_version: u32,
        total_ops: usize,
    ) -> Self {
        Self {
            resources,
            call,
            minor_version,
            total_ops,
            position: None,
            current_fh: None,
            saved_fh: None,
            current_stateid: None,
            saved_stateid: None,
            slot: None,
            cache: None,
        }
    }

    /// Server configuration
    pub fn config(&self) -> &NfsConfig {
        &self.resources.config
    }

    /// Filesystem backend
    pub fn fs(&self) -> &dyn VirtualFileSystem {
        self.resources.fs.as_ref()
    }

    /// Client/session registry
    pub fn state_handler(&self) -> &StateHandler {
        &self.resources.state_handler
    }

    /// Byte-range lock manager
    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.resources.lock_manager
    }

    /// Caller and connection
    pub fn call(&self) -> &RpcCall {
        &self.call
    }

    /// Minor version of this compound
    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    /// Number of operations in the compound
    pub fn total_ops(&self) -> usize {
        self.total_ops
    }

    /// Advance to the next operation, returning its index
    pub fn next_operation(&mut self) -> usize {
        let next = self.position.map_or(0, |p| p + 1);
        debug_assert!(next < self.total_ops, "advanced past the last operation");
        self.position = Some(next);
        next
    }

    /// Index of the operation being executed
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Current filehandle
    pub fn current_fh(&self) -> Result<FileHandle, NfsStatus> {
        self.current_fh.ok_or(NfsStatus::NoFileHandle)
    }

    /// Replace the current filehandle; the current stateid no longer applies
    pub fn set_current_fh(&mut self, fh: FileHandle) {
        self.current_fh = Some(fh);
        self.current_stateid = None;
    }

    /// Saved filehandle
    pub fn saved_fh(&self) -> Result<FileHandle, NfsStatus> {
        self.saved_fh.ok_or(NfsStatus::RestoreFh)
    }

    /// Copy current filehandle and stateid to the saved slots
    pub fn save_current(&mut self) -> Result<(), NfsStatus> {
        self.saved_fh = Some(self.current_fh()?);
        self.saved_stateid = self.current_stateid;
        Ok(())
    }

    /// Copy saved filehandle and stateid back to current
    pub fn restore_saved(&mut self) -> Result<(), NfsStatus> {
        self.current_fh = Some(self.saved_fh()?);
        self.current_stateid = self.saved_stateid;
        Ok(())
    }

    /// Current stateid
    pub fn current_stateid(&self) -> Result<StateId, NfsStatus> {
        self.current_stateid.ok_or(NfsStatus::BadStateid)
    }

    /// Replace the current stateid
    pub fn set_current_stateid(&mut self, stateid: StateId) {
        self.current_stateid = Some(stateid);
    }

    /// Resolve the v4.1 current-stateid sentinel
    pub fn resolve_stateid(&self, presented: &StateId) -> Result<StateId, NfsStatus> {
        if self.minor_version > 0 && presented.is_current() {
            self.current_stateid()
        } else {
            Ok(*presented)
        }
    }

    /// Record the slot claimed by SEQUENCE
    pub fn claim_slot(&mut self, claim: SlotClaim) {
        self.slot = Some(claim);
    }

    /// Slot claimed by SEQUENCE, if any
    pub fn slot(&self) -> Option<&SlotClaim> {
        self.slot.as_ref()
    }

    /// Hand the claimed slot back to the dispatcher
    pub fn take_slot(&mut self) -> Option<SlotClaim> {
        self.slot.take()
    }

    /// Session bound by SEQUENCE
    pub fn session(&self) -> Result<&Arc<Nfs4Session>, NfsStatus> {
        self.slot
            .as_ref()
            .map(|claim| &claim.session)
            .ok_or(NfsStatus::OpNotInSession)
    }

    /// Client owning the bound session
    pub fn session_client(&self) -> Result<Arc<Nfs4Client>, NfsStatus> {
        let client_id = self.session()?.client_id();
        self.state_handler()
            .client_by_id(client_id)
            .map_err(|_| NfsStatus::BadSession)
    }

    /// Remember the reply of a detected retransmission
    pub fn set_cache(&mut self, reply: CachedReply) {
        self.cache = Some(reply);
    }

    /// Cached reply of a detected retransmission
    pub fn cache(&self) -> Option<&CachedReply> {
        self.cache.as_ref()
    }
}

impl std::fmt::Debug for CompoundContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompoundContext")
            .field("minor_version", &self.minor_version)
            .field("position", &self.position)
            .field("current_fh", &self.current_fh)
            .field("current_stateid", &self.current_stateid)
            .finish()
    }
}
