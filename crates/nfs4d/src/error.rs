//! NFS error types

use nfs4d_common::CommonError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::vfs::VfsError;

/// NFS error types
#[derive(Debug, Error)]
pub enum NfsError {
    /// NFS protocol error
    #[error("NFS error: {0}")]
    Protocol(NfsStatus),

    /// Malformed XDR input
    #[error("XDR error: {0}")]
    Xdr(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem backend error
    #[error("filesystem error: {0}")]
    Vfs(#[from] VfsError),

    /// Handle or lock primitive error
    #[error("{0}")]
    Common(#[from] CommonError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl NfsError {
    /// Per-operation status reported to the client for this error
    pub fn status(&self) -> NfsStatus {
        match self {
            NfsError::Protocol(status) => *status,
            NfsError::Xdr(_) => NfsStatus::BadXdr,
            NfsError::Io(_) => NfsStatus::Io,
            NfsError::Vfs(err) => err.status(),
            NfsError::Common(CommonError::InvalidHandle(_)) => NfsStatus::BadHandle,
            NfsError::Common(CommonError::LockConflict(_)) => NfsStatus::Denied,
            NfsError::Common(CommonError::LockRange(_)) => NfsStatus::Inval,
            NfsError::Config(_) | NfsError::Internal(_) => NfsStatus::ServerFault,
        }
    }
}

impl From<NfsStatus> for NfsError {
    fn from(status: NfsStatus) -> Self {
        NfsError::Protocol(status)
    }
}

/// NFSv4 status codes (RFC 7530, RFC 8881)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NfsStatus {
    /// Success
    Ok = 0,
    /// Caller is not the owner
    Perm = 1,
    /// No such file or directory
    Noent = 2,
    /// I/O error
    Io = 5,
    /// No such device or address
    Nxio = 6,
    /// Access denied
    Access = 13,
    /// File exists
    Exist = 17,
    /// Cross-device link
    Xdev = 18,
    /// Not a directory
    Notdir = 20,
    /// Is a directory
    Isdir = 21,
    /// Invalid argument
    Inval = 22,
    /// File too large
    Fbig = 27,
    /// No space left on device
    Nospc = 28,
    /// Read-only file system
    Rofs = 30,
    /// File name too long
    Nametoolong = 63,
    /// Directory not empty
    Notempty = 66,
    /// Stale file handle
    Stale = 70,
    /// Malformed file handle
    BadHandle = 10001,
    /// Operation not supported
    Notsupp = 10004,
    /// Undefined server error
    ServerFault = 10006,
    /// Object type not supported
    BadType = 10007,
    /// Retry later
    Delay = 10008,
    /// Lock unavailable
    Denied = 10010,
    /// Lease expired
    Expired = 10011,
    /// I/O conflicts with a lock
    Locked = 10012,
    /// Grace period in effect
    Grace = 10013,
    /// Client id in use by another principal
    ClidInUse = 10017,
    /// Server resources exhausted
    Resource = 10018,
    /// No current filehandle
    NoFileHandle = 10020,
    /// Minor version not supported
    MinorVersMismatch = 10021,
    /// Client id unknown to this server instance
    StaleClientId = 10022,
    /// State id from a previous server instance
    StaleStateid = 10023,
    /// State id sequence is behind
    OldStateid = 10024,
    /// State id unknown or ahead
    BadStateid = 10025,
    /// Sequence id out of order
    BadSeqid = 10026,
    /// Lock range not matched
    LockRange = 10028,
    /// Symbolic link where not allowed
    Symlink = 10029,
    /// No saved filehandle
    RestoreFh = 10030,
    /// Attribute not supported
    AttrNotsupp = 10032,
    /// Reclaim outside of grace period
    NoGrace = 10033,
    /// Reclaim of state not held before restart
    ReclaimBad = 10034,
    /// Arguments could not be decoded
    BadXdr = 10036,
    /// Close with locks still held
    LocksHeld = 10037,
    /// Share access mismatch
    OpenMode = 10038,
    /// Owner string cannot be mapped
    BadOwner = 10039,
    /// Invalid byte range
    BadRange = 10042,
    /// Illegal operation
    OpIllegal = 10044,
    /// Unknown session
    BadSession = 10052,
    /// Slot outside the session's table
    BadSlot = 10053,
    /// RECLAIM_COMPLETE already done
    CompleteAlready = 10054,
    /// Session or slot sequence out of order
    SeqMisordered = 10063,
    /// SEQUENCE not first in the compound
    SequencePos = 10064,
    /// Retransmission whose reply was not cached
    RetryUncachedRep = 10068,
    /// Compound exceeds the session's operation limit
    TooManyOps = 10070,
    /// Operation needs a session
    OpNotInSession = 10071,
    /// Client id still has sessions
    ClientIdBusy = 10074,
    /// Session is being torn down
    DeadSession = 10078,
}

impl NfsStatus {
    /// True for `NFS4_OK`
    pub fn is_ok(self) -> bool {
        self == NfsStatus::Ok
    }
}

impl std::fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NfsStatus::Ok => "NFS4_OK",
            NfsStatus::Perm => "NFS4ERR_PERM",
            NfsStatus::Noent => "NFS4ERR_NOENT",
            NfsStatus::Io => "NFS4ERR_IO",
            NfsStatus::Nxio => "NFS4ERR_NXIO",
            NfsStatus::Access => "NFS4ERR_ACCESS",
            NfsStatus::Exist => "NFS4ERR_EXIST",
            NfsStatus::Xdev => "NFS4ERR_XDEV",
            NfsStatus::Notdir => "NFS4ERR_NOTDIR",
            NfsStatus::Isdir => "NFS4ERR_ISDIR",
            NfsStatus::Inval => "NFS4ERR_INVAL",
            NfsStatus::Fbig => "NFS4ERR_FBIG",
            NfsStatus::Nospc => "NFS4ERR_NOSPC",
            NfsStatus::Rofs => "NFS4ERR_ROFS",
            NfsStatus::Nametoolong => "NFS4ERR_NAMETOOLONG",
            NfsStatus::Notempty => "NFS4ERR_NOTEMPTY",
            NfsStatus::Stale => "NFS4ERR_STALE",
            NfsStatus::BadHandle => "NFS4ERR_BADHANDLE",
            NfsStatus::Notsupp => "NFS4ERR_NOTSUPP",
            NfsStatus::ServerFault => "NFS4ERR_SERVERFAULT",
            NfsStatus::BadType => "NFS4ERR_BADTYPE",
            NfsStatus::Delay => "NFS4ERR_DELAY",
            NfsStatus::Denied => "NFS4ERR_DENIED",
            NfsStatus::Expired => "NFS4ERR_EXPIRED",
            NfsStatus::Locked => "NFS4ERR_LOCKED",
            NfsStatus::Grace => "NFS4ERR_GRACE",
            NfsStatus::ClidInUse => "NFS4ERR_CLID_INUSE",
            NfsStatus::Resource => "NFS4ERR_RESOURCE",
            NfsStatus::NoFileHandle => "NFS4ERR_NOFILEHANDLE",
            NfsStatus::MinorVersMismatch => "NFS4ERR_MINOR_VERS_MISMATCH",
            NfsStatus::StaleClientId => "NFS4ERR_STALE_CLIENTID",
            NfsStatus::StaleStateid => "NFS4ERR_STALE_STATEID",
            NfsStatus::OldStateid => "NFS4ERR_OLD_STATEID",
            NfsStatus::BadStateid => "NFS4ERR_BAD_STATEID",
            NfsStatus::BadSeqid => "NFS4ERR_BAD_SEQID",
            NfsStatus::LockRange => "NFS4ERR_LOCK_RANGE",
            NfsStatus::Symlink => "NFS4ERR_SYMLINK",
            NfsStatus::RestoreFh => "NFS4ERR_RESTOREFH",
            NfsStatus::AttrNotsupp => "NFS4ERR_ATTRNOTSUPP",
            NfsStatus::NoGrace => "NFS4ERR_NO_GRACE",
            NfsStatus::ReclaimBad => "NFS4ERR_RECLAIM_BAD",
            NfsStatus::BadXdr => "NFS4ERR_BADXDR",
            NfsStatus::LocksHeld => "NFS4ERR_LOCKS_HELD",
            NfsStatus::OpenMode => "NFS4ERR_OPENMODE",
            NfsStatus::BadOwner => "NFS4ERR_BADOWNER",
            NfsStatus::BadRange => "NFS4ERR_BAD_RANGE",
            NfsStatus::OpIllegal => "NFS4ERR_OP_ILLEGAL",
            NfsStatus::BadSession => "NFS4ERR_BADSESSION",
            NfsStatus::BadSlot => "NFS4ERR_BADSLOT",
            NfsStatus::CompleteAlready => "NFS4ERR_COMPLETE_ALREADY",
            NfsStatus::SeqMisordered => "NFS4ERR_SEQ_MISORDERED",
            NfsStatus::SequencePos => "NFS4ERR_SEQUENCE_POS",
            NfsStatus::RetryUncachedRep => "NFS4ERR_RETRY_UNCACHED_REP",
            NfsStatus::TooManyOps => "NFS4ERR_TOO_MANY_OPS",
            NfsStatus::OpNotInSession => "NFS4ERR_OP_NOT_IN_SESSION",
            NfsStatus::ClientIdBusy => "NFS4ERR_CLIENTID_BUSY",
            NfsStatus::DeadSession => "NFS4ERR_DEADSESSION",
        };
        write!(f, "{}", name)
    }
}

/// Result type for NFS operations
pub type NfsResult<T> = Result<T, NfsError>;
