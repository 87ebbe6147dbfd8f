//! NFSv4.0/4.1 server state
//!
//! Ownership runs top-down: the [`state_handler::StateHandler`] registry owns
//! clients, a client owns its sessions and its open/lock states, a session owns
//! its slots. Requests never hold on to these objects beyond the compound that
//! resolved them; identifiers (client id, session id, state id) are resolved
//! through the registry on every call.

pub mod attr;
pub mod client;
pub mod compound;
pub mod ops;
pub mod session;
pub mod state;
pub mod state_handler;

use std::fmt;

use crate::rpc::xdr::XdrDecoder;

/// Server-generated client identifier
pub type ClientId = u64;

/// Highest minor version this server implements
pub const NFS4_MAX_MINOR_VERSION: u32 = 1;

/// Client-supplied boot verifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Verifier(pub [u8; 8]);

impl Verifier {
    /// Verifier from a 64-bit value
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Verifier({})", hex::encode(self.0))
    }
}

/// NFSv4.1 session id
///
/// Layout: client id (bytes 0-7, big-endian), zero (8-11), creation sequence
/// (12-15, big-endian).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Build the id of the session created by `client_id` at `sequence`
    pub fn new(client_id: ClientId, sequence: u32) -> Self {
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&client_id.to_be_bytes());
        id[12..].copy_from_slice(&sequence.to_be_bytes());
        Self(id)
    }

    /// Owning client id
    pub fn client_id(&self) -> ClientId {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(raw)
    }

    /// Creation sequence
    pub fn sequence(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[12..]);
        u32::from_be_bytes(raw)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// NFSv4 stateid (identifies state at server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Sequence number
    pub seqid: u32,
    /// Client id (8 bytes, big-endian) followed by a per-client counter
    pub other: [u8; 12],
}

impl StateId {
    /// Anonymous stateid (all zeros)
    pub const ANONYMOUS: Self = Self {
        seqid: 0,
        other: [0; 12],
    };

    /// Read bypass stateid (all ones)
    pub const READ_BYPASS: Self = Self {
        seqid: u32::MAX,
        other: [0xFF; 12],
    };

    /// Current stateid sentinel (seqid=1, other=0)
    pub const CURRENT: Self = Self {
        seqid: 1,
        other: [0; 12],
    };

    /// Invalid stateid sentinel (seqid=all ones, other=0)
    pub const INVALID: Self = Self {
        seqid: u32::MAX,
        other: [0; 12],
    };

    /// Create a new stateid
    pub fn new(seqid: u32, other: [u8; 12]) -> Self {
        Self { seqid, other }
    }

    /// Build the `other` field for `client_id`'s `counter`-th state
    pub fn other_for(client_id: ClientId, counter: u32) -> [u8; 12] {
        let mut other = [0u8; 12];
        other[..8].copy_from_slice(&client_id.to_be_bytes());
        other[8..].copy_from_slice(&counter.to_be_bytes());
        other
    }

    /// Client id encoded in the first eight bytes
    pub fn client_id(&self) -> ClientId {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.other[..8]);
        u64::from_be_bytes(raw)
    }

    /// Check if this is the anonymous stateid
    pub fn is_anonymous(&self) -> bool {
        *self == Self::ANONYMOUS
    }

    /// Check if this is the read bypass stateid
    pub fn is_read_bypass(&self) -> bool {
        *self == Self::READ_BYPASS
    }

    /// Check if this is the current stateid sentinel
    pub fn is_current(&self) -> bool {
        *self == Self::CURRENT
    }

    /// Check if this is one of the special stateids that name no state
    pub fn is_special(&self) -> bool {
        self.other == [0; 12] || self.other == [0xFF; 12]
    }

    /// Same state, newer or older revision
    pub fn same_state(&self, other: &StateId) -> bool {
        self.other == other.other
    }

    /// Decode from XDR
    pub fn decode(dec: &mut XdrDecoder) -> std::io::Result<Self> {
        let seqid = dec.decode_u32()?;
        let mut other = [0u8; 12];
        other.copy_from_slice(&dec.decode_opaque_fixed(12)?);
        Ok(Self { seqid, other })
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, seq: {}]", hex::encode(self.other), self.seqid)
    }
}

/// Directory change information (for cache validation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeInfo {
    /// Atomic operation
    pub atomic: bool,
    /// Change value before operation
    pub before: u64,
    /// Change value after operation
    pub after: u64,
}

impl ChangeInfo {
    /// Create new change info
    pub fn new(before: u64, after: u64, atomic: bool) -> Self {
        Self {
            atomic,
            before,
            after,
        }
    }
}
