//! NFSv4.1 sessions and slots
//!
//! Sessions provide exactly-once semantics for NFSv4.1 operations. Each slot
//! admits one request at a time and remembers the reply to the last one, so a
//! retransmission can be answered without executing anything twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::trace;

use super::compound::Nfs4OpRes;
use super::{ClientId, SessionId};
use crate::error::NfsStatus;

/// Result list of a completed compound, kept for replay
pub type CachedReply = Arc<Vec<Nfs4OpRes>>;

/// Outcome of checking a request's sequence id against its slot
#[derive(Debug, Clone)]
pub enum SlotSequence {
    /// Next request in order; prior cached reply discarded
    New,
    /// Retransmission of the last request with its cached reply
    Replay(CachedReply),
    /// Retransmission whose reply was not cached; executed again
    Uncached,
}

impl SlotSequence {
    /// Cached reply, if this is a replayable retransmission
    pub fn cached_reply(&self) -> Option<&CachedReply> {
        match self {
            SlotSequence::Replay(reply) => Some(reply),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct SlotInner {
    sequence: u32,
    reply: Option<CachedReply>,
}

/// Session slot (for exactly-once semantics)
#[derive(Debug, Default)]
pub struct SessionSlot {
    inner: Mutex<SlotInner>,
    in_use: AtomicBool,
}

impl SessionSlot {
    /// Create a new slot expecting sequence id 1 next
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence id of the last completed request
    pub fn sequence(&self) -> u32 {
        self.inner.lock().sequence
    }

    /// Classify `sequence` against the slot
    ///
    /// `cache_required` is the client's `sa_cachethis`: a retransmission of a
    /// request whose reply was not cached fails with `RetryUncachedRep` only if
    /// the client asked for caching.
    pub fn check_sequence(
        &self,
        sequence: u32,
        cache_required: bool,
    ) -> Result<SlotSequence, NfsStatus> {
        let mut inner = self.inner.lock();

        if sequence == inner.sequence {
            trace!(sequence, "retransmitted request");
            return match &inner.reply {
                Some(reply) => Ok(SlotSequence::Replay(reply.clone())),
                None if cache_required => Err(NfsStatus::RetryUncachedRep),
                None => Ok(SlotSequence::Uncached),
            };
        }

        if sequence != inner.sequence.wrapping_add(1) {
            return Err(NfsStatus::SeqMisordered);
        }

        inner.reply = None;
        Ok(SlotSequence::New)
    }

    /// Claim the slot for one in-flight request
    pub fn acquire(&self) -> Result<(), NfsStatus> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| NfsStatus::Delay)
    }

    /// Give the slot back without advancing it
    pub fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Complete a new request: advance the sequence, store its reply, release
    ///
    /// The sequence and reply change together before the slot becomes
    /// acquirable again.
    pub fn release_and_advance(&self, reply: Option<CachedReply>) {
        {
            let mut inner = self.inner.lock();
            inner.sequence = inner.sequence.wrapping_add(1);
            inner.reply = reply;
        }
        self.release();
    }

    /// True while a request holds the slot
    pub fn is_busy(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Channel attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAttrs {
    /// Header padding (for RDMA)
    pub header_pad_size: u32,
    /// Maximum request size
    pub max_request_size: u32,
    /// Maximum response size
    pub max_response_size: u32,
    /// Maximum response size with cached data
    pub max_response_size_cached: u32,
    /// Maximum operations per COMPOUND
    pub max_ops: u32,
    /// Maximum concurrent requests (slot count)
    pub max_requests: u32,
}

impl Default for ChannelAttrs {
    fn default() -> Self {
        Self {
            header_pad_size: 0,
            max_request_size: 1024 * 1024,       // 1 MB
            max_response_size: 1024 * 1024,      // 1 MB
            max_response_size_cached: 64 * 1024, // 64 KB
            max_ops: 16,
            max_requests: 16,
        }
    }
}

impl ChannelAttrs {
    /// Clamp client-requested attributes to server limits
    pub fn negotiate(&self, requested: &ChannelAttrs) -> Self {
        Self {
            header_pad_size: 0,
            max_request_size: requested.max_request_size.min(self.max_request_size),
            max_response_size: requested.max_response_size.min(self.max_response_size),
            max_response_size_cached: requested
                .max_response_size_cached
                .min(self.max_response_size_cached),
            max_ops: requested.max_ops.clamp(1, self.max_ops.max(1)),
            max_requests: requested.max_requests.clamp(1, self.max_requests.max(1)),
        }
    }
}

/// NFSv4.1 session
#[derive(Debug)]
pub struct Nfs4Session {
    id: SessionId,
    client_id: ClientId,
    sequence: u32,
    fore_channel: ChannelAttrs,
    slots: Box<[OnceLock<SessionSlot>]>,
}

impl Nfs4Session {
    /// Create a session for `client_id` created at `sequence`
    ///
    /// The slot table is sized by `fore_channel.max_requests` and never resized.
    pub fn new(client_id: ClientId, sequence: u32, fore_channel: ChannelAttrs) -> Self {
        let slot_count = fore_channel.max_requests.max(1) as usize;
        Self {
            id: SessionId::new(client_id, sequence),
            client_id,
            sequence,
            fore_channel,
            slots: (0..slot_count).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Owning client id
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// CREATE_SESSION sequence that created this session
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Negotiated fore channel attributes
    pub fn fore_channel(&self) -> &ChannelAttrs {
        &self.fore_channel
    }

    /// Highest valid slot index
    pub fn highest_slot(&self) -> u32 {
        (self.slots.len() - 1) as u32
    }

    /// Slot by index, created on first use
    pub fn slot(&self, index: u32) -> Result<&SessionSlot, NfsStatus> {
        self.slots
            .get(index as usize)
            .map(|slot| slot.get_or_init(SessionSlot::new))
            .ok_or(NfsStatus::BadSlot)
    }

    /// Highest slot index ever used, 0 if none
    pub fn highest_used_slot(&self) -> u32 {
        self.slots
            .iter()
            .rposition(|slot| slot.get().is_some())
            .map_or(0, |i| i as u32)
    }
}
