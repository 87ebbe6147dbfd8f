//! NFSv4 client records
//!
//! A client is created unconfirmed by EXCHANGE_ID or SETCLIENTID and becomes
//! confirmed by its first CREATE_SESSION or by SETCLIENTID_CONFIRM. It owns
//! its sessions (keyed by the CREATE_SESSION sequence that made them) and its
//! open/lock states (keyed by stateid).
//!
//! Lease, sequencing, session and reclaim fields share one mutex. The state
//! map is concurrent; the state cap is enforced by reserving a slot in the
//! live-state counter before inserting.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use nfs4d_common::FileHandle;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::session::{ChannelAttrs, Nfs4Session};
use super::state::{Nfs4State, StateKind, StateOwner};
use super::{ClientId, SessionId, StateId, Verifier};
use crate::error::NfsStatus;

/// Identity supplied when a client registers
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    /// Client-chosen owner id (opaque)
    pub owner: Bytes,
    /// Client boot verifier
    pub verifier: Verifier,
    /// Principal of the registering caller
    pub principal: String,
    /// Client address
    pub remote_addr: SocketAddr,
    /// Server address the client used
    pub local_addr: SocketAddr,
    /// Minor version used to register
    pub minor_version: u32,
}

/// Read-only view of a client for management tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    /// Client id (hex)
    pub client_id: String,
    /// Owner id (hex)
    pub owner: String,
    /// Registering principal
    pub principal: String,
    /// Client address
    pub remote_addr: String,
    /// Minor version
    pub minor_version: u32,
    /// Confirmed by CREATE_SESSION or SETCLIENTID_CONFIRM
    pub confirmed: bool,
    /// Open sessions
    pub sessions: usize,
    /// Open and lock states
    pub states: usize,
    /// Lease still valid
    pub lease_valid: bool,
}

#[derive(Debug)]
struct ClientInner {
    confirmed: bool,
    session_sequence: u32,
    open_sequence: Option<u32>,
    lease_renewed: Instant,
    lease_expired: bool,
    reclaim_completed: bool,
    sessions: BTreeMap<u32, Arc<Nfs4Session>>,
}

/// An NFSv4 client
#[derive(Debug)]
pub struct Nfs4Client {
    id: ClientId,
    registration: ClientRegistration,
    lease_time: Duration,
    max_states: usize,
    inner: Mutex<ClientInner>,
    states: DashMap<[u8; 12], Arc<Nfs4State>>,
    state_counter: AtomicU32,
    live_states: AtomicUsize,
    disposed: AtomicBool,
}

impl Nfs4Client {
    /// Create an unconfirmed client whose lease starts now
    pub fn new(
        id: ClientId,
        registration: ClientRegistration,
        lease_time: Duration,
        max_states: usize,
    ) -> Self {
        Self {
            id,
            registration,
            lease_time,
            max_states,
            inner: Mutex::new(ClientInner {
                confirmed: false,
                session_sequence: 0,
                open_sequence: None,
                lease_renewed: Instant::now(),
                lease_expired: false,
                reclaim_completed: false,
                sessions: BTreeMap::new(),
            }),
            states: DashMap::new(),
            state_counter: AtomicU32::new(0),
            live_states: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Server-assigned client id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Client-chosen owner id
    pub fn owner(&self) -> &Bytes {
        &self.registration.owner
    }

    /// Boot verifier
    pub fn verifier(&self) -> Verifier {
        self.registration.verifier
    }

    /// Registering principal
    pub fn principal(&self) -> &str {
        &self.registration.principal
    }

    /// Client address
    pub fn remote_addr(&self) -> SocketAddr {
        self.registration.remote_addr
    }

    /// Server address the client registered through
    pub fn local_addr(&self) -> SocketAddr {
        self.registration.local_addr
    }

    /// Minor version used to register
    pub fn minor_version(&self) -> u32 {
        self.registration.minor_version
    }

    /// Confirmed by CREATE_SESSION or SETCLIENTID_CONFIRM
    pub fn is_confirmed(&self) -> bool {
        self.inner.lock().confirmed
    }

    /// Mark the client confirmed and renew its lease
    pub fn set_confirmed(&self) {
        let mut inner = self.inner.lock();
        inner.confirmed = true;
        inner.lease_renewed = Instant::now();
    }

    /// True while the lease has not run out
    pub fn is_lease_valid(&self) -> bool {
        let inner = self.inner.lock();
        !inner.lease_expired && inner.lease_renewed.elapsed() <= self.lease_time
    }

    /// Renew the lease, or fail with `Expired` if it already ran out
    ///
    /// Expiry is sticky: the client is marked expired under its mutex, so no
    /// state can be created after the decision, and every state it holds is
    /// dropped. The client must register again.
    pub fn update_lease(&self) -> Result<(), NfsStatus> {
        let mut inner = self.inner.lock();
        if inner.lease_expired {
            return Err(NfsStatus::Expired);
        }
        let idle = inner.lease_renewed.elapsed();
        if idle > self.lease_time {
            inner.lease_expired = true;
            drop(inner);
            let dropped = self.clear_states();
            info!(
                client = format_args!("{:016x}", self.id),
                idle_ms = idle.as_millis() as u64,
                dropped,
                "lease expired"
            );
            return Err(NfsStatus::Expired);
        }
        inner.lease_renewed = Instant::now();
        Ok(())
    }

    /// Sequence id the next CREATE_SESSION must carry
    pub fn current_session_sequence(&self) -> u32 {
        self.inner.lock().session_sequence
    }

    /// CREATE_SESSION sequencing
    ///
    /// An unconfirmed client must present the current sequence and becomes
    /// confirmed. A confirmed client presenting the previous sequence gets the
    /// session that request created.
    pub fn create_session(
        &self,
        sequence: u32,
        fore_channel: ChannelAttrs,
    ) -> Result<Arc<Nfs4Session>, NfsStatus> {
        let mut inner = self.inner.lock();

        if inner.confirmed && sequence == inner.session_sequence.wrapping_sub(1) {
            debug!(
                client = format_args!("{:016x}", self.id),
                sequence, "CREATE_SESSION retransmission"
            );
            // a destroyed session cannot be replayed
            return inner
                .sessions
                .get(&sequence)
                .cloned()
                .ok_or(NfsStatus::SeqMisordered);
        }
        if sequence != inner.session_sequence {
            return Err(NfsStatus::SeqMisordered);
        }

        let session = Arc::new(Nfs4Session::new(self.id, sequence, fore_channel));
        inner.sessions.insert(sequence, session.clone());
        inner.session_sequence = inner.session_sequence.wrapping_add(1);
        inner.confirmed = true;
        inner.lease_renewed = Instant::now();

        debug!(
            client = format_args!("{:016x}", self.id),
            session = %session.id(),
            "session created"
        );
        Ok(session)
    }

    /// Forget a session, returning it if it belonged to this client
    pub fn remove_session(&self, id: &SessionId) -> Option<Arc<Nfs4Session>> {
        let mut inner = self.inner.lock();
        match inner.sessions.get(&id.sequence()) {
            Some(session) if session.id() == *id => inner.sessions.remove(&id.sequence()),
            _ => None,
        }
    }

    /// All sessions
    pub fn sessions(&self) -> Vec<Arc<Nfs4Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// True if any session is open
    pub fn has_sessions(&self) -> bool {
        !self.inner.lock().sessions.is_empty()
    }

    /// Record RECLAIM_COMPLETE; a second call fails with `CompleteAlready`
    pub fn reclaim_complete(&self) -> Result<(), NfsStatus> {
        let mut inner = self.inner.lock();
        if inner.reclaim_completed {
            return Err(NfsStatus::CompleteAlready);
        }
        inner.reclaim_completed = true;
        Ok(())
    }

    /// True once RECLAIM_COMPLETE was received
    pub fn is_reclaim_completed(&self) -> bool {
        self.inner.lock().reclaim_completed
    }

    /// v4.0 open-owner sequencing
    ///
    /// The first call sets the baseline; each later call must present exactly
    /// the next sequence id.
    pub fn validate_open_sequence(&self, sequence: u32) -> Result<(), NfsStatus> {
        let mut inner = self.inner.lock();
        match inner.open_sequence {
            Some(last) if sequence != last.wrapping_add(1) => Err(NfsStatus::SeqMisordered),
            _ => {
                inner.open_sequence = Some(sequence);
                Ok(())
            }
        }
    }

    /// Create an open state, or a lock state under `parent`
    ///
    /// Fails with `Resource` once the client holds the maximum number of
    /// states, with `StaleClientId` once the client is disposed and with
    /// `Expired` once its lease ran out.
    pub fn create_state(
        &self,
        owner: StateOwner,
        parent: Option<Arc<Nfs4State>>,
    ) -> Result<Arc<Nfs4State>, NfsStatus> {
        // disposal and expiry are decided under the same mutex
        let inner = self.inner.lock();
        if self.is_disposed() {
            return Err(NfsStatus::StaleClientId);
        }
        if inner.lease_expired {
            return Err(NfsStatus::Expired);
        }

        self.live_states
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_states).then_some(n + 1)
            })
            .map_err(|_| NfsStatus::Resource)?;

        let counter = self.state_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let other = StateId::other_for(self.id, counter);
        let state = Arc::new(Nfs4State::new(other, owner, parent));
        self.states.insert(other, state.clone());
        drop(inner);
        Ok(state)
    }

    /// Look up a state by stateid, ignoring the sequence number
    pub fn state(&self, stateid: &StateId) -> Result<Arc<Nfs4State>, NfsStatus> {
        self.states
            .get(&stateid.other)
            .map(|entry| entry.value().clone())
            .ok_or(NfsStatus::BadStateid)
    }

    /// True if the client holds the state
    pub fn has_state(&self, stateid: &StateId) -> bool {
        self.states.contains_key(&stateid.other)
    }

    /// Number of states held
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Lock states held under the open named by `stateid`
    pub fn lock_states_of(&self, stateid: &StateId) -> Vec<Arc<Nfs4State>> {
        self.states
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .parent()
                    .is_some_and(|p| p.other() == &stateid.other)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Live open state `owner` holds on `file`
    pub fn open_state_for(&self, owner: &StateOwner, file: &FileHandle) -> Option<Arc<Nfs4State>> {
        self.states
            .iter()
            .find(|entry| {
                let state = entry.value();
                state.kind() == StateKind::Open
                    && state.owner() == owner
                    && state.file().as_ref() == Some(file)
            })
            .map(|entry| entry.value().clone())
    }

    /// Find the lock state `owner` holds under `open`
    pub fn lock_state_for(&self, open: &StateId, owner: &StateOwner) -> Option<Arc<Nfs4State>> {
        self.lock_states_of(open)
            .into_iter()
            .find(|state| state.owner() == owner)
    }

    /// Remove and dispose a state, along with lock states held under it
    pub fn release_state(&self, stateid: &StateId) -> Result<(), NfsStatus> {
        for child in self.lock_states_of(stateid) {
            self.detach(child.other());
        }
        if self.detach(&stateid.other) {
            Ok(())
        } else {
            Err(NfsStatus::BadStateid)
        }
    }

    fn detach(&self, other: &[u8; 12]) -> bool {
        match self.states.remove(other) {
            Some((_, state)) => {
                self.live_states.fetch_sub(1, Ordering::AcqRel);
                state.dispose();
                true
            }
            None => false,
        }
    }

    fn clear_states(&self) -> usize {
        let keys: Vec<[u8; 12]> = self.states.iter().map(|entry| *entry.key()).collect();
        keys.iter().filter(|other| self.detach(other)).count()
    }

    /// Dispose every state and drop every session; idempotent
    pub fn dispose(&self) {
        {
            let _inner = self.inner.lock();
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let dropped = self.clear_states();
        self.inner.lock().sessions.clear();
        debug!(
            client = format_args!("{:016x}", self.id),
            dropped, "client disposed"
        );
    }

    /// True once disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Management view of this client
    pub fn summary(&self) -> ClientSummary {
        let (confirmed, sessions, lease_valid) = {
            let inner = self.inner.lock();
            (
                inner.confirmed,
                inner.sessions.len(),
                !inner.lease_expired && inner.lease_renewed.elapsed() <= self.lease_time,
            )
        };
        ClientSummary {
            client_id: format!("{:016x}", self.id),
            owner: hex::encode(&self.registration.owner),
            principal: self.registration.principal.clone(),
            remote_addr: self.registration.remote_addr.to_string(),
            minor_version: self.registration.minor_version,
            confirmed,
            sessions,
            states: self.state_count(),
            lease_valid,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    pub(crate) fn registration(owner: &'static str) -> ClientRegistration {
        ClientRegistration {
            owner: Bytes::from_static(owner.as_bytes()),
            verifier: Verifier::from_u64(1),
            principal: String::new(),
            remote_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 700)),
            local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 2049)),
            minor_version: 1,
        }
    }

    fn client(lease: Duration, max_states: usize) -> Nfs4Client {
        Nfs4Client::new(7, registration("client"), lease, max_states)
    }

    fn owner() -> StateOwner {
        StateOwner::new(7, "owner")
    }

    #[test]
    fn test_create_session_confirms() {
        let client = client(Duration::from_secs(90), 16);
        assert!(!client.is_confirmed());

        let session = client.create_session(0, ChannelAttrs::default()).unwrap();
        assert!(client.is_confirmed());
        assert_eq!(client.current_session_sequence(), 1);

        let again = client.create_session(0, ChannelAttrs::default()).unwrap();
        assert!(Arc::ptr_eq(&session, &again));

        assert_eq!(
            client.create_session(2, ChannelAttrs::default()).unwrap_err(),
            NfsStatus::SeqMisordered
        );
        assert!(client.create_session(1, ChannelAttrs::default()).is_ok());
    }

    #[test]
    fn test_unconfirmed_requires_exact_sequence() {
        let client = client(Duration::from_secs(90), 16);
        assert_eq!(
            client.create_session(1, ChannelAttrs::default()).unwrap_err(),
            NfsStatus::SeqMisordered
        );
        assert!(!client.is_confirmed());
    }

    #[test]
    fn test_remove_session() {
        let client = client(Duration::from_secs(90), 16);
        let session = client.create_session(0, ChannelAttrs::default()).unwrap();
        assert!(client.has_sessions());

        assert!(client.remove_session(&SessionId::new(99, 0)).is_none());
        assert!(client.remove_session(&session.id()).is_some());
        assert!(!client.has_sessions());
    }

    #[test]
    fn test_state_cap() {
        let client = client(Duration::from_secs(90), 4);
        let states: Vec<_> = (0..4)
            .map(|_| client.create_state(owner(), None).unwrap())
            .collect();
        assert_eq!(
            client.create_state(owner(), None).unwrap_err(),
            NfsStatus::Resource
        );

        // releasing one frees room for another
        client.release_state(&states[0].stateid()).unwrap();
        assert!(client.create_state(owner(), None).is_ok());
    }

    #[test]
    fn test_stateids_are_unique_and_carry_client_id() {
        let client = client(Duration::from_secs(90), 16);
        let a = client.create_state(owner(), None).unwrap().stateid();
        let b = client.create_state(owner(), None).unwrap().stateid();
        assert_ne!(a.other, b.other);
        assert_eq!(a.client_id(), 7);
        assert!(client.has_state(&a));
    }

    #[test]
    fn test_release_state_cascades_to_locks() {
        let client = client(Duration::from_secs(90), 16);
        let open = client.create_state(owner(), None).unwrap();
        let lock = client
            .create_state(StateOwner::new(7, "locker"), Some(open.clone()))
            .unwrap();

        assert_eq!(client.lock_states_of(&open.stateid()).len(), 1);
        client.release_state(&open.stateid()).unwrap();
        assert!(!client.has_state(&lock.stateid()));
        assert!(lock.is_disposed());
        assert_eq!(
            client.release_state(&open.stateid()).unwrap_err(),
            NfsStatus::BadStateid
        );
    }

    #[test]
    fn test_lease_expiry_clears_states() {
        let client = client(Duration::from_millis(100), 16);
        let state = client.create_state(owner(), None).unwrap();
        assert!(client.update_lease().is_ok());

        std::thread::sleep(Duration::from_millis(150));
        assert!(!client.is_lease_valid());
        assert_eq!(client.update_lease().unwrap_err(), NfsStatus::Expired);
        assert!(!client.has_state(&state.stateid()));
        assert!(state.is_disposed());
    }

    #[test]
    fn test_no_state_after_expiry() {
        let client = client(Duration::from_millis(50), 16);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(client.update_lease().unwrap_err(), NfsStatus::Expired);

        assert_eq!(
            client.create_state(owner(), None).unwrap_err(),
            NfsStatus::Expired
        );
        // a later renewal attempt does not revive the lease
        client.set_confirmed();
        assert_eq!(client.update_lease().unwrap_err(), NfsStatus::Expired);
        assert!(!client.is_lease_valid());
        assert_eq!(client.state_count(), 0);
    }

    #[test]
    fn test_no_state_after_dispose() {
        let client = client(Duration::from_secs(90), 16);
        client.dispose();

        assert_eq!(
            client.create_state(owner(), None).unwrap_err(),
            NfsStatus::StaleClientId
        );
        assert_eq!(client.state_count(), 0);
        assert_eq!(client.summary().states, 0);
    }

    #[test]
    fn test_dispose_racing_create_state() {
        for _ in 0..100 {
            let client = client(Duration::from_secs(90), 1024);
            let barrier = std::sync::Barrier::new(2);
            let created = std::thread::scope(|s| {
                let creator = s.spawn(|| {
                    barrier.wait();
                    (0..16)
                        .filter_map(|_| client.create_state(owner(), None).ok())
                        .collect::<Vec<_>>()
                });
                s.spawn(|| {
                    barrier.wait();
                    client.dispose();
                });
                creator.join().unwrap()
            });

            // anything created before disposal was disposed with the client
            assert!(created.iter().all(|state| state.is_disposed()));
            assert_eq!(client.state_count(), 0);
        }
    }

    #[test]
    fn test_reclaim_complete_once() {
        let client = client(Duration::from_secs(90), 16);
        assert!(client.reclaim_complete().is_ok());
        assert_eq!(
            client.reclaim_complete().unwrap_err(),
            NfsStatus::CompleteAlready
        );
    }

    #[test]
    fn test_open_sequence() {
        let client = client(Duration::from_secs(90), 16);
        client.validate_open_sequence(10).unwrap();
        client.validate_open_sequence(11).unwrap();
        assert_eq!(
            client.validate_open_sequence(11).unwrap_err(),
            NfsStatus::SeqMisordered
        );
        assert_eq!(
            client.validate_open_sequence(20).unwrap_err(),
            NfsStatus::SeqMisordered
        );
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let client = client(Duration::from_secs(90), 16);
        let state = client.create_state(owner(), None).unwrap();
        client.create_session(0, ChannelAttrs::default()).unwrap();

        client.dispose();
        client.dispose();
        assert!(client.is_disposed());
        assert!(state.is_disposed());
        assert_eq!(client.state_count(), 0);
        assert!(!client.has_sessions());
    }

    #[test]
    fn test_summary() {
        let client = client(Duration::from_secs(90), 16);
        client.create_state(owner(), None).unwrap();
        let summary = client.summary();
        assert_eq!(summary.client_id, "0000000000000007");
        assert_eq!(summary.owner, hex::encode("client"));
        assert_eq!(summary.states, 1);
        assert!(!summary.confirmed);
        assert!(summary.lease_valid);
    }
}
