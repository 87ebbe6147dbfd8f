//! Client and session registry
//!
//! Clients are indexed three ways (id, owner and verifier, owner) under one
//! lock so a reader never sees a client in one index but not another. The
//! owner lookup and the decision to keep, register or replace a client are
//! made under the same write lock. Sessions live in a bounded cache whose idle
//! expiry matches the lease; the owning client keeps the authoritative session
//! list.
//!
//! Lock order: registry index before any client mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use moka::sync::Cache;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::client::{ClientRegistration, ClientSummary, Nfs4Client};
use super::session::{ChannelAttrs, Nfs4Session};
use super::{ClientId, SessionId, StateId, Verifier};
use crate::config::NfsConfig;
use crate::error::NfsStatus;

#[derive(Default)]
struct ClientIndex {
    by_id: HashMap<ClientId, Arc<Nfs4Client>>,
    by_verifier: HashMap<(Bytes, Verifier), Arc<Nfs4Client>>,
    by_owner: HashMap<Bytes, Arc<Nfs4Client>>,
}

fn verifier_key(client: &Nfs4Client) -> (Bytes, Verifier) {
    (client.owner().clone(), client.verifier())
}

impl ClientIndex {
    fn insert(&mut self, client: Arc<Nfs4Client>) {
        self.by_verifier.insert(verifier_key(&client), client.clone());
        self.by_owner.insert(client.owner().clone(), client.clone());
        self.by_id.insert(client.id(), client);
    }

    fn remove(&mut self, id: ClientId) -> Option<Arc<Nfs4Client>> {
        let client = self.by_id.remove(&id)?;
        // another incarnation may have taken over the shared keys
        let key = verifier_key(&client);
        if self.by_verifier.get(&key).is_some_and(|c| c.id() == id) {
            self.by_verifier.remove(&key);
        }
        if self
            .by_owner
            .get(client.owner())
            .is_some_and(|c| c.id() == id)
        {
            self.by_owner.remove(client.owner());
        }
        Some(client)
    }
}

/// What to do with the client currently registered for an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerAction {
    /// Keep the existing client
    Keep,
    /// Register a new client, replacing the existing one if any
    Register,
}

/// Registry of NFSv4 clients and their sessions
pub struct StateHandler {
    index: RwLock<ClientIndex>,
    sessions: Cache<SessionId, Arc<Nfs4Session>>,
    lease_time: Duration,
    grace_period: Duration,
    max_states: usize,
    boot_epoch: u32,
    started: Instant,
    next_client: AtomicU64,
}

impl StateHandler {
    /// Create a registry using the lease, grace and limits from `config`
    pub fn new(config: &NfsConfig) -> Self {
        let boot_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32);
        Self {
            index: RwLock::new(ClientIndex::default()),
            sessions: Cache::builder()
                .max_capacity(config.session_cache_capacity)
                .time_to_idle(config.lease_time * 2)
                .build(),
            lease_time: config.lease_time,
            grace_period: config.grace_period,
            max_states: config.max_states_per_client,
            boot_epoch,
            started: Instant::now(),
            next_client: AtomicU64::new(1),
        }
    }

    /// Lease duration shared by every client
    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// True once the post-start reclaim window has closed
    pub fn has_grace_period_expired(&self) -> bool {
        self.started.elapsed() > self.grace_period
    }

    /// Verifier returned by WRITE; changes across server restarts
    pub fn write_verifier(&self) -> Verifier {
        Verifier::from_u64(u64::from(self.boot_epoch))
    }

    fn allocate_client_id(&self) -> ClientId {
        let counter = self.next_client.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF;
        (u64::from(self.boot_epoch) << 32) | counter
    }

    fn new_client(&self, registration: ClientRegistration) -> Arc<Nfs4Client> {
        Arc::new(Nfs4Client::new(
            self.allocate_client_id(),
            registration,
            self.lease_time,
            self.max_states,
        ))
    }

    /// Create an unconfirmed client and index it
    ///
    /// A client already registered for the same owner is replaced.
    pub fn register_client(&self, registration: ClientRegistration) -> Arc<Nfs4Client> {
        let (client, replaced) = {
            let mut index = self.index.write();
            let existing = index.by_owner.get(&registration.owner).cloned();
            self.install(&mut index, registration, existing)
        };
        self.finish_registration(&client, replaced);
        client
    }

    /// Register a client for `registration.owner`, or keep the existing one
    ///
    /// `decide` sees the client currently registered for the owner and runs
    /// under the registry write lock, so concurrent registrations for one
    /// owner are serialized. A replaced client is disposed after the index
    /// update.
    pub fn register_owner<F>(
        &self,
        registration: ClientRegistration,
        decide: F,
    ) -> Result<Arc<Nfs4Client>, NfsStatus>
    where
        F: FnOnce(Option<&Arc<Nfs4Client>>) -> Result<OwnerAction, NfsStatus>,
    {
        let (client, replaced) = {
            let mut index = self.index.write();
            let existing = index.by_owner.get(&registration.owner).cloned();
            match (decide(existing.as_ref())?, existing) {
                (OwnerAction::Keep, Some(existing)) => return Ok(existing),
                (_, existing) => self.install(&mut index, registration, existing),
            }
        };
        self.finish_registration(&client, replaced);
        Ok(client)
    }

    fn install(
        &self,
        index: &mut ClientIndex,
        registration: ClientRegistration,
        existing: Option<Arc<Nfs4Client>>,
    ) -> (Arc<Nfs4Client>, Option<Arc<Nfs4Client>>) {
        let replaced = existing.and_then(|old| self.unindex(index, old.id()));
        let client = self.new_client(registration);
        index.insert(client.clone());
        (client, replaced)
    }

    fn finish_registration(&self, client: &Nfs4Client, replaced: Option<Arc<Nfs4Client>>) {
        match replaced {
            Some(old) => {
                old.dispose();
                info!(
                    old = format_args!("{:016x}", old.id()),
                    new = format_args!("{:016x}", client.id()),
                    "client replaced"
                );
            }
            None => debug!(
                client = format_args!("{:016x}", client.id()),
                remote = %client.remote_addr(),
                minor = client.minor_version(),
                "client registered"
            ),
        }
    }

    fn unindex(&self, index: &mut ClientIndex, id: ClientId) -> Option<Arc<Nfs4Client>> {
        let client = index.remove(id)?;
        for session in client.sessions() {
            self.sessions.invalidate(&session.id());
        }
        Some(client)
    }

    /// Remove a client and its sessions, then dispose its states
    pub fn remove_client(&self, id: ClientId) -> Result<(), NfsStatus> {
        let client = {
            let mut index = self.index.write();
            self.unindex(&mut index, id)
        }
        .ok_or(NfsStatus::StaleClientId)?;

        client.dispose();
        info!(client = format_args!("{:016x}", id), "client removed");
        Ok(())
    }

    /// Client by id
    pub fn client_by_id(&self, id: ClientId) -> Result<Arc<Nfs4Client>, NfsStatus> {
        self.index
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(NfsStatus::StaleClientId)
    }

    /// Client by owner id and boot verifier
    pub fn client_by_verifier(
        &self,
        owner: &[u8],
        verifier: Verifier,
    ) -> Option<Arc<Nfs4Client>> {
        self.index
            .read()
            .by_verifier
            .get(&(Bytes::copy_from_slice(owner), verifier))
            .cloned()
    }

    /// Client by owner id
    pub fn client_by_owner(&self, owner: &[u8]) -> Option<Arc<Nfs4Client>> {
        self.index.read().by_owner.get(owner).cloned()
    }

    /// Client that owns `stateid`
    pub fn resolve_client_for_state(&self, stateid: &StateId) -> Result<Arc<Nfs4Client>, NfsStatus> {
        self.client_by_id(stateid.client_id())
    }

    /// CREATE_SESSION for `client`, indexing the session it yields
    pub fn create_session(
        &self,
        client: &Nfs4Client,
        sequence: u32,
        fore_channel: ChannelAttrs,
    ) -> Result<Arc<Nfs4Session>, NfsStatus> {
        let index = self.index.write();
        if !index.by_id.contains_key(&client.id()) {
            return Err(NfsStatus::StaleClientId);
        }
        let session = client.create_session(sequence, fore_channel)?;
        self.sessions.insert(session.id(), session.clone());
        drop(index);
        Ok(session)
    }

    /// Session by id
    pub fn session_by_id(&self, id: &SessionId) -> Result<Arc<Nfs4Session>, NfsStatus> {
        let _index = self.index.read();
        self.sessions.get(id).ok_or(NfsStatus::BadSession)
    }

    /// Destroy a session; a client left without sessions is removed as well
    pub fn remove_session_by_id(&self, id: &SessionId) -> Result<(), NfsStatus> {
        let orphan = {
            let mut index = self.index.write();
            let client = index
                .by_id
                .get(&id.client_id())
                .cloned()
                .ok_or(NfsStatus::BadSession)?;
            let session = client.remove_session(id).ok_or(NfsStatus::BadSession)?;
            self.sessions.invalidate(&session.id());
            debug!(session = %id, "session destroyed");

            if client.has_sessions() {
                None
            } else {
                self.unindex(&mut index, client.id())
            }
        };

        if let Some(client) = orphan {
            client.dispose();
            info!(
                client = format_args!("{:016x}", client.id()),
                "client removed with its last session"
            );
        }
        Ok(())
    }

    /// Renew the lease of the client owning `stateid` (v4.0 READ/WRITE)
    pub fn update_client_lease_by_stateid(&self, stateid: &StateId) -> Result<(), NfsStatus> {
        self.resolve_client_for_state(stateid)?.update_lease()
    }

    /// Snapshot of every registered client, ordered by id
    pub fn list_clients(&self) -> Vec<ClientSummary> {
        let clients: Vec<Arc<Nfs4Client>> = self.index.read().by_id.values().cloned().collect();
        let mut summaries: Vec<ClientSummary> = clients.iter().map(|c| c.summary()).collect();
        summaries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        summaries
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.index.read().by_id.len()
    }

    /// Drop every client and session
    pub fn shutdown(&self) {
        let clients: Vec<Arc<Nfs4Client>> = {
            let mut index = self.index.write();
            let clients = index.by_id.drain().map(|(_, c)| c).collect();
            index.by_verifier.clear();
            index.by_owner.clear();
            self.sessions.invalidate_all();
            clients
        };
        let count = clients.len();
        for client in clients {
            client.dispose();
        }
        info!(clients = count, "state handler shut down");
    }
}

impl std::fmt::Debug for StateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandler")
            .field("clients", &self.client_count())
            .field("lease_time", &self.lease_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::client::tests::registration;
    use crate::nfs4::state::StateOwner;

    fn handler() -> StateHandler {
        StateHandler::new(&NfsConfig::default())
    }

    #[test]
    fn test_register_indexes_three_ways() {
        let handler = handler();
        let client = handler.register_client(registration("host-a"));

        assert!(Arc::ptr_eq(&handler.client_by_id(client.id()).unwrap(), &client));
        assert!(handler
            .client_by_verifier(b"host-a", client.verifier())
            .is_some());
        assert!(handler
            .client_by_verifier(b"host-b", client.verifier())
            .is_none());
        assert!(handler.client_by_owner(b"host-a").is_some());
        assert!(handler.client_by_owner(b"host-b").is_none());
        assert_eq!(handler.client_by_id(12345).unwrap_err(), NfsStatus::StaleClientId);
    }

    #[test]
    fn test_client_ids_are_unique() {
        let handler = handler();
        let a = handler.register_client(registration("a"));
        let b = handler.register_client(registration("b"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id() >> 32, b.id() >> 32);
    }

    #[test]
    fn test_remove_client_drops_sessions() {
        let handler = handler();
        let client = handler.register_client(registration("a"));
        let session = handler
            .create_session(&client, 0, ChannelAttrs::default())
            .unwrap();
        assert!(handler.session_by_id(&session.id()).is_ok());

        handler.remove_client(client.id()).unwrap();
        assert_eq!(
            handler.session_by_id(&session.id()).unwrap_err(),
            NfsStatus::BadSession
        );
        assert!(handler.client_by_owner(b"a").is_none());
        assert!(client.is_disposed());
        assert_eq!(
            handler.remove_client(client.id()).unwrap_err(),
            NfsStatus::StaleClientId
        );
    }

    #[test]
    fn test_last_session_removal_collects_client() {
        let handler = handler();
        let client = handler.register_client(registration("a"));
        let first = handler
            .create_session(&client, 0, ChannelAttrs::default())
            .unwrap();
        let second = handler
            .create_session(&client, 1, ChannelAttrs::default())
            .unwrap();

        handler.remove_session_by_id(&first.id()).unwrap();
        assert!(handler.client_by_id(client.id()).is_ok());

        handler.remove_session_by_id(&second.id()).unwrap();
        assert_eq!(
            handler.client_by_id(client.id()).unwrap_err(),
            NfsStatus::StaleClientId
        );
        assert_eq!(
            handler.remove_session_by_id(&second.id()).unwrap_err(),
            NfsStatus::BadSession
        );
    }

    #[test]
    fn test_resolve_client_for_state() {
        let handler = handler();
        let client = handler.register_client(registration("a"));
        let state = client
            .create_state(StateOwner::new(client.id(), "o"), None)
            .unwrap();

        let owner = handler.resolve_client_for_state(&state.stateid()).unwrap();
        assert_eq!(owner.id(), client.id());
        assert!(handler.update_client_lease_by_stateid(&state.stateid()).is_ok());
    }

    #[test]
    fn test_replace_client_keeps_indexes_consistent() {
        let handler = handler();
        let old = handler.register_client(registration("a"));
        let new = handler.register_client(registration("a"));

        assert!(old.is_disposed());
        assert_eq!(handler.client_by_owner(b"a").unwrap().id(), new.id());
        assert_eq!(
            handler
                .client_by_verifier(b"a", new.verifier())
                .unwrap()
                .id(),
            new.id()
        );
        assert_eq!(handler.client_count(), 1);
    }

    #[test]
    fn test_shared_verifier_across_owners() {
        let handler = handler();
        let a = handler.register_client(registration("a"));
        let b = handler.register_client(registration("b"));
        assert_eq!(a.verifier(), b.verifier());

        handler.remove_client(a.id()).unwrap();
        assert_eq!(
            handler
                .client_by_verifier(b"b", b.verifier())
                .unwrap()
                .id(),
            b.id()
        );
    }

    #[test]
    fn test_register_owner_keep_and_reject() {
        let handler = handler();
        let first = handler.register_client(registration("a"));

        let kept = handler
            .register_owner(registration("a"), |existing| {
                assert_eq!(existing.map(|c| c.id()), Some(first.id()));
                Ok(OwnerAction::Keep)
            })
            .unwrap();
        assert!(Arc::ptr_eq(&kept, &first));

        let err = handler
            .register_owner(registration("a"), |_| Err(NfsStatus::ClidInUse))
            .unwrap_err();
        assert_eq!(err, NfsStatus::ClidInUse);
        assert_eq!(handler.client_count(), 1);
        assert!(!first.is_disposed());
    }

    #[test]
    fn test_concurrent_registration_of_one_owner() {
        for _ in 0..50 {
            let handler = handler();
            let barrier = std::sync::Barrier::new(4);
            let ids: Vec<ClientId> = std::thread::scope(|s| {
                let workers: Vec<_> = (0..4)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            handler
                                .register_owner(registration("same"), |existing| {
                                    Ok(match existing {
                                        Some(_) => OwnerAction::Keep,
                                        None => OwnerAction::Register,
                                    })
                                })
                                .unwrap()
                                .id()
                        })
                    })
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });

            assert!(ids.iter().all(|id| *id == ids[0]));
            assert_eq!(handler.client_count(), 1);
            assert_eq!(handler.client_by_owner(b"same").unwrap().id(), ids[0]);
        }
    }

    #[test]
    fn test_grace_period() {
        let config = NfsConfig::default().grace_period(Duration::from_millis(20));
        let handler = StateHandler::new(&config);
        assert!(!handler.has_grace_period_expired());
        std::thread::sleep(Duration::from_millis(40));
        assert!(handler.has_grace_period_expired());
    }

    #[test]
    fn test_list_clients_and_shutdown() {
        let handler = handler();
        handler.register_client(registration("a"));
        handler.register_client(registration("b"));

        let clients = handler.list_clients();
        assert_eq!(clients.len(), 2);
        assert!(clients[0].client_id < clients[1].client_id);

        handler.shutdown();
        assert_eq!(handler.client_count(), 0);
        assert!(handler.list_clients().is_empty());
    }
}
