//! In-process revisioned key-value store
//!
//! `MemoryStore` implements [`KvClient`] with the same observable semantics the
//! coordination protocols rely on from a replicated store:
//! - a single global revision, advanced once per mutating transaction
//! - per-key version history, so reads at past revisions and watch replay work
//! - TTL leases whose expiry deletes every attached key
//! - watches that never skip an event between their start revision and live delivery
//!
//! All state sits behind one lock; commits and watch fan-out happen under it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::client::{KvClient, WatchStream};
use crate::error::{Result, StoreError};
use crate::model::*;

/// One entry in a key's history. `kv == None` is a tombstone.
#[derive(Debug, Clone)]
struct KeyRevision {
    revision: Revision,
    kv: Option<KeyValue>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<Vec<u8>>,
}

struct Watcher {
    key: Vec<u8>,
    prefix: bool,
    start_revision: Revision,
    tx: mpsc::UnboundedSender<Result<WatchResponse>>,
}

impl Watcher {
    fn matches(&self, key: &[u8]) -> bool {
        key_matches(key, &self.key, self.prefix)
    }
}

struct StoreState {
    available: bool,
    revision: Revision,
    compact_revision: Revision,
    keys: BTreeMap<Vec<u8>, Vec<KeyRevision>>,
    events: Vec<WatchEvent>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            available: true,
            revision: 1,
            compact_revision: 0,
            keys: BTreeMap::new(),
            events: Vec::new(),
            leases: HashMap::new(),
            next_lease_id: 1,
            watchers: Vec::new(),
        }
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.revision,
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn current(&self, key: &[u8]) -> Option<&KeyValue> {
        self.keys
            .get(key)
            .and_then(|history| history.last())
            .and_then(|entry| entry.kv.as_ref())
    }

    fn view_at(history: &[KeyRevision], revision: Revision) -> Option<&KeyValue> {
        history
            .iter()
            .rev()
            .find(|entry| entry.revision <= revision)
            .and_then(|entry| entry.kv.as_ref())
    }

    fn range(&self, key: &[u8], options: &GetOptions) -> Result<GetResponse> {
        let read_revision = if options.revision > 0 {
            if options.revision > self.revision {
                return Err(StoreError::FutureRevision {
                    revision: options.revision,
                });
            }
            if options.revision < self.compact_revision {
                return Err(StoreError::Compacted {
                    compact_revision: self.compact_revision,
                });
            }
            options.revision
        } else {
            self.revision
        };
        Ok(self.read(key, options, read_revision))
    }

    /// Range read of the view at `read_revision`. Reading at `self.revision + 1`
    /// includes the writes of the transaction being applied.
    fn read(&self, key: &[u8], options: &GetOptions, read_revision: Revision) -> GetResponse {
        let mut kvs: Vec<KeyValue> = if options.prefix {
            self.keys
                .range(key.to_vec()..)
                .take_while(|(k, _)| k.starts_with(key))
                .filter_map(|(_, history)| Self::view_at(history, read_revision))
                .cloned()
                .collect()
        } else {
            self.keys
                .get(key)
                .and_then(|history| Self::view_at(history, read_revision))
                .cloned()
                .into_iter()
                .collect()
        };

        if options.max_create_revision > 0 {
            kvs.retain(|kv| kv.create_revision <= options.max_create_revision);
        }

        let count = kvs.len();
        if options.count_only {
            return GetResponse {
                header: self.header(),
                kvs: Vec::new(),
                count,
            };
        }

        if let Some((target, order)) = options.sort {
            kvs.sort_by(|a, b| {
                let ordering = match target {
                    SortTarget::Key => a.key.cmp(&b.key),
                    SortTarget::Version => a.version.cmp(&b.version),
                    SortTarget::Create => a.create_revision.cmp(&b.create_revision),
                    SortTarget::Mod => a.mod_revision.cmp(&b.mod_revision),
                    SortTarget::Value => a.value.cmp(&b.value),
                };
                match order {
                    SortOrder::Ascend => ordering,
                    SortOrder::Descend => ordering.reverse(),
                }
            });
        }

        if options.limit > 0 {
            kvs.truncate(options.limit);
        }

        GetResponse {
            header: self.header(),
            kvs,
            count,
        }
    }

    fn apply_put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        lease: LeaseId,
        revision: Revision,
        events: &mut Vec<WatchEvent>,
    ) {
        let previous = self.current(&key).cloned();
        let kv = match &previous {
            Some(prev) => KeyValue {
                key: key.clone(),
                value,
                create_revision: prev.create_revision,
                mod_revision: revision,
                version: prev.version + 1,
                lease,
            },
            None => KeyValue {
                key: key.clone(),
                value,
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease,
            },
        };

        if let Some(prev) = previous
            && prev.lease != lease
            && let Some(entry) = self.leases.get_mut(&prev.lease)
        {
            entry.keys.remove(&key);
        }
        if lease != NO_LEASE
            && let Some(entry) = self.leases.get_mut(&lease)
        {
            entry.keys.insert(key.clone());
        }

        self.keys.entry(key).or_default().push(KeyRevision {
            revision,
            kv: Some(kv.clone()),
        });
        events.push(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
    }

    fn apply_delete(
        &mut self,
        key: &[u8],
        options: DeleteOptions,
        revision: Revision,
        events: &mut Vec<WatchEvent>,
    ) -> usize {
        let targets: Vec<Vec<u8>> = if options.prefix {
            self.keys
                .range(key.to_vec()..)
                .take_while(|(k, _)| k.starts_with(key))
                .filter(|(_, history)| history.last().is_some_and(|e| e.kv.is_some()))
                .map(|(k, _)| k.clone())
                .collect()
        } else if self.current(key).is_some() {
            vec![key.to_vec()]
        } else {
            Vec::new()
        };

        for target in &targets {
            if let Some(lease) = self.current(target).map(|kv| kv.lease)
                && let Some(entry) = self.leases.get_mut(&lease)
            {
                entry.keys.remove(target);
            }
            self.keys
                .entry(target.clone())
                .or_default()
                .push(KeyRevision { revision, kv: None });
            events.push(WatchEvent {
                event_type: EventType::Delete,
                kv: KeyValue {
                    key: target.clone(),
                    mod_revision: revision,
                    ..Default::default()
                },
            });
        }

        targets.len()
    }

    /// Make `events` (all at `self.revision + 1`) visible and notify watchers.
    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        let header = self.header();

        self.watchers.retain(|watcher| {
            if header.revision < watcher.start_revision {
                return !watcher.tx.is_closed();
            }
            let matched: Vec<WatchEvent> = events
                .iter()
                .filter(|ev| watcher.matches(&ev.kv.key))
                .cloned()
                .collect();
            if matched.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchResponse {
                    header,
                    events: matched,
                }))
                .is_ok()
        });

        self.events.extend(events);
    }

    fn execute_txn(&mut self, txn: Txn) -> Result<TxnResponse> {
        let succeeded = txn
            .compare
            .iter()
            .all(|cmp| cmp.evaluate(self.current(&cmp.key)));
        let ops = if succeeded { txn.success } else { txn.failure };

        for op in &ops {
            if let Op::Put { options, .. } = op
                && options.lease != NO_LEASE
                && !self.leases.contains_key(&options.lease)
            {
                return Err(StoreError::LeaseNotFound(options.lease));
            }
        }

        let revision = self.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                Op::Get { key, options } => {
                    // reads inside a transaction observe its earlier writes
                    responses.push(OpResponse::Get(self.read(&key, &options, revision)));
                }
                Op::Put {
                    key,
                    value,
                    options,
                } => {
                    self.apply_put(key, value, options.lease, revision, &mut events);
                    responses.push(OpResponse::Put(PutResponse::default()));
                }
                Op::Delete { key, options } => {
                    let deleted = self.apply_delete(&key, options, revision, &mut events);
                    responses.push(OpResponse::Delete(DeleteResponse {
                        deleted,
                        ..Default::default()
                    }));
                }
            }
        }

        self.commit(events);
        let header = self.header();
        for resp in &mut responses {
            match resp {
                OpResponse::Get(r) => r.header = header,
                OpResponse::Put(r) => r.header = header,
                OpResponse::Delete(r) => r.header = header,
            }
        }

        Ok(TxnResponse {
            header,
            succeeded,
            responses,
        })
    }

    fn revoke_lease(&mut self, id: LeaseId) -> Result<()> {
        let entry = self
            .leases
            .remove(&id)
            .ok_or(StoreError::LeaseNotFound(id))?;

        let revision = self.revision + 1;
        let mut events = Vec::new();
        for key in entry.keys {
            self.apply_delete(&key, DeleteOptions::default(), revision, &mut events);
        }
        self.commit(events);
        Ok(())
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!("Lease {:x} expired, deleting attached keys", id);
            let _ = self.revoke_lease(id);
        }
    }

    fn compact(&mut self, revision: Revision) -> Result<()> {
        if revision > self.revision {
            return Err(StoreError::FutureRevision { revision });
        }
        if revision <= self.compact_revision {
            return Err(StoreError::Compacted {
                compact_revision: self.compact_revision,
            });
        }
        self.compact_revision = revision;

        self.keys.retain(|_, history| {
            let keep_from = history
                .iter()
                .rposition(|entry| entry.revision <= revision)
                .unwrap_or(0);
            history.drain(..keep_from);
            if history
                .first()
                .is_some_and(|entry| entry.revision <= revision && entry.kv.is_none())
            {
                history.remove(0);
            }
            !history.is_empty()
        });
        self.events.retain(|ev| ev.kv.mod_revision >= revision);

        let compact_revision = revision;
        self.watchers.retain(|watcher| {
            if watcher.start_revision < compact_revision {
                let _ = watcher
                    .tx
                    .send(Err(StoreError::Compacted { compact_revision }));
                false
            } else {
                true
            }
        });

        info!("Compacted memory store at revision {}", revision);
        Ok(())
    }
}

/// In-process implementation of [`KvClient`]
///
/// Key history and the event log grow with every write until [`MemoryStore::compact`]
/// is called; long-running users should compact periodically.
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    reaper_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::new())),
            reaper_handle: None,
        }
    }

    /// Start a background task that expires leases every `period`, so that keys
    /// vanish even when nobody calls into the store.
    pub fn with_lease_reaper(self, period: Duration) -> Self {
        let weak: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.lock().expire_leases(Instant::now());
            }
        });

        Self {
            state: self.state.clone(),
            reaper_handle: Some(handle),
        }
    }

    /// Take the store offline (`false`) or back online. While offline every call
    /// fails with `Unavailable` and open watch streams are terminated.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        if !available {
            for watcher in state.watchers.drain(..) {
                let _ = watcher.tx.send(Err(StoreError::Unavailable(
                    "memory store went offline".to_string(),
                )));
            }
        }
    }

    /// Discard history older than `revision`.
    pub fn compact(&self, revision: Revision) -> Result<()> {
        self.state.lock().compact(revision)
    }

    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    /// Number of live leases, after expiring the overdue ones.
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state.leases.len()
    }

    /// Lock the state for an operation: availability check, then lazy lease expiry.
    fn lock_state(&self) -> Result<parking_lot::MutexGuard<'_, StoreState>> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases(Instant::now());
        Ok(state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl KvClient for MemoryStore {
    async fn get(&self, key: Vec<u8>, options: GetOptions) -> Result<GetResponse> {
        self.lock_state()?.range(&key, &options)
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>, options: PutOptions) -> Result<PutResponse> {
        let resp = self
            .lock_state()?
            .execute_txn(Txn::new().and_then([Op::Put {
                key,
                value,
                options,
            }]))?;
        Ok(PutResponse {
            header: resp.header,
        })
    }

    async fn delete(&self, key: Vec<u8>, options: DeleteOptions) -> Result<DeleteResponse> {
        let resp = self
            .lock_state()?
            .execute_txn(Txn::new().and_then([Op::Delete { key, options }]))?;
        let deleted = resp
            .responses
            .first()
            .and_then(OpResponse::as_delete)
            .map(|d| d.deleted)
            .unwrap_or(0);
        Ok(DeleteResponse {
            header: resp.header,
            deleted,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.lock_state()?.execute_txn(txn)
    }

    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        if ttl <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "lease TTL must be positive, got {}",
                ttl
            )));
        }
        let mut state = self.lock_state()?;
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
                keys: BTreeSet::new(),
            },
        );
        debug!("Granted lease {:x} with ttl {}s", id, ttl);
        Ok(LeaseGrantResponse {
            header: state.header(),
            id,
            ttl,
        })
    }

    async fn revoke(&self, id: LeaseId) -> Result<ResponseHeader> {
        let mut state = self.lock_state()?;
        state.revoke_lease(id)?;
        Ok(state.header())
    }

    async fn keep_alive_once(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse> {
        let mut state = self.lock_state()?;
        let header = state.header();
        let entry = state
            .leases
            .get_mut(&id)
            .ok_or(StoreError::LeaseNotFound(id))?;
        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl as u64);
        Ok(LeaseKeepAliveResponse {
            header,
            id,
            ttl: entry.ttl,
        })
    }

    async fn time_to_live(&self, id: LeaseId) -> Result<LeaseTimeToLiveResponse> {
        let state = self.lock_state()?;
        let entry = state.leases.get(&id).ok_or(StoreError::LeaseNotFound(id))?;
        let remaining = entry.deadline.saturating_duration_since(Instant::now());
        Ok(LeaseTimeToLiveResponse {
            header: state.header(),
            id,
            ttl: remaining.as_secs() as i64,
            granted_ttl: entry.ttl,
        })
    }

    async fn watch(&self, key: Vec<u8>, options: WatchOptions) -> Result<WatchStream> {
        let mut state = self.lock_state()?;
        let start_revision = if options.start_revision > 0 {
            options.start_revision
        } else {
            state.revision + 1
        };
        if start_revision < state.compact_revision {
            return Err(StoreError::Compacted {
                compact_revision: state.compact_revision,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();

        // replay history from the start revision, one response per revision
        let mut pending: Option<WatchResponse> = None;
        for ev in state
            .events
            .iter()
            .filter(|ev| ev.kv.mod_revision >= start_revision)
            .filter(|ev| key_matches(&ev.kv.key, &key, options.prefix))
        {
            let revision = ev.kv.mod_revision;
            match pending.as_mut() {
                Some(resp) if resp.header.revision == revision => resp.events.push(ev.clone()),
                _ => {
                    if let Some(resp) = pending.take() {
                        let _ = tx.send(Ok(resp));
                    }
                    pending = Some(WatchResponse {
                        header: ResponseHeader { revision },
                        events: vec![ev.clone()],
                    });
                }
            }
        }
        if let Some(resp) = pending {
            let _ = tx.send(Ok(resp));
        }

        state.watchers.push(Watcher {
            key,
            prefix: options.prefix,
            start_revision,
            tx,
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
