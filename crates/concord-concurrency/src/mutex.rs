//! Distributed mutex
//!
//! Every contender writes one key under the lock prefix, named after its
//! session lease and attached to it. Contenders are ordered by the create
//! revision of those keys: the one with the smallest create revision holds the
//! lock, everyone else waits for all older keys to be deleted. Since revisions
//! are totally ordered, the lock is handed over strictly in arrival order, and a
//! crashed holder is evicted when its lease expires.

use std::sync::Arc;

use concord_store::{
    Compare, CompareResult, DeleteOptions, GetOptions, KvClient, LeaseId, Op, PutOptions,
    ResponseHeader, Revision, Txn,
};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConcurrencyError, Result};
use crate::metrics::{MUTEX_ACQUIRED, MUTEX_FAILED, MUTEX_RELEASED};
use crate::session::Session;
use crate::wait::{cancellable, wait_deletes};

/// Key of a mutex that has no candidate key in the store
const UNSET_KEY: &str = "\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    Unlocked,
    Locking,
    Locked,
    Unlocking,
}

/// Mutex over a key prefix, scoped to a session.
///
/// The struct only caches what this holder knows; the store keys are the
/// authoritative state. Two mutexes on the same prefix must not share a session,
/// since they would share the same candidate key.
pub struct Mutex {
    client: Arc<dyn KvClient>,
    lease: LeaseId,
    session_done: CancellationToken,
    prefix: String,
    my_key: String,
    my_revision: Revision,
    header: Option<ResponseHeader>,
    state: MutexState,
}

/// What the acquisition transaction found out
struct Attempt {
    header: ResponseHeader,
    is_owner: bool,
}

impl Mutex {
    pub fn new(session: &Session, prefix: &str) -> Self {
        Self {
            client: session.client().clone(),
            lease: session.lease(),
            session_done: session.done(),
            prefix: format!("{}/", prefix),
            my_key: UNSET_KEY.to_string(),
            my_revision: -1,
            header: None,
            state: MutexState::Unlocked,
        }
    }

    /// Acquire the lock, waiting behind every older contender.
    ///
    /// If the wait fails or `cancel` fires, the candidate key is deleted before
    /// the error is returned so it cannot hold up later contenders.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<()> {
        let attempt = self.try_acquire(cancel).await?;
        if attempt.is_owner {
            counter!(MUTEX_ACQUIRED, "path" => "fast").increment(1);
            self.header = Some(attempt.header);
            self.state = MutexState::Locked;
            return Ok(());
        }

        debug!(
            "Waiting for {} behind older contenders (revision {})",
            self.my_key, self.my_revision
        );
        match wait_deletes(
            self.client.as_ref(),
            &self.prefix,
            self.my_revision - 1,
            cancel,
        )
        .await
        {
            Ok(header) => {
                counter!(MUTEX_ACQUIRED, "path" => "wait").increment(1);
                self.header = Some(header);
                self.state = MutexState::Locked;
                Ok(())
            }
            Err(e) => {
                counter!(MUTEX_FAILED).increment(1);
                self.release_slot().await;
                Err(e)
            }
        }
    }

    /// Acquire the lock only if no older contender exists. Otherwise the
    /// candidate key is removed again and `ConcurrencyError::Locked` returned.
    pub async fn try_lock(&mut self, cancel: &CancellationToken) -> Result<()> {
        let attempt = self.try_acquire(cancel).await?;
        if attempt.is_owner {
            counter!(MUTEX_ACQUIRED, "path" => "fast").increment(1);
            self.header = Some(attempt.header);
            self.state = MutexState::Locked;
            return Ok(());
        }

        self.release_slot().await;
        Err(ConcurrencyError::Locked)
    }

    /// Delete the candidate key and forget it. Unlocking a mutex that holds
    /// nothing deletes a key that does not exist, which is not an error.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<()> {
        let previous = self.state;
        self.state = MutexState::Unlocking;
        let delete = self
            .client
            .delete(self.my_key.as_bytes().to_vec(), DeleteOptions::default());
        if let Err(e) = cancellable(cancel, delete).await {
            self.state = previous;
            return Err(e);
        }
        counter!(MUTEX_RELEASED).increment(1);
        self.reset();
        Ok(())
    }

    /// Comparison that holds only while this mutex owns the lock. Add it to a
    /// transaction to make writes conditional on ownership.
    pub fn is_owner(&self) -> Compare {
        Compare::create_revision(self.my_key.as_str(), CompareResult::Equal, self.my_revision)
    }

    pub fn key(&self) -> &str {
        &self.my_key
    }

    /// Create revision of the candidate key, -1 when unset
    pub fn revision(&self) -> Revision {
        self.my_revision
    }

    /// Header of the response that granted the lock
    pub fn header(&self) -> Option<ResponseHeader> {
        self.header
    }

    pub fn state(&self) -> MutexState {
        self.state
    }

    fn reset(&mut self) {
        self.my_key = UNSET_KEY.to_string();
        self.my_revision = -1;
        self.state = MutexState::Unlocked;
    }

    /// Create (or find) the candidate key and probe for the current owner in one
    /// transaction.
    async fn try_acquire(&mut self, cancel: &CancellationToken) -> Result<Attempt> {
        if cancel.is_cancelled() {
            return Err(ConcurrencyError::Canceled);
        }
        if self.session_done.is_cancelled() {
            return Err(ConcurrencyError::SessionClosed);
        }

        self.state = MutexState::Locking;
        self.my_key = format!("{}{:x}", self.prefix, self.lease);

        let txn = Txn::new()
            .when([Compare::create_revision(
                self.my_key.as_str(),
                CompareResult::Equal,
                0,
            )])
            .and_then([
                Op::put(self.my_key.as_str(), "", PutOptions::with_lease(self.lease)),
                Op::get(self.prefix.as_str(), GetOptions::first_create()),
            ])
            .or_else([
                Op::get(self.my_key.as_str(), GetOptions::default()),
                Op::get(self.prefix.as_str(), GetOptions::first_create()),
            ]);

        let resp = match cancellable(cancel, self.client.txn(txn)).await {
            Ok(resp) => resp,
            Err(e) => {
                counter!(MUTEX_FAILED).increment(1);
                // canceled mid-flight, the key may or may not have been written
                if e.is_canceled() {
                    self.release_slot().await;
                } else {
                    self.reset();
                }
                return Err(e);
            }
        };

        self.my_revision = if resp.succeeded {
            resp.header.revision
        } else {
            match resp.kvs(0).first() {
                Some(kv) => kv.create_revision,
                None => {
                    // lease lost between compare and read, nothing to clean up
                    self.reset();
                    return Err(ConcurrencyError::SessionClosed);
                }
            }
        };

        let is_owner = match resp.kvs(1).first() {
            None => true,
            Some(owner) => owner.create_revision == self.my_revision,
        };

        Ok(Attempt {
            header: resp.header,
            is_owner,
        })
    }

    /// Best-effort removal of the candidate key after a failed attempt. Lease
    /// expiry removes it eventually if this fails too.
    async fn release_slot(&mut self) {
        if let Err(e) = self
            .client
            .delete(self.my_key.as_bytes().to_vec(), DeleteOptions::default())
            .await
        {
            warn!("Failed to release mutex key {}: {}", self.my_key, e);
        }
        self.reset();
    }
}
