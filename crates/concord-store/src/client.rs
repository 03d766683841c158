//! Key-value client interface
//!
//! The coordination protocols only talk to the store through [`KvClient`]. The
//! store is assumed linearizable: every client observes the same revision order.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::model::*;

/// Ordered stream of watch responses. Ends after a compaction error or when the
/// store goes away.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchResponse>> + Send>>;

/// Revisioned, lease-capable key-value client
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Range read
    async fn get(&self, key: Vec<u8>, options: GetOptions) -> Result<GetResponse>;

    async fn put(&self, key: Vec<u8>, value: Vec<u8>, options: PutOptions) -> Result<PutResponse>;

    async fn delete(&self, key: Vec<u8>, options: DeleteOptions) -> Result<DeleteResponse>;

    /// Atomic compare-then-branch over multiple operations
    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Grant a lease with the given TTL in seconds
    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke(&self, id: LeaseId) -> Result<ResponseHeader>;

    /// Renew a lease once, resetting its deadline to the granted TTL
    async fn keep_alive_once(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse>;

    async fn time_to_live(&self, id: LeaseId) -> Result<LeaseTimeToLiveResponse>;

    /// Watch a key or prefix starting at `options.start_revision`
    async fn watch(&self, key: Vec<u8>, options: WatchOptions) -> Result<WatchStream>;
}
