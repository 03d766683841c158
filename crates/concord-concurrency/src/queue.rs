//! Distributed FIFO queue
//!
//! Each item is a key under the queue prefix. The key name is random; order
//! comes from the create revision the store assigns, so items are handed out
//! in the order their writes were committed.

use std::sync::Arc;

use concord_store::{Compare, CompareResult, GetOptions, KvClient, Op, PutOptions, Txn};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConcurrencyError, Result};
use crate::metrics::{QUEUE_DEQUEUE_CONFLICTS, QUEUE_DEQUEUED, QUEUE_ENQUEUED};
use crate::wait::{cancellable, wait_prefix_puts};

pub struct Queue {
    client: Arc<dyn KvClient>,
    /// Item key prefix, including the trailing separator
    key_prefix: String,
}

impl Queue {
    pub fn new(client: Arc<dyn KvClient>, prefix: &str) -> Self {
        Self {
            client,
            key_prefix: format!("{}/", prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Append a value. Returns once the store has committed the item.
    pub async fn enqueue(&self, value: impl Into<Vec<u8>>) -> Result<()> {
        let value = value.into();
        loop {
            let key = format!("{}{}", self.key_prefix, Uuid::new_v4().simple());
            let txn = Txn::new()
                .when([Compare::create_revision(key.as_str(), CompareResult::Equal, 0)])
                .and_then([Op::put(key.as_str(), value.clone(), PutOptions::default())]);

            let resp = self.client.txn(txn).await?;
            if resp.succeeded {
                counter!(QUEUE_ENQUEUED).increment(1);
                debug!("Enqueued {} at revision {}", key, resp.header.revision);
                return Ok(());
            }
            debug!("Queue key {} already taken, regenerating", key);
        }
    }

    /// Remove and return the oldest item, waiting for one if the queue is empty.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        loop {
            let resp = cancellable(
                cancel,
                self.client
                    .get(self.key_prefix.as_bytes().to_vec(), GetOptions::first_create()),
            )
            .await?;

            let Some(item) = resp.kvs.into_iter().next() else {
                wait_prefix_puts(
                    self.client.as_ref(),
                    &self.key_prefix,
                    resp.header.revision + 1,
                    cancel,
                )
                .await?;
                continue;
            };

            if cancel.is_cancelled() {
                return Err(ConcurrencyError::Canceled);
            }

            // claim the item only if nobody touched it since the read; the claim
            // is awaited to completion so a committed delete is never dropped
            let claim = Txn::new()
                .when([Compare::mod_revision(
                    item.key.clone(),
                    CompareResult::Equal,
                    item.mod_revision,
                )])
                .and_then([Op::delete(item.key.clone())]);
            let resp = self.client.txn(claim).await?;

            if resp.succeeded {
                counter!(QUEUE_DEQUEUED).increment(1);
                return Ok(item.value);
            }

            counter!(QUEUE_DEQUEUE_CONFLICTS).increment(1);
            debug!("Lost race for queue item {}, retrying", item.key_str());
        }
    }

    /// Number of items currently waiting
    pub async fn len(&self) -> Result<usize> {
        let resp = self
            .client
            .get(
                self.key_prefix.as_bytes().to_vec(),
                GetOptions::prefix().with_count_only(),
            )
            .await?;
        Ok(resp.count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
