//! Watch-based waits shared by the mutex and queue recipes
//!
//! None of these poll: each one reads the store once, then blocks on a watch
//! opened at the revision of that read, so a change committed between the read
//! and the watch is replayed rather than missed. A watch that ends because its
//! start point was compacted is not trusted; the wait starts over from a fresh
//! read instead.

use concord_store::{
    GetOptions, KvClient, ResponseHeader, Revision, StoreError, WatchEvent, WatchOptions,
    WatchStream,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConcurrencyError, Result};

/// Await a store call unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = concord_store::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConcurrencyError::Canceled),
        res = fut => res.map_err(ConcurrencyError::from),
    }
}

enum WatchOutcome {
    Matched(WatchEvent),
    Compacted,
}

/// Consume `stream` until an event satisfies `filter`.
async fn next_matching<F>(
    mut stream: WatchStream,
    cancel: &CancellationToken,
    filter: F,
) -> Result<WatchOutcome>
where
    F: Fn(&WatchEvent) -> bool,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConcurrencyError::Canceled),
            item = stream.next() => item,
        };

        match item {
            Some(Ok(resp)) => {
                if let Some(ev) = resp.events.into_iter().find(|ev| filter(ev)) {
                    return Ok(WatchOutcome::Matched(ev));
                }
            }
            Some(Err(StoreError::Compacted { compact_revision })) => {
                debug!("Watch compacted at revision {}, re-reading", compact_revision);
                return Ok(WatchOutcome::Compacted);
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(StoreError::Unavailable("watch stream closed".to_string()).into());
            }
        }
    }
}

/// Block until `key` is deleted, watching from `revision`.
///
/// Returns `Ok(false)` when the watch was compacted before the delete was seen;
/// the caller must re-read to find out whether the key is still there.
pub async fn wait_delete(
    client: &dyn KvClient,
    key: &[u8],
    revision: Revision,
    cancel: &CancellationToken,
) -> Result<bool> {
    let stream = cancellable(
        cancel,
        client.watch(key.to_vec(), WatchOptions::key_from(revision)),
    )
    .await?;

    match next_matching(stream, cancel, WatchEvent::is_delete).await? {
        WatchOutcome::Matched(_) => Ok(true),
        WatchOutcome::Compacted => Ok(false),
    }
}

/// Block until every key under `prefix` created at or before
/// `max_create_revision` has been deleted.
///
/// Waits on the youngest such key first; each round strictly shrinks the set of
/// older keys, so the loop terminates once they are all gone. Returns the header
/// of the final, empty read.
///
/// Revisions start at 1, so a `max_create_revision` below 1 has no older keys
/// and returns right away.
pub async fn wait_deletes(
    client: &dyn KvClient,
    prefix: &str,
    max_create_revision: Revision,
    cancel: &CancellationToken,
) -> Result<ResponseHeader> {
    if max_create_revision < 1 {
        let resp = cancellable(
            cancel,
            client.get(
                prefix.as_bytes().to_vec(),
                GetOptions::prefix().with_count_only(),
            ),
        )
        .await?;
        return Ok(resp.header);
    }

    loop {
        let resp = cancellable(
            cancel,
            client.get(
                prefix.as_bytes().to_vec(),
                GetOptions::last_create().with_max_create_revision(max_create_revision),
            ),
        )
        .await?;

        let Some(last) = resp.kvs.first() else {
            return Ok(resp.header);
        };

        debug!(
            "Waiting for deletion of {} (create revision {})",
            last.key_str(),
            last.create_revision
        );
        wait_delete(client, &last.key, resp.header.revision, cancel).await?;
    }
}

/// Block until a key is created under `prefix` at or after `revision`.
///
/// Returns `None` when the watch was compacted; the caller re-reads either way.
pub async fn wait_prefix_puts(
    client: &dyn KvClient,
    prefix: &str,
    revision: Revision,
    cancel: &CancellationToken,
) -> Result<Option<WatchEvent>> {
    let stream = cancellable(
        cancel,
        client.watch(
            prefix.as_bytes().to_vec(),
            WatchOptions::prefix_from(revision),
        ),
    )
    .await?;

    match next_matching(stream, cancel, WatchEvent::is_create).await? {
        WatchOutcome::Matched(ev) => Ok(Some(ev)),
        WatchOutcome::Compacted => Ok(None),
    }
}
