//! Lease-backed sessions
//!
//! A session owns one store lease and keeps it alive from a background task for
//! as long as the session lives. Keys written by mutexes and queues under the
//! session's lease disappear when the session is closed or its lease expires.

use std::sync::Arc;
use std::time::Duration;

use concord_store::{KvClient, LeaseId, StoreError};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::{SESSION_KEEPALIVE_FAILURES, SESSIONS_ALIVE};

/// Default session TTL in seconds
pub const DEFAULT_SESSION_TTL: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lease TTL in seconds, used when a new lease is granted
    pub ttl_secs: i64,
    /// Reuse this lease instead of granting a new one
    pub lease: Option<LeaseId>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL,
            lease: None,
        }
    }
}

impl SessionConfig {
    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// A lease kept alive on behalf of one logical client
pub struct Session {
    client: Arc<dyn KvClient>,
    lease: LeaseId,
    ttl: i64,
    /// Stops the keep-alive task
    stop: CancellationToken,
    /// Cancelled once the keep-alive task has exited
    done: CancellationToken,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open a session with a freshly granted lease of the default TTL.
    pub async fn open(client: Arc<dyn KvClient>) -> Result<Self> {
        Self::open_with_config(client, SessionConfig::default()).await
    }

    pub async fn open_with_config(client: Arc<dyn KvClient>, config: SessionConfig) -> Result<Self> {
        let (lease, ttl) = match config.lease {
            Some(id) => {
                let resp = client.keep_alive_once(id).await?;
                (id, resp.ttl)
            }
            None => {
                let resp = client.grant(config.ttl_secs).await?;
                (resp.id, resp.ttl)
            }
        };

        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let task = KeepAliveTask {
            client: client.clone(),
            lease,
            ttl,
            stop: stop.clone(),
            done: done.clone(),
        };
        let handle = tokio::spawn(task.run());

        info!("Opened session with lease {:x} (ttl {}s)", lease, ttl);

        Ok(Self {
            client,
            lease,
            ttl,
            stop,
            done,
            keepalive_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn client(&self) -> &Arc<dyn KvClient> {
        &self.client
    }

    /// The lease scoping every key created through this session
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Granted TTL in seconds
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// Token cancelled when the keep-alive task stops, whether because the
    /// session was closed or orphaned, the lease disappeared, or the store stayed
    /// unreachable for longer than the TTL. After that the lease will expire and
    /// any mutex held under it must be treated as lost.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Stop renewing the lease without revoking it. Keys stay until the lease
    /// runs out on its own. Returns only once the keep-alive task has exited,
    /// also for callers racing the one that joins it.
    pub async fn orphan(&self) {
        self.stop.cancel();
        let handle = self.keepalive_handle.lock().take();
        match handle {
            Some(handle) => {
                let _ = handle.await;
                // the task may have panicked before signalling
                self.done.cancel();
            }
            None => self.done.cancelled().await,
        }
    }

    /// Stop the keep-alive task, then revoke the lease, deleting every key
    /// attached to it. Calling it again is harmless.
    pub async fn close(&self) -> Result<()> {
        self.orphan().await;

        let revoke = self.client.revoke(self.lease);
        let timeout = Duration::from_secs(self.ttl.max(1) as u64);
        match tokio::time::timeout(timeout, revoke).await {
            Ok(Ok(_)) => {
                info!("Closed session, revoked lease {:x}", self.lease);
                Ok(())
            }
            Ok(Err(StoreError::LeaseNotFound(_))) => {
                debug!("Lease {:x} already gone on close", self.lease);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StoreError::Unavailable(format!(
                "revoking lease {:x} timed out",
                self.lease
            ))
            .into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct KeepAliveTask {
    client: Arc<dyn KvClient>,
    lease: LeaseId,
    ttl: i64,
    stop: CancellationToken,
    done: CancellationToken,
}

impl KeepAliveTask {
    /// Renew at a third of the TTL. Transient failures are retried on the same
    /// cadence until a full TTL has passed since the last successful renewal.
    async fn run(self) {
        gauge!(SESSIONS_ALIVE).increment(1.0);

        let ttl = Duration::from_secs(self.ttl.max(1) as u64);
        let period = ttl / 3;
        let mut ticker = interval_at(Instant::now() + period, period);
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let renewal = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                res = self.client.keep_alive_once(self.lease) => res,
            };

            match renewal {
                Ok(resp) => {
                    last_renewed = Instant::now();
                    debug!("Renewed lease {:x}, ttl {}s", self.lease, resp.ttl);
                }
                Err(StoreError::LeaseNotFound(_)) => {
                    counter!(SESSION_KEEPALIVE_FAILURES).increment(1);
                    warn!("Lease {:x} no longer exists, session is dead", self.lease);
                    break;
                }
                Err(e) => {
                    counter!(SESSION_KEEPALIVE_FAILURES).increment(1);
                    if last_renewed.elapsed() >= ttl {
                        warn!(
                            "Lease {:x} not renewed within its ttl, session is dead: {}",
                            self.lease, e
                        );
                        break;
                    }
                    warn!("Lease {:x} renewal failed, will retry: {}", self.lease, e);
                }
            }
        }

        gauge!(SESSIONS_ALIVE).decrement(1.0);
        self.done.cancel();
    }
}
