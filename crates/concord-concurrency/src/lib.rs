//! Concord Concurrency - distributed locking and queueing over a revisioned store
//!
//! This crate provides:
//! - `Session`: a lease kept alive in the background, scoping every key below
//! - `Mutex`: mutual exclusion granted in creation-revision order
//! - `Queue`: FIFO hand-off of opaque payloads
//! - Watch-based wait primitives shared by both
//!
//! All coordination happens in the store through conditional transactions; no
//! in-process lock is shared between instances.
//!
//! ```ignore
//! let session = Session::open(client.clone()).await?;
//! let mut mutex = Mutex::new(&session, "/resources/printer");
//! let cancel = CancellationToken::new();
//!
//! mutex.lock(&cancel).await?;
//! // critical section
//! mutex.unlock(&cancel).await?;
//! session.close().await?;
//! ```

pub mod error;
pub mod metrics;
pub mod mutex;
pub mod queue;
pub mod session;
pub mod wait;

pub use error::{ConcurrencyError, Result};
pub use mutex::{Mutex, MutexState};
pub use queue::Queue;
pub use session::{DEFAULT_SESSION_TTL, Session, SessionConfig};
pub use wait::{wait_delete, wait_deletes, wait_prefix_puts};

// Callers pass cancellation tokens to every blocking operation
pub use tokio_util::sync::CancellationToken;
