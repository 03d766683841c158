//! Concord Store - revisioned key-value client interface
//!
//! This crate provides:
//! - The `KvClient` trait consumed by the coordination protocols
//! - Request/response, transaction, lease and watch types
//! - `MemoryStore`, an in-process linearizable implementation

pub mod client;
pub mod error;
pub mod memory;
pub mod model;

pub use client::{KvClient, WatchStream};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use model::*;
