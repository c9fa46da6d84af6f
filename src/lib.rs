//! Redbus - durable messaging primitives on a shared key-value store
//!
//! At-least-once point-to-point queues with crash-safe claim leases, plus
//! saga, timeout and subscription stores, all writing to Redis through
//! atomic batches. Writes can be deferred to a caller-owned two-phase
//! transaction through the [`transaction`] bridge.

pub mod address;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod queue;
pub mod saga;
pub mod storage;
pub mod subscription;
pub mod timeout;
pub mod transaction;

pub use address::Address;
pub use error::{Error, Result};
