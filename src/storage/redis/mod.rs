//! Redis storage implementation.

mod kv_store;

pub use kv_store::RedisStore;
