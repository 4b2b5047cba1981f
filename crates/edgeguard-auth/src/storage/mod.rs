//! Storage traits for account records, token records and key-value data.
//!
//! This module defines storage interfaces for:
//!
//! - Account secret records and the username index
//! - Token records, indexed by lookup hash
//! - A key-value store for rate-limit counters and cache entries
//!
//! # Implementations
//!
//! - [`memory`] - in-process backends for tests and single-node tooling
//! - `edgeguard-auth-postgres` - PostgreSQL backend for accounts and tokens
//! - `edgeguard-kv-redis` - Redis backend for the key-value store

pub mod account;
pub mod kv;
pub mod memory;
pub mod token;

pub use account::AccountStorage;
pub use kv::{KvError, KvStore};
pub use memory::{MemoryAccountStorage, MemoryKvStore, MemoryTokenStorage};
pub use token::TokenStorage;
