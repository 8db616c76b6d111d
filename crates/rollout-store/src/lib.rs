//! # rollout-store
//!
//! Append-only event log on SQLite (WAL mode).
//!
//! - One writer connection behind a mutex assigns gapless sequence numbers.
//! - A pool of read-only connections serves range queries.
//! - Live subscribers replay from storage, then follow a broadcast channel.

#![deny(unsafe_code)]

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod query;
pub mod schema;
pub mod subscription;

pub use config::{Durability, LogConfig};
pub use database::Database;
pub use error::{ErrorKind, LogError};
pub use events::{EventLog, Records};
pub use query::{QueryError, QueryOptions, SeqRange, DEFAULT_LIMIT, MAX_LIMIT};
pub use subscription::Subscription;
