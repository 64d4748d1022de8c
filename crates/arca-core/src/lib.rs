//! Core of an arca instance: the metadata store, transfer orchestration,
//! peer client, and background task engine.
//!
//! The HTTP surface lives in `arca-server`; storage drivers and transfer
//! managers live in `arca-store`. This crate owns everything between: the
//! relational schema, the entity models and their invariants, the push
//! transfer state machines, and the workers that advance them.

pub mod client;
pub mod context;
pub mod db;
pub mod encryption;
pub mod error;
pub mod ingest;
pub mod migrations;
pub mod models;
pub mod scheduler;
pub mod tasks;

pub use rusqlite;

pub use context::CoreContext;
pub use db::{lock_db, shared, Database, SharedDb};
pub use encryption::CredentialKey;
pub use error::{CoreError, Result};
