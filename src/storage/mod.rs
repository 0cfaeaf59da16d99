//! `SQLite` storage layer for `gantry`.
//!
//! This module provides the persistence layer using `SQLite` with:
//! - Foreign-key enforcement (the commit stage's ordering guarantees rely
//!   on it)
//! - Transaction discipline for atomic writes
//! - Batched inserts with `INSERT OR IGNORE` for idempotent reference rows
//!
//! # Submodules
//!
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main `SQLite` storage implementation

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStorage;
