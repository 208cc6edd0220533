//! Docpipe Task Store
//!
//! This crate provides the durable coordination state shared by every
//! pipeline component: the task table, the worker registry, the append-only
//! error log, and the buffered emit payloads. All synchronization between
//! components happens through this store; they never share in-memory mutable
//! state.
//!
//! Two backends implement the [`TaskStore`] trait: [`SqliteTaskStore`], the
//! embedded SQL backend used in production, and [`MemoryTaskStore`], an
//! in-memory backend that keeps the concurrency contracts testable without a
//! database file.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;
pub use store::{SharedStore, TaskStore};
