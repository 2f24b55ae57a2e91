//! Embedded state store for Cutover.
//!
//! Backed by [redb](https://docs.rs/redb), persists what a restarted
//! daemon needs to pick up where it left off: one record per deployment
//! group (shift state, pair weights, active shift, bake deadline), the
//! archive of finished shifts, and every pipeline run.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Archived shifts use `{group_id}:{shift_id}` keys so a group's history is
//! a prefix scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
