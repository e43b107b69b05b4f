//! Persistence and reconciliation for batch changes.
//!
//! A batch change applies a batch spec (a set of changeset specs) across
//! repositories and tracks the changesets that result. [`db::Store`] is the
//! entry point; [`rewirer`] matches a new batch spec against the changesets
//! of a previous application.

pub mod authz;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod namespace;
pub mod predicate;
pub mod rewirer;
pub mod search;
pub mod state;
pub mod worker;

pub use db::Store;
pub use error::{Result, StoreError};
