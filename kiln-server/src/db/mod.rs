//! Database layer.
//!
//! The engine's [`kiln_core::TaskStore`] trait is the seam; the default
//! implementation is [`sqlite::SqliteStore`]. To move to Postgres or MySQL,
//! implement the trait for a new type and swap the concrete type in
//! [`crate::state::AppState`].

pub mod sqlite;
