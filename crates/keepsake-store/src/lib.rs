//! # keepsake-store
//!
//! The document store backing the Keepsake data layer: a narrow, async
//! handle over a single SQLite-owned task providing per-document atomic
//! read/write, atomic multi-document batches with preconditions, ordered
//! range queries, and push-based change subscriptions.
//!
//! One task owns the [`rusqlite::Connection`]; every [`DocumentStore`]
//! clone talks to it over a command channel, so writes are serialized and
//! a batch is all-or-nothing inside one SQLite transaction.

pub mod database;
pub mod documents;
pub mod migrations;
pub mod ops;
pub mod store;

mod error;

pub use database::Database;
pub use documents::Document;
pub use error::StoreError;
pub use ops::{DocPath, Filter, OrderBy, Query, WriteOp, MAX_IN_ARITY};
pub use store::{DocumentStore, QuerySubscription, SubscriptionHandle};

pub use error::Result;
