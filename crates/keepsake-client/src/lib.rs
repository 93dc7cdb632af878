//! # keepsake-client
//!
//! The data-consistency layer of the Keepsake app: capsule lifecycle,
//! friend-graph protocol, audience-scoped journal feeds, and the profile
//! directory, all speaking to the document store through its async handle.
//!
//! Components are cheap to clone (they share the store handle and session)
//! and every live listing they hand out carries a disposal handle the UI
//! must invoke on teardown.

pub mod auth;
pub mod capsules;
pub mod connections;
pub mod feed;
pub mod journal;
pub mod live;
pub mod photos;
pub mod profiles;

mod paths;

pub use auth::{sign_in, sign_up, AuthProvider, AuthUser};
pub use capsules::{CapsuleLifecycle, CapsulePatch, CapsuleRecord, CapsuleView};
pub use connections::ConnectionGraph;
pub use feed::{VisibilityFeed, PUBLIC_FEED_PAGE_SIZE};
pub use journal::{EntryPatch, EntryRecord, JournalEntries};
pub use live::Feed;
pub use photos::PhotoStore;
pub use profiles::ProfileDirectory;

use tracing_subscriber::{fmt, EnvFilter};

/// Install a tracing subscriber for binaries and tests. Safe to call more
/// than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keepsake_client=debug,keepsake_store=info,warn"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
