//! # keepsake-shared
//!
//! Domain models and cross-crate plumbing for the Keepsake application:
//! identifiers, persisted record structs, the error taxonomy, the session
//! context, and the clock seam used for all time-gated decisions.

pub mod clock;
pub mod models;
pub mod session;
pub mod timestamps;
pub mod types;

mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::AppError;
pub use models::*;
pub use session::Session;
pub use types::{CapsuleId, CapsuleStatus, EntryId, UserId, Visibility};

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, AppError>;
