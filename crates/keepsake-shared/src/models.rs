//! Record structs matching the persisted document contract.
//!
//! Field names are camelCase on the wire (`#[serde(rename_all = "camelCase")]`)
//! so the stored JSON matches the schema the mobile clients already read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CapsuleStatus, UserId, Visibility};

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// A user's display profile, stored at `users/{uid}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub email: String,
    pub display_name: String,
    /// Publicly resolvable avatar URL, set after a photo upload.
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(with = "crate::timestamps")]
    pub created_at: DateTime<Utc>,
}

/// A profile together with the uid it was resolved from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedProfile {
    pub user_id: UserId,
    pub profile: UserProfile,
}

// ---------------------------------------------------------------------------
// Capsule
// ---------------------------------------------------------------------------

/// A scheduled, time-locked message, stored at `timeCapsules/{id}`.
///
/// `user_id` is the sender (the field keeps its historical wire name).
/// `is_delivered` is the opened flag; the derived lifecycle state lives in
/// [`CapsuleStatus`], never in the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capsule {
    pub user_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub title: Option<String>,
    pub message: String,
    #[serde(with = "crate::timestamps")]
    pub delivery_date: DateTime<Utc>,
    pub is_delivered: bool,
    #[serde(with = "crate::timestamps")]
    pub created_at: DateTime<Utc>,
}

impl Capsule {
    /// Lifecycle state at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> CapsuleStatus {
        CapsuleStatus::derive(self.is_delivered, self.delivery_date, now)
    }
}

// ---------------------------------------------------------------------------
// Journal entry
// ---------------------------------------------------------------------------

/// A journal entry, stored at `journalEntries/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub user_id: UserId,
    pub content: String,
    /// Optional small mood rating.
    #[serde(default)]
    pub mood: Option<u8>,
    pub visibility: Visibility,
    #[serde(with = "crate::timestamps")]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Social graph records
// ---------------------------------------------------------------------------

/// Presence-only half of a connection mirror pair, stored at
/// `users/{uid}/connections/{otherUid}`. Existence is the signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    #[serde(with = "crate::timestamps")]
    pub connected_at: DateTime<Utc>,
}

/// Presence-only half of a friend request mirror pair, stored under
/// `incomingFriendRequests` / `outgoingFriendRequests`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestRecord {
    #[serde(with = "crate::timestamps")]
    pub created_at: DateTime<Utc>,
}
