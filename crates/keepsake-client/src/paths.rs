//! Document path layout (the persisted-state contract).

use keepsake_shared::types::{CapsuleId, EntryId, UserId};
use keepsake_store::{DocPath, Result};

pub(crate) const USERS: &str = "users";
pub(crate) const CAPSULES: &str = "timeCapsules";
pub(crate) const ENTRIES: &str = "journalEntries";

pub(crate) fn profile(user_id: &UserId) -> Result<DocPath> {
    DocPath::doc(USERS, user_id.as_str())
}

pub(crate) fn capsule(id: &CapsuleId) -> Result<DocPath> {
    DocPath::doc(CAPSULES, &id.to_string())
}

pub(crate) fn entry(id: &EntryId) -> Result<DocPath> {
    DocPath::doc(ENTRIES, &id.to_string())
}

pub(crate) fn connections_of(user_id: &UserId) -> String {
    format!("{USERS}/{}/connections", user_id.as_str())
}

pub(crate) fn incoming_requests_of(user_id: &UserId) -> String {
    format!("{USERS}/{}/incomingFriendRequests", user_id.as_str())
}

pub(crate) fn outgoing_requests_of(user_id: &UserId) -> String {
    format!("{USERS}/{}/outgoingFriendRequests", user_id.as_str())
}

pub(crate) fn connection(owner: &UserId, other: &UserId) -> Result<DocPath> {
    DocPath::doc(&connections_of(owner), other.as_str())
}

pub(crate) fn incoming_request(owner: &UserId, sender: &UserId) -> Result<DocPath> {
    DocPath::doc(&incoming_requests_of(owner), sender.as_str())
}

pub(crate) fn outgoing_request(owner: &UserId, recipient: &UserId) -> Result<DocPath> {
    DocPath::doc(&outgoing_requests_of(owner), recipient.as_str())
}
