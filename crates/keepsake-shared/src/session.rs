//! Explicit session context.
//!
//! Created once on sign-in and handed to every component that needs the
//! current actor's id; torn down (dropped) on sign-out. Never a global.

use crate::types::UserId;

/// The signed-in actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: UserId,
    email: String,
}

impl Session {
    pub fn new(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}
