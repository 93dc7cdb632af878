//! Identity provider seam and session establishment.
//!
//! Credential verification lives with an external provider; this layer only
//! consumes the opaque uid it hands back and turns it into a [`Session`].

use async_trait::async_trait;

use keepsake_shared::{AppError, Result, Session, UserId};

use crate::profiles::ProfileDirectory;

/// What the identity provider tells us about a verified account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: String,
}

/// External identity provider: stable opaque uid plus email/password
/// credential verification. Consumed, never reimplemented here.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser>;
    async fn sign_out(&self) -> Result<()>;
}

/// Create an account, seed its profile document, and open a session.
pub async fn sign_up(
    auth: &dyn AuthProvider,
    directory: &ProfileDirectory,
    email: &str,
    password: &str,
    display_name: &str,
) -> Result<Session> {
    if !email.contains('@') {
        return Err(AppError::validation("email", "not an email address"));
    }
    if display_name.trim().is_empty() {
        return Err(AppError::validation("displayName", "must not be empty"));
    }

    let user = auth.sign_up(email, password).await?;
    directory
        .create_profile(&user.user_id, &user.email, display_name)
        .await?;

    tracing::info!(user = %user.user_id, "account created");
    Ok(Session::new(user.user_id, user.email))
}

/// Verify credentials and open a session.
pub async fn sign_in(auth: &dyn AuthProvider, email: &str, password: &str) -> Result<Session> {
    let user = auth.sign_in(email, password).await?;
    tracing::info!(user = %user.user_id, "signed in");
    Ok(Session::new(user.user_id, user.email))
}
