//! Binary object store seam, used only for profile photos.

use async_trait::async_trait;

use keepsake_shared::{Result, UserId};

/// External blob store: accepts an upload and returns a publicly
/// resolvable URL.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn upload(&self, user_id: &UserId, bytes: &[u8]) -> Result<String>;
}
