//! Profile directory: read-mostly resolution of uids to display profiles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use keepsake_shared::{AppError, Result, ResolvedProfile, Session, UserId, UserProfile};
use keepsake_store::{DocumentStore, Filter, OrderBy, Query};

use crate::paths;
use crate::photos::PhotoStore;

/// Cached point lookups over `users/{uid}`.
///
/// Transient absence of a profile is expected during account creation, so
/// [`ProfileDirectory::get`] reports it as `Ok(None)` rather than an error.
#[derive(Clone)]
pub struct ProfileDirectory {
    store: DocumentStore,
    cache: Arc<Mutex<HashMap<UserId, UserProfile>>>,
}

impl ProfileDirectory {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cached point lookup. `Ok(None)` means "not yet available".
    pub async fn get(&self, user_id: &UserId) -> Result<Option<UserProfile>> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(profile) = cache.get(user_id) {
                return Ok(Some(profile.clone()));
            }
        }

        let Some(doc) = self.store.get(&paths::profile(user_id)?).await? else {
            return Ok(None);
        };
        let profile: UserProfile = doc.decode()?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(user_id.clone(), profile.clone());
        }
        Ok(Some(profile))
    }

    /// Resolve a batch of uids, silently skipping ones without a profile
    /// yet.
    pub async fn resolve_many(&self, user_ids: &[UserId]) -> Result<Vec<ResolvedProfile>> {
        let mut resolved = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            if let Some(profile) = self.get(user_id).await? {
                resolved.push(ResolvedProfile {
                    user_id: user_id.clone(),
                    profile,
                });
            }
        }
        Ok(resolved)
    }

    /// Exact-match email lookup, excluding the caller from their own
    /// results.
    pub async fn search_by_email(
        &self,
        email: &str,
        excluding: &UserId,
    ) -> Result<Vec<ResolvedProfile>> {
        let docs = self
            .store
            .query(
                Query::collection(paths::USERS)
                    .filter(Filter::Eq("email".into(), json!(email))),
            )
            .await?;

        let mut results = Vec::new();
        for doc in docs {
            let user_id = UserId::new(doc.id());
            if &user_id == excluding {
                continue;
            }
            match doc.decode::<UserProfile>() {
                Ok(profile) => results.push(ResolvedProfile { user_id, profile }),
                Err(e) => tracing::warn!(uid = doc.id(), error = %e, "undecodable profile"),
            }
        }
        Ok(results)
    }

    /// Most recently created profiles, for cold-start discovery.
    pub async fn suggestions(&self, count: u32) -> Result<Vec<ResolvedProfile>> {
        let docs = self
            .store
            .query(
                Query::collection(paths::USERS)
                    .order(OrderBy::CreatedAtDesc)
                    .limit(count),
            )
            .await?;

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.decode::<UserProfile>() {
                Ok(profile) => results.push(ResolvedProfile {
                    user_id: UserId::new(doc.id()),
                    profile,
                }),
                Err(e) => tracing::warn!(uid = doc.id(), error = %e, "undecodable profile"),
            }
        }
        Ok(results)
    }

    /// Seed the profile document at sign-up. The store assigns `createdAt`.
    pub async fn create_profile(
        &self,
        user_id: &UserId,
        email: &str,
        display_name: &str,
    ) -> Result<()> {
        let profile = UserProfile {
            email: email.to_string(),
            display_name: display_name.to_string(),
            photo_url: None,
            created_at: chrono::Utc::now(), // overwritten by the store
        };
        self.store
            .create(paths::profile(user_id)?, &profile)
            .await?;
        Ok(())
    }

    pub async fn set_display_name(&self, session: &Session, display_name: &str) -> Result<()> {
        if display_name.trim().is_empty() {
            return Err(AppError::validation("displayName", "must not be empty"));
        }

        let mut fields = serde_json::Map::new();
        fields.insert("displayName".into(), json!(display_name));
        self.store
            .update(paths::profile(session.user_id())?, fields)
            .await?;

        self.invalidate(session.user_id());
        Ok(())
    }

    /// Upload a profile photo through the blob store collaborator and
    /// record the returned URL.
    pub async fn set_photo(
        &self,
        session: &Session,
        photos: &dyn PhotoStore,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.is_empty() {
            return Err(AppError::validation("photo", "empty upload"));
        }

        let url = photos.upload(session.user_id(), bytes).await?;

        let mut fields = serde_json::Map::new();
        fields.insert("photoURL".into(), json!(url));
        self.store
            .update(paths::profile(session.user_id())?, fields)
            .await?;

        self.invalidate(session.user_id());
        Ok(())
    }

    fn invalidate(&self, user_id: &UserId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keepsake_shared::SystemClock;
    use keepsake_store::Database;

    fn directory() -> ProfileDirectory {
        let store =
            DocumentStore::spawn(Database::in_memory().unwrap(), Arc::new(SystemClock));
        ProfileDirectory::new(store)
    }

    #[tokio::test]
    async fn absent_profile_is_none_not_an_error() {
        let dir = directory();
        let got = dir.get(&UserId::new("ghost")).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn create_then_get_uses_cache() {
        let dir = directory();
        let uid = UserId::new("alice");
        dir.create_profile(&uid, "alice@example.com", "Alice")
            .await
            .unwrap();

        let profile = dir.get(&uid).await.unwrap().unwrap();
        assert_eq!(profile.display_name, "Alice");

        // Second lookup is served from cache.
        assert!(dir.cache.lock().unwrap().contains_key(&uid));
        let again = dir.get(&uid).await.unwrap().unwrap();
        assert_eq!(again, profile);
    }

    #[tokio::test]
    async fn duplicate_profile_conflicts() {
        let dir = directory();
        let uid = UserId::new("alice");
        dir.create_profile(&uid, "a@x.com", "Alice").await.unwrap();
        let err = dir.create_profile(&uid, "a@x.com", "Alice").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn email_search_excludes_caller() {
        let dir = directory();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        dir.create_profile(&alice, "same@example.com", "Alice")
            .await
            .unwrap();
        dir.create_profile(&bob, "same@example.com", "Bob")
            .await
            .unwrap();

        let results = dir.search_by_email("same@example.com", &alice).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, bob);

        let none = dir.search_by_email("other@example.com", &alice).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn suggestions_are_newest_first_and_bounded() {
        let clock = Arc::new(keepsake_shared::ManualClock::new(chrono::Utc::now()));
        let store = DocumentStore::spawn(Database::in_memory().unwrap(), clock.clone());
        let dir = ProfileDirectory::new(store);

        for name in ["a", "b", "c"] {
            clock.advance(chrono::Duration::seconds(1));
            dir.create_profile(&UserId::new(name), &format!("{name}@x.com"), name)
                .await
                .unwrap();
        }

        let got = dir.suggestions(2).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].user_id, UserId::new("c"));
        assert_eq!(got[1].user_id, UserId::new("b"));
    }

    #[tokio::test]
    async fn set_photo_records_uploaded_url() {
        struct FakePhotos;

        #[async_trait]
        impl PhotoStore for FakePhotos {
            async fn upload(&self, user_id: &UserId, _bytes: &[u8]) -> Result<String> {
                Ok(format!("https://cdn.example.com/{user_id}.jpg"))
            }
        }

        let dir = directory();
        let uid = UserId::new("alice");
        dir.create_profile(&uid, "a@x.com", "Alice").await.unwrap();

        let session = Session::new(uid.clone(), "a@x.com");
        dir.set_photo(&session, &FakePhotos, b"jpeg-bytes")
            .await
            .unwrap();

        let profile = dir.get(&uid).await.unwrap().unwrap();
        assert_eq!(
            profile.photo_url.as_deref(),
            Some("https://cdn.example.com/alice.jpg")
        );

        let err = dir.set_photo(&session, &FakePhotos, b"").await.unwrap_err();
        assert!(matches!(err, AppError::Validation { field: "photo", .. }));
    }
}
