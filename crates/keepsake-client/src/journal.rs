//! Journal entry write path: author-only create, edit, delete.

use std::sync::Arc;

use serde_json::json;

use keepsake_shared::{AppError, Clock, EntryId, JournalEntry, Result, Session, Visibility};
use keepsake_store::DocumentStore;

use crate::paths;

/// Fields the author may change after creation. Visibility is mutable
/// post-creation by design.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub content: Option<String>,
    pub mood: Option<u8>,
    pub visibility: Option<Visibility>,
}

/// An entry as it appears in listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub id: EntryId,
    pub entry: JournalEntry,
}

#[derive(Clone)]
pub struct JournalEntries {
    store: DocumentStore,
    session: Arc<Session>,
    clock: Arc<dyn Clock>,
}

impl JournalEntries {
    pub fn new(store: DocumentStore, session: Arc<Session>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            session,
            clock,
        }
    }

    pub async fn create(
        &self,
        content: &str,
        mood: Option<u8>,
        visibility: Visibility,
    ) -> Result<EntryId> {
        if content.trim().is_empty() {
            return Err(AppError::validation("content", "must not be empty"));
        }

        let id = EntryId::new();
        let entry = JournalEntry {
            user_id: self.session.user_id().clone(),
            content: content.to_string(),
            mood,
            visibility,
            created_at: self.clock.now(), // overwritten by the store
        };
        self.store.create(paths::entry(&id)?, &entry).await?;

        tracing::debug!(entry = %id, visibility = visibility.as_str(), "entry created");
        Ok(id)
    }

    pub async fn update(&self, id: &EntryId, patch: EntryPatch) -> Result<()> {
        let path = paths::entry(id)?;
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("entry {id}")))?;
        let entry: JournalEntry = doc.decode()?;

        if &entry.user_id != self.session.user_id() {
            return Err(AppError::permission("only the author may edit an entry"));
        }

        let mut fields = serde_json::Map::new();
        if let Some(content) = &patch.content {
            if content.trim().is_empty() {
                return Err(AppError::validation("content", "must not be empty"));
            }
            fields.insert("content".into(), json!(content));
        }
        if let Some(mood) = patch.mood {
            fields.insert("mood".into(), json!(mood));
        }
        if let Some(visibility) = patch.visibility {
            fields.insert("visibility".into(), json!(visibility));
        }
        if fields.is_empty() {
            return Ok(());
        }

        self.store.update(path, fields).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &EntryId) -> Result<()> {
        let path = paths::entry(id)?;
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("entry {id}")))?;
        let entry: JournalEntry = doc.decode()?;

        if &entry.user_id != self.session.user_id() {
            return Err(AppError::permission("only the author may delete an entry"));
        }

        self.store.delete(path, false).await?;
        Ok(())
    }
}
