//! Capsule lifecycle: creation, time-gated viewing, the exactly-once open
//! transition, and the sender's edit/delete rights.
//!
//! The stored record never says "scheduled" or "deliverable"; that state is
//! derived from the delivery instant and the injected clock at read time,
//! so a capsule can never be un-delivered by a stale flag.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use keepsake_shared::{
    timestamps, AppError, Capsule, CapsuleId, CapsuleStatus, Clock, Result, Session, UserId,
};
use keepsake_store::{DocumentStore, Filter, OrderBy, Query, StoreError, WriteOp};

use crate::live::{spawn_feed, Feed};
use crate::paths;

/// Fields a sender may change while a capsule is still unopened.
#[derive(Debug, Clone, Default)]
pub struct CapsulePatch {
    pub title: Option<String>,
    pub recipient_id: Option<UserId>,
    pub message: Option<String>,
    pub delivery_date: Option<DateTime<Utc>>,
}

impl CapsulePatch {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.recipient_id.is_none()
            && self.message.is_none()
            && self.delivery_date.is_none()
    }
}

/// What a permitted viewer sees. `message` is `None` while the capsule is
/// still scheduled, for every viewer including the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleView {
    pub id: CapsuleId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub title: Option<String>,
    pub message: Option<String>,
    pub delivery_date: DateTime<Utc>,
    pub status: CapsuleStatus,
    pub created_at: DateTime<Utc>,
}

/// A capsule as it appears in listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleRecord {
    pub id: CapsuleId,
    pub capsule: Capsule,
}

#[derive(Clone)]
pub struct CapsuleLifecycle {
    store: DocumentStore,
    session: Arc<Session>,
    clock: Arc<dyn Clock>,
}

impl CapsuleLifecycle {
    pub fn new(store: DocumentStore, session: Arc<Session>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            session,
            clock,
        }
    }

    /// Schedule a new capsule from the current user to `recipient_id`.
    pub async fn create(
        &self,
        recipient_id: &UserId,
        message: &str,
        delivery_date: DateTime<Utc>,
        title: Option<String>,
    ) -> Result<CapsuleId> {
        if message.trim().is_empty() {
            return Err(AppError::validation("message", "must not be empty"));
        }
        let now = self.clock.now();
        if delivery_date <= now {
            return Err(AppError::validation(
                "deliveryDate",
                "must be strictly in the future",
            ));
        }

        let id = CapsuleId::new();
        let capsule = Capsule {
            user_id: self.session.user_id().clone(),
            recipient_id: recipient_id.clone(),
            title,
            message: message.to_string(),
            delivery_date,
            is_delivered: false,
            created_at: now, // overwritten by the store
        };

        self.store.create(paths::capsule(&id)?, &capsule).await?;

        tracing::debug!(capsule = %id, recipient = %recipient_id, "capsule scheduled");
        Ok(id)
    }

    /// Edit an unopened capsule. Only the sender may edit, and never after
    /// the recipient has opened it.
    pub async fn update(&self, id: &CapsuleId, patch: CapsulePatch) -> Result<()> {
        let path = paths::capsule(id)?;
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("capsule {id}")))?;
        let capsule: Capsule = doc.decode()?;

        if &capsule.user_id != self.session.user_id() {
            return Err(AppError::permission("only the sender may edit a capsule"));
        }
        if capsule.is_delivered {
            return Err(AppError::state("capsule has already been opened"));
        }
        if patch.is_empty() {
            return Ok(());
        }

        let mut fields = serde_json::Map::new();
        if let Some(title) = &patch.title {
            fields.insert("title".into(), json!(title));
        }
        if let Some(recipient_id) = &patch.recipient_id {
            fields.insert("recipientId".into(), json!(recipient_id));
        }
        if let Some(message) = &patch.message {
            if message.trim().is_empty() {
                return Err(AppError::validation("message", "must not be empty"));
            }
            fields.insert("message".into(), json!(message));
        }
        if let Some(delivery_date) = &patch.delivery_date {
            if *delivery_date <= self.clock.now() {
                return Err(AppError::validation(
                    "deliveryDate",
                    "must be strictly in the future",
                ));
            }
            fields.insert("deliveryDate".into(), json!(timestamps::canonical(delivery_date)));
        }

        // The no-op transition asserts `isDelivered` is still false inside
        // the same batch, so an open racing this edit aborts it.
        let guard = WriteOp::FieldTransition {
            path: path.clone(),
            field: "isDelivered".into(),
            from: json!(false),
            to: json!(false),
        };
        let result = self
            .store
            .apply(vec![guard, WriteOp::Update { path, fields }])
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(_)) => {
                Err(AppError::state("capsule has already been opened"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Full record for either participant; everyone else is refused.
    /// The message is redacted while the capsule is still scheduled.
    pub async fn view(&self, id: &CapsuleId) -> Result<CapsuleView> {
        let doc = self
            .store
            .get(&paths::capsule(id)?)
            .await?
            .ok_or_else(|| AppError::not_found(format!("capsule {id}")))?;
        let capsule: Capsule = doc.decode()?;

        let viewer = self.session.user_id();
        if viewer != &capsule.user_id && viewer != &capsule.recipient_id {
            return Err(AppError::permission(
                "capsules are visible to sender and recipient only",
            ));
        }

        let status = capsule.status(self.clock.now());
        let message = match status {
            CapsuleStatus::Scheduled => None,
            CapsuleStatus::Deliverable | CapsuleStatus::Opened => Some(capsule.message),
        };

        Ok(CapsuleView {
            id: id.clone(),
            sender_id: capsule.user_id,
            recipient_id: capsule.recipient_id,
            title: capsule.title,
            message,
            delivery_date: capsule.delivery_date,
            status,
            created_at: capsule.created_at,
        })
    }

    /// Record that the recipient opened the capsule. Idempotent: repeated
    /// and concurrent calls succeed with exactly one underlying write.
    pub async fn mark_opened(&self, id: &CapsuleId) -> Result<()> {
        let path = paths::capsule(id)?;
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("capsule {id}")))?;
        let capsule: Capsule = doc.decode()?;

        if self.session.user_id() != &capsule.recipient_id {
            return Err(AppError::permission(
                "only the recipient may open a capsule",
            ));
        }
        if capsule.is_delivered {
            return Ok(());
        }
        if self.clock.now() < capsule.delivery_date {
            return Err(AppError::state("capsule is not deliverable yet"));
        }

        self.store
            .apply(vec![WriteOp::FieldTransition {
                path,
                field: "isDelivered".into(),
                from: json!(false),
                to: json!(true),
            }])
            .await?;

        tracing::debug!(capsule = %id, "capsule opened");
        Ok(())
    }

    /// Remove a capsule. Sender only; no retention.
    pub async fn delete(&self, id: &CapsuleId) -> Result<()> {
        let path = paths::capsule(id)?;
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("capsule {id}")))?;
        let capsule: Capsule = doc.decode()?;

        if &capsule.user_id != self.session.user_id() {
            return Err(AppError::permission("only the sender may delete a capsule"));
        }

        self.store.delete(path, false).await?;
        Ok(())
    }

    /// Live listing of everything the current user has sent, newest first.
    pub async fn list_sent(&self) -> Result<Feed<CapsuleRecord>> {
        let query = Query::collection(paths::CAPSULES)
            .filter(Filter::Eq("userId".into(), json!(self.session.user_id())))
            .order(OrderBy::CreatedAtDesc);
        let sub = self.store.subscribe(query).await?;
        Ok(spawn_feed(sub, |docs| {
            futures::future::ready(decode_capsules(docs))
        }))
    }

    /// Live listing of capsules addressed to the current user whose
    /// delivery instant has passed. The cutoff is part of the store query,
    /// so undelivered message bodies never leave the store; it is evaluated
    /// when the listing is (re)started.
    pub async fn list_received_deliverable(&self) -> Result<Feed<CapsuleRecord>> {
        let cutoff = json!(timestamps::canonical(&self.clock.now()));
        let query = Query::collection(paths::CAPSULES)
            .filter(Filter::Eq(
                "recipientId".into(),
                json!(self.session.user_id()),
            ))
            .filter(Filter::Le("deliveryDate".into(), cutoff))
            .order(OrderBy::FieldDesc("deliveryDate".into()));
        let sub = self.store.subscribe(query).await?;
        Ok(spawn_feed(sub, |docs| {
            futures::future::ready(decode_capsules(docs))
        }))
    }
}

fn decode_capsules(docs: Vec<keepsake_store::Document>) -> Vec<CapsuleRecord> {
    docs.into_iter()
        .filter_map(|doc| {
            let id = match CapsuleId::parse(doc.id()) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(path = %doc.path, error = %e, "bad capsule id");
                    return None;
                }
            };
            match doc.decode::<Capsule>() {
                Ok(capsule) => Some(CapsuleRecord { id, capsule }),
                Err(e) => {
                    tracing::warn!(path = %doc.path, error = %e, "undecodable capsule");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keepsake_shared::ManualClock;
    use keepsake_store::Database;

    struct Fixture {
        store: DocumentStore,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let store =
                DocumentStore::spawn(Database::in_memory().unwrap(), clock.clone());
            Self { store, clock }
        }

        fn lifecycle_as(&self, uid: &str) -> CapsuleLifecycle {
            let session = Arc::new(Session::new(
                UserId::new(uid),
                format!("{uid}@example.com"),
            ));
            CapsuleLifecycle::new(self.store.clone(), session, self.clock.clone())
        }
    }

    #[tokio::test]
    async fn create_rejects_empty_message_and_past_delivery() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = UserId::new("bob");

        let err = alice
            .create(&bob, "  ", fx.clock.now() + Duration::days(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { field: "message", .. }));

        let err = alice
            .create(&bob, "hello", fx.clock.now() - Duration::seconds(1), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation {
                field: "deliveryDate",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn message_is_redacted_until_delivery_for_everyone() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let id = alice
            .create(
                &UserId::new("bob"),
                "open me later",
                fx.clock.now() + Duration::days(1),
                Some("birthday".into()),
            )
            .await
            .unwrap();

        // Scheduled: redacted for recipient and sender alike.
        let view = bob.view(&id).await.unwrap();
        assert_eq!(view.status, CapsuleStatus::Scheduled);
        assert_eq!(view.message, None);
        assert_eq!(view.title.as_deref(), Some("birthday"));

        let view = alice.view(&id).await.unwrap();
        assert_eq!(view.message, None);

        // After the delivery instant the exact content round-trips.
        fx.clock.advance(Duration::days(2));
        let view = bob.view(&id).await.unwrap();
        assert_eq!(view.status, CapsuleStatus::Deliverable);
        assert_eq!(view.message.as_deref(), Some("open me later"));

        // Third parties are refused regardless of state.
        let eve = fx.lifecycle_as("eve");
        let err = eve.view(&id).await.unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
    }

    #[tokio::test]
    async fn mark_opened_enforces_recipient_and_delivery_time() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let id = alice
            .create(
                &UserId::new("bob"),
                "patience",
                fx.clock.now() + Duration::hours(1),
                None,
            )
            .await
            .unwrap();

        // Wrong actor fails regardless of delivery state.
        let err = alice.mark_opened(&id).await.unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));

        // Right actor, too early.
        let err = bob.mark_opened(&id).await.unwrap_err();
        assert!(matches!(err, AppError::State(_)));

        fx.clock.advance(Duration::hours(2));
        bob.mark_opened(&id).await.unwrap();

        let view = bob.view(&id).await.unwrap();
        assert_eq!(view.status, CapsuleStatus::Opened);

        // Wrong actor still fails after opening.
        let err = alice.mark_opened(&id).await.unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
    }

    #[tokio::test]
    async fn mark_opened_is_idempotent_under_concurrency() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let id = alice
            .create(
                &UserId::new("bob"),
                "only once",
                fx.clock.now() + Duration::seconds(1),
                None,
            )
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(1));

        // Watch the collection to count actual writes.
        let mut sub = fx
            .store
            .subscribe(Query::collection(paths::CAPSULES))
            .await
            .unwrap();
        sub.recv().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let bob = bob.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { bob.mark_opened(&id).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Exactly one transition was committed: the next snapshot shows the
        // opened capsule, and the one after that is our marker write.
        let snapshot = sub.recv().await.unwrap();
        assert_eq!(snapshot[0].data["isDelivered"], json!(true));

        alice
            .create(
                &UserId::new("bob"),
                "marker",
                fx.clock.now() + Duration::days(1),
                None,
            )
            .await
            .unwrap();
        let snapshot = sub.recv().await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn update_is_sender_only_and_blocked_after_open() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let id = alice
            .create(
                &UserId::new("bob"),
                "original",
                fx.clock.now() + Duration::hours(1),
                None,
            )
            .await
            .unwrap();

        let err = bob
            .update(
                &id,
                CapsulePatch {
                    message: Some("hijacked".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));

        alice
            .update(
                &id,
                CapsulePatch {
                    title: Some("revised".into()),
                    message: Some("edited".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.clock.advance(Duration::hours(2));
        bob.mark_opened(&id).await.unwrap();

        let err = alice
            .update(
                &id,
                CapsulePatch {
                    message: Some("too late".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::State(_)));

        // The stored message is unchanged after the failed attempt.
        let view = bob.view(&id).await.unwrap();
        assert_eq!(view.message.as_deref(), Some("edited"));
        assert_eq!(view.title.as_deref(), Some("revised"));
    }

    #[tokio::test]
    async fn delete_is_sender_only() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let id = alice
            .create(
                &UserId::new("bob"),
                "ephemeral",
                fx.clock.now() + Duration::hours(1),
                None,
            )
            .await
            .unwrap();

        let err = bob.delete(&id).await.unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));

        alice.delete(&id).await.unwrap();
        let err = bob.view(&id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn received_listing_only_surfaces_deliverable_capsules() {
        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let _early = alice
            .create(
                &UserId::new("bob"),
                "already due",
                fx.clock.now() + Duration::minutes(1),
                None,
            )
            .await
            .unwrap();
        let _late = alice
            .create(
                &UserId::new("bob"),
                "far future",
                fx.clock.now() + Duration::days(30),
                None,
            )
            .await
            .unwrap();

        fx.clock.advance(Duration::hours(1));

        let mut received = bob.list_received_deliverable().await.unwrap();
        let snapshot = received.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].capsule.message, "already due");
        received.dispose();

        let mut sent = alice.list_sent().await.unwrap();
        let snapshot = sent.next().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        sent.dispose();
        assert!(sent.next().await.is_none());
    }

    #[tokio::test]
    async fn whole_second_delivery_is_listed_at_a_fractional_instant() {
        use chrono::TimeZone;

        let fx = Fixture::new();
        let alice = fx.lifecycle_as("alice");
        let bob = fx.lifecycle_as("bob");

        let on_the_hour = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
        fx.clock.set(on_the_hour - Duration::hours(1));
        let id = alice
            .create(&UserId::new("bob"), "on the hour", on_the_hour, None)
            .await
            .unwrap();

        // A quarter second into the delivery second the capsule is due;
        // the zero-fraction deadline must not sort after the cutoff.
        fx.clock.set(on_the_hour + Duration::milliseconds(250));
        let mut received = bob.list_received_deliverable().await.unwrap();
        let snapshot = received.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        received.dispose();
    }
}
