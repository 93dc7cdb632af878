//! Friend-request protocol and the symmetric connection relation.
//!
//! Both relations live as mirrored per-user records, one half under each
//! participant, because store queries are scoped to a single user's
//! sub-collection. Every mutation here is a single atomic batch, so a
//! reader can never observe a half-written pair.

use std::sync::Arc;

use keepsake_shared::{
    AppError, Clock, ConnectionRecord, FriendRequestRecord, ResolvedProfile, Result, Session,
    UserId,
};
use keepsake_store::{DocumentStore, OrderBy, Query, WriteOp};

use crate::live::{spawn_feed, Feed};
use crate::paths;
use crate::profiles::ProfileDirectory;

#[derive(Clone)]
pub struct ConnectionGraph {
    store: DocumentStore,
    session: Arc<Session>,
    profiles: ProfileDirectory,
    clock: Arc<dyn Clock>,
}

impl ConnectionGraph {
    pub fn new(
        store: DocumentStore,
        session: Arc<Session>,
        profiles: ProfileDirectory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            session,
            profiles,
            clock,
        }
    }

    fn me(&self) -> &UserId {
        self.session.user_id()
    }

    /// Offer a connection. At most one outstanding request per direction;
    /// an existing connection or outgoing request is a conflict.
    pub async fn send_request(&self, recipient_id: &UserId) -> Result<()> {
        let me = self.me();
        if recipient_id == me {
            return Err(AppError::validation(
                "recipientId",
                "cannot send a friend request to yourself",
            ));
        }

        if self
            .store
            .get(&paths::connection(me, recipient_id)?)
            .await?
            .is_some()
        {
            return Err(AppError::conflict("already connected"));
        }
        if self
            .store
            .get(&paths::outgoing_request(me, recipient_id)?)
            .await?
            .is_some()
        {
            return Err(AppError::conflict("request already sent"));
        }

        let record = FriendRequestRecord {
            created_at: self.clock.now(), // overwritten by the store
        };
        let data = serde_json::to_value(&record).map_err(store_json_err)?;

        // Mirror pair in one batch; the Create preconditions also close the
        // race between the reads above and this write.
        self.store
            .apply(vec![
                WriteOp::Create {
                    path: paths::outgoing_request(me, recipient_id)?,
                    data: data.clone(),
                },
                WriteOp::Create {
                    path: paths::incoming_request(recipient_id, me)?,
                    data,
                },
            ])
            .await?;

        tracing::debug!(from = %me, to = %recipient_id, "friend request sent");
        Ok(())
    }

    /// Accept a pending request from `sender_id`: both connection halves
    /// appear and both request halves disappear in one atomic batch.
    pub async fn accept(&self, sender_id: &UserId) -> Result<()> {
        let me = self.me();
        let record = ConnectionRecord {
            connected_at: self.clock.now(),
        };
        let data = serde_json::to_value(&record).map_err(store_json_err)?;

        let result = self
            .store
            .apply(vec![
                // The must-exist delete comes first so a missing request
                // surfaces as NotFound rather than a connection conflict.
                WriteOp::Delete {
                    path: paths::incoming_request(me, sender_id)?,
                    must_exist: true,
                },
                WriteOp::Delete {
                    path: paths::outgoing_request(sender_id, me)?,
                    must_exist: false,
                },
                WriteOp::Create {
                    path: paths::connection(me, sender_id)?,
                    data: data.clone(),
                },
                WriteOp::Create {
                    path: paths::connection(sender_id, me)?,
                    data,
                },
            ])
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(user = %me, friend = %sender_id, "request accepted");
                Ok(())
            }
            Err(keepsake_store::StoreError::NotFound(_)) => Err(AppError::not_found(format!(
                "no pending friend request from {sender_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop whatever request records exist between the two users, in either
    /// direction. Covers both rejecting an incoming request and cancelling
    /// one's own outgoing request. No-op when nothing is pending.
    pub async fn reject(&self, other_id: &UserId) -> Result<()> {
        let me = self.me();
        let delete = |path| WriteOp::Delete {
            path,
            must_exist: false,
        };

        self.store
            .apply(vec![
                delete(paths::incoming_request(me, other_id)?),
                delete(paths::outgoing_request(other_id, me)?),
                delete(paths::outgoing_request(me, other_id)?),
                delete(paths::incoming_request(other_id, me)?),
            ])
            .await?;
        Ok(())
    }

    /// Remove a mutual connection. No-op success when not connected.
    pub async fn remove(&self, friend_id: &UserId) -> Result<()> {
        let me = self.me();
        self.store
            .apply(vec![
                WriteOp::Delete {
                    path: paths::connection(me, friend_id)?,
                    must_exist: false,
                },
                WriteOp::Delete {
                    path: paths::connection(friend_id, me)?,
                    must_exist: false,
                },
            ])
            .await?;

        tracing::debug!(user = %me, friend = %friend_id, "connection removed");
        Ok(())
    }

    /// Live listing of the current user's connections as resolved profiles.
    pub async fn list_connections(&self) -> Result<Feed<ResolvedProfile>> {
        self.profile_feed(paths::connections_of(self.me())).await
    }

    /// Live listing of users who have sent the current user a request.
    pub async fn list_incoming_requests(&self) -> Result<Feed<ResolvedProfile>> {
        self.profile_feed(paths::incoming_requests_of(self.me()))
            .await
    }

    /// Live listing of users the current user has sent a request to.
    pub async fn list_outgoing_requests(&self) -> Result<Feed<ResolvedProfile>> {
        self.profile_feed(paths::outgoing_requests_of(self.me()))
            .await
    }

    async fn profile_feed(&self, collection: String) -> Result<Feed<ResolvedProfile>> {
        let query = Query::collection(collection).order(OrderBy::CreatedAtDesc);
        let sub = self.store.subscribe(query).await?;
        let profiles = self.profiles.clone();

        Ok(spawn_feed(sub, move |docs| {
            let profiles = profiles.clone();
            async move {
                let ids: Vec<UserId> = docs.iter().map(|d| UserId::new(d.id())).collect();
                match profiles.resolve_many(&ids).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        tracing::warn!(error = %e, "profile resolution failed");
                        Vec::new()
                    }
                }
            }
        }))
    }
}

fn store_json_err(e: serde_json::Error) -> AppError {
    AppError::transient(e.to_string())
}
