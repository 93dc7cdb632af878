//! Audience-scoped journal feeds.
//!
//! Three live views over one entry collection. The friends feed is the
//! interesting one: membership queries are bounded to [`MAX_IN_ARITY`] ids,
//! so the connection set is sharded into batches, one live query per batch,
//! and the batches are merge-sorted newest-first on every emission. The
//! connection channel and the batch channels are independent; the view is
//! recomputed whenever any one of them fires, tolerating transient
//! inconsistency between them.

use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use keepsake_shared::{EntryId, JournalEntry, UserId, Visibility};
use keepsake_store::{
    Document, DocumentStore, Filter, OrderBy, Query, SubscriptionHandle, MAX_IN_ARITY,
};

use crate::journal::EntryRecord;
use crate::live::{spawn_feed, Disposer, Feed};
use crate::paths;

/// Upper bound on the public feed; cost control, not correctness. Callers
/// needing more must paginate explicitly.
pub const PUBLIC_FEED_PAGE_SIZE: u32 = 50;

#[derive(Clone)]
pub struct VisibilityFeed {
    store: DocumentStore,
}

impl VisibilityFeed {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    /// Everything `user_id` wrote, any visibility, newest first.
    pub async fn my_entries(&self, user_id: &UserId) -> keepsake_shared::Result<Feed<EntryRecord>> {
        let query = Query::collection(paths::ENTRIES)
            .filter(Filter::Eq("userId".into(), json!(user_id)))
            .order(OrderBy::CreatedAtDesc);
        let sub = self.store.subscribe(query).await?;
        Ok(spawn_feed(sub, |docs| {
            futures::future::ready(decode_entries(docs))
        }))
    }

    /// Public entries, newest first, bounded to one page.
    pub async fn public_feed(&self) -> keepsake_shared::Result<Feed<EntryRecord>> {
        let query = Query::collection(paths::ENTRIES)
            .filter(Filter::Eq(
                "visibility".into(),
                json!(Visibility::Public),
            ))
            .order(OrderBy::CreatedAtDesc)
            .limit(PUBLIC_FEED_PAGE_SIZE);
        let sub = self.store.subscribe(query).await?;
        Ok(spawn_feed(sub, |docs| {
            futures::future::ready(decode_entries(docs))
        }))
    }

    /// Friends-visibility entries authored by any of `user_id`'s current
    /// connections, newest first, live across both connection changes and
    /// entry changes.
    pub async fn friends_feed(&self, user_id: &UserId) -> keepsake_shared::Result<Feed<EntryRecord>> {
        let connections_query =
            Query::collection(paths::connections_of(user_id)).order(OrderBy::CreatedAtDesc);
        let mut connection_sub = self.store.subscribe(connections_query).await?;

        let store = self.store.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let disposer = Disposer::new();
        let waiter = disposer.clone();

        tokio::spawn(async move {
            let mut batch_handles: Vec<SubscriptionHandle> = Vec::new();
            let mut batch_streams: SelectAll<BoxStream<'static, (usize, Vec<Document>)>> =
                SelectAll::new();
            let mut latest: Vec<Option<Vec<EntryRecord>>> = Vec::new();

            loop {
                tokio::select! {
                    _ = waiter.wait() => break,

                    maybe = connection_sub.recv() => {
                        let Some(docs) = maybe else { break };

                        // Connection set changed: tear down the old batch
                        // queries and start a fresh shard per <= N friends.
                        for handle in batch_handles.drain(..) {
                            handle.dispose();
                        }
                        batch_streams = SelectAll::new();
                        latest.clear();

                        let friend_ids: Vec<String> =
                            docs.iter().map(|d| d.id().to_string()).collect();

                        if friend_ids.is_empty() {
                            if tx.send(Vec::new()).is_err() {
                                break;
                            }
                            continue;
                        }

                        let mut failed = false;
                        for (index, shard) in friend_ids.chunks(MAX_IN_ARITY).enumerate() {
                            let members: Vec<_> = shard.iter().map(|id| json!(id)).collect();
                            let query = Query::collection(paths::ENTRIES)
                                .filter(Filter::In("userId".into(), members))
                                .filter(Filter::Eq(
                                    "visibility".into(),
                                    json!(Visibility::Friends),
                                ))
                                .order(OrderBy::CreatedAtDesc);

                            match store.subscribe(query).await {
                                Ok(sub) => {
                                    batch_handles.push(sub.handle());
                                    latest.push(None);
                                    batch_streams.push(
                                        sub.map(move |docs| (index, docs)).boxed(),
                                    );
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "friend batch subscription failed");
                                    failed = true;
                                    break;
                                }
                            }
                        }
                        if failed {
                            break;
                        }
                    }

                    Some((index, docs)) = batch_streams.next(), if !batch_streams.is_empty() => {
                        if let Some(slot) = latest.get_mut(index) {
                            *slot = Some(decode_entries(docs));
                        }
                        if tx.send(merge_newest_first(&latest)).is_err() {
                            break;
                        }
                    }
                }
            }

            connection_sub.dispose();
            for handle in batch_handles {
                handle.dispose();
            }
        });

        Ok(Feed::new(rx, disposer))
    }
}

/// Stable newest-first merge across the per-batch snapshots. Batches that
/// have not reported yet simply contribute nothing; their first emission
/// triggers another merge.
fn merge_newest_first(latest: &[Option<Vec<EntryRecord>>]) -> Vec<EntryRecord> {
    let mut merged: Vec<EntryRecord> = latest
        .iter()
        .flatten()
        .flat_map(|batch| batch.iter().cloned())
        .collect();
    merged.sort_by(|a, b| b.entry.created_at.cmp(&a.entry.created_at));
    merged
}

fn decode_entries(docs: Vec<Document>) -> Vec<EntryRecord> {
    docs.into_iter()
        .filter_map(|doc| {
            let id = match EntryId::parse(doc.id()) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(path = %doc.path, error = %e, "bad entry id");
                    return None;
                }
            };
            match doc.decode::<JournalEntry>() {
                Ok(entry) => Some(EntryRecord { id, entry }),
                Err(e) => {
                    tracing::warn!(path = %doc.path, error = %e, "undecodable entry");
                    None
                }
            }
        })
        .collect()
}
