//! The async store handle and its owner task.
//!
//! [`DocumentStore::spawn`] moves the [`Database`] into a dedicated task;
//! every handle clone sends commands over an unbounded channel and awaits a
//! oneshot reply. Because a single task applies every batch, writes are
//! totally ordered and subscription snapshots monotonically reflect the
//! latest committed state within one channel.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use keepsake_shared::Clock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::database::Database;
use crate::documents::Document;
use crate::error::{Result, StoreError};
use crate::ops::{DocPath, Query, WriteOp};

enum Command {
    Get {
        path: DocPath,
        reply: oneshot::Sender<Result<Option<Document>>>,
    },
    Apply {
        ops: Vec<WriteOp>,
        reply: oneshot::Sender<Result<()>>,
    },
    Run {
        query: Query,
        reply: oneshot::Sender<Result<Vec<Document>>>,
    },
    Subscribe {
        id: u64,
        query: Query,
        snapshots: mpsc::UnboundedSender<Vec<Document>>,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: u64,
    },
}

struct Registration {
    query: Query,
    snapshots: mpsc::UnboundedSender<Vec<Document>>,
}

/// Cloneable async handle to the store task.
#[derive(Clone)]
pub struct DocumentStore {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_sub_id: Arc<AtomicU64>,
}

impl DocumentStore {
    /// Move the database into its owner task and return a handle.
    ///
    /// The clock stamps store-assigned `createdAt` values, so tests driving
    /// a manual clock see it reflected in creation metadata too.
    pub fn spawn(db: Database, clock: Arc<dyn Clock>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_store(db, clock, cmd_rx));
        Self {
            cmd_tx,
            next_sub_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Point read. Absence is `Ok(None)`.
    pub async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get {
                path: path.clone(),
                reply,
            })
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Apply a batch of writes atomically: all ops commit or none do.
    pub async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Apply { ops, reply })
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Single-document create; fails with a conflict if the path exists.
    pub async fn create<T: Serialize>(&self, path: DocPath, record: &T) -> Result<()> {
        let data = serde_json::to_value(record)?;
        self.apply(vec![WriteOp::Create { path, data }]).await
    }

    /// Merge top-level fields into an existing document.
    pub async fn update(
        &self,
        path: DocPath,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.apply(vec![WriteOp::Update { path, fields }]).await
    }

    /// Single-document delete.
    pub async fn delete(&self, path: DocPath, must_exist: bool) -> Result<()> {
        self.apply(vec![WriteOp::Delete { path, must_exist }]).await
    }

    /// One-shot ordered range query.
    pub async fn query(&self, query: Query) -> Result<Vec<Document>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Run { query, reply })
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Live query: emits the current snapshot immediately, then the full
    /// snapshot again after every committed batch touching the collection.
    pub async fn subscribe(&self, query: Query) -> Result<QuerySubscription> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (snap_tx, snap_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                id,
                query,
                snapshots: snap_tx,
                reply,
            })
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)??;

        Ok(QuerySubscription {
            rx: snap_rx,
            handle: SubscriptionHandle {
                id,
                cmd_tx: self.cmd_tx.clone(),
                disposed: Arc::new(AtomicBool::new(false)),
            },
        })
    }
}

/// Disposal handle for a live query. Disposal is idempotent and takes
/// effect synchronously from the caller's perspective: once disposed, the
/// subscription yields nothing further, in-flight snapshots included.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    disposed: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            // The task may already be gone; nothing left to clean up then.
            let _ = self.cmd_tx.send(Command::Unsubscribe { id: self.id });
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// A live query channel. Each received item is the query's full current
/// result set, totally ordered with respect to committed writes.
pub struct QuerySubscription {
    rx: mpsc::UnboundedReceiver<Vec<Document>>,
    handle: SubscriptionHandle,
}

impl QuerySubscription {
    /// Next snapshot, or `None` once disposed / the store shut down.
    pub async fn recv(&mut self) -> Option<Vec<Document>> {
        if self.handle.is_disposed() {
            return None;
        }
        let snapshot = self.rx.recv().await;
        if self.handle.is_disposed() {
            return None;
        }
        snapshot
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn dispose(&self) {
        self.handle.dispose();
    }
}

impl Stream for QuerySubscription {
    type Item = Vec<Document>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.handle.is_disposed() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(snapshot)) => {
                if self.handle.is_disposed() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(snapshot))
                }
            }
            other => other,
        }
    }
}

async fn run_store(
    mut db: Database,
    clock: Arc<dyn Clock>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut subs: HashMap<u64, Registration> = HashMap::new();

    debug!("document store task started");

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Get { path, reply } => {
                let _ = reply.send(db.get_document(&path));
            }

            Command::Run { query, reply } => {
                let _ = reply.send(db.run_query(&query));
            }

            Command::Apply { ops, reply } => {
                let touched: HashSet<String> = ops
                    .iter()
                    .map(|op| op.path().collection().to_string())
                    .collect();

                let result = db.apply_batch(&ops, clock.now());
                match result {
                    Ok(changed) => {
                        if changed > 0 {
                            fan_out(&db, &mut subs, &touched);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            Command::Subscribe {
                id,
                query,
                snapshots,
                reply,
            } => match db.run_query(&query) {
                Ok(initial) => {
                    if snapshots.send(initial).is_ok() {
                        subs.insert(id, Registration { query, snapshots });
                    }
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::Unsubscribe { id } => {
                subs.remove(&id);
            }
        }
    }

    debug!("document store task stopped");
}

/// Re-run and re-emit every registered query whose collection was touched
/// by a committed batch. Dead receivers are dropped from the registry.
fn fan_out(db: &Database, subs: &mut HashMap<u64, Registration>, touched: &HashSet<String>) {
    let mut dead = Vec::new();

    for (id, reg) in subs.iter() {
        if !touched.contains(reg.query.collection_path()) {
            continue;
        }
        match db.run_query(&reg.query) {
            Ok(snapshot) => {
                if reg.snapshots.send(snapshot).is_err() {
                    dead.push(*id);
                }
            }
            Err(e) => {
                warn!(subscription = id, error = %e, "live query re-run failed");
            }
        }
    }

    for id in dead {
        subs.remove(&id);
    }
}
