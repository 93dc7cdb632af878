//! Live listing plumbing.
//!
//! Every list a component hands to the UI is a [`Feed`]: a channel of full
//! snapshots plus a [`Disposer`]. Each feed is backed by a forwarder task
//! that owns the underlying store subscription(s); disposing the feed wakes
//! the task so it can drop those subscriptions and exit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use keepsake_store::QuerySubscription;

/// Idempotent teardown handle shared between a [`Feed`] and its forwarder
/// task. Not disposing a feed leaks its subscription channel.
#[derive(Clone)]
pub struct Disposer {
    disposed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Disposer {
    pub(crate) fn new() -> Self {
        Self {
            disposed: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            // notify_one leaves a permit, so a task that has not yet
            // started waiting still observes the disposal.
            self.notify.notify_one();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        if self.is_disposed() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A live, restartable listing: each received item is the full current
/// sequence. Once disposed it yields nothing further, even if a snapshot
/// was already in flight.
pub struct Feed<T> {
    rx: mpsc::UnboundedReceiver<Vec<T>>,
    disposer: Disposer,
}

impl<T> Feed<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Vec<T>>, disposer: Disposer) -> Self {
        Self { rx, disposer }
    }

    /// Next snapshot, or `None` once disposed / torn down upstream.
    pub async fn next(&mut self) -> Option<Vec<T>> {
        if self.disposer.is_disposed() {
            return None;
        }
        let snapshot = self.rx.recv().await;
        if self.disposer.is_disposed() {
            return None;
        }
        snapshot
    }

    pub fn dispose(&self) {
        self.disposer.dispose();
    }

    pub fn disposer(&self) -> Disposer {
        self.disposer.clone()
    }
}

/// Forward one store subscription through a mapping function.
pub(crate) fn spawn_feed<T, F, Fut>(mut sub: QuerySubscription, mut map: F) -> Feed<T>
where
    T: Send + 'static,
    F: FnMut(Vec<keepsake_store::Document>) -> Fut + Send + 'static,
    Fut: Future<Output = Vec<T>> + Send,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let disposer = Disposer::new();
    let waiter = disposer.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = waiter.wait() => break,
                maybe = sub.recv() => match maybe {
                    Some(docs) => {
                        if tx.send(map(docs).await).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        sub.dispose();
    });

    Feed::new(rx, disposer)
}
