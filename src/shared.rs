//! Single-writer shared state.
//!
//! Every state record is published through a [`StateWriter`] that exactly one
//! owner holds. Everyone else gets a [`StateReader`] and only ever sees whole
//! snapshots, so a reader can never observe half of a logical update.

use tokio::sync::watch;

/// Create a writer/reader pair seeded with `initial`.
pub fn shared<T: Clone>(initial: T) -> (StateWriter<T>, StateReader<T>) {
    let (tx, rx) = watch::channel(initial);
    (StateWriter { tx }, StateReader { rx })
}

/// The only handle that can mutate a record. Not `Clone`.
#[derive(Debug)]
pub struct StateWriter<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> StateWriter<T> {
    /// Apply `f` to the record and notify readers.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.tx.send_modify(f);
    }

    /// Apply `f`, notifying readers only when it reports a change.
    pub fn update_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.tx.send_if_modified(f)
    }

    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> StateReader<T> {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of a record.
#[derive(Debug, Clone)]
pub struct StateReader<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> StateReader<T> {
    pub fn snapshot(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Borrow-free projection of a single field.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.rx.borrow())
    }

    /// Whether the writer published since the last [`snapshot_and_mark`](Self::snapshot_and_mark).
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub fn snapshot_and_mark(&mut self) -> T {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next publication. Returns `false` once the writer is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
