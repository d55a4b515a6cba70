//! Unit of work with deferred writes and post-commit hooks
//!
//! Writes staged on a [`Transaction`] become visible only when it commits.
//! Hooks registered with [`Transaction::on_commit`] run strictly after every
//! staged write succeeded; a rollback or a failed write discards them.

use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

type StagedWrite = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type CommitHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct Transaction {
    id: Uuid,
    writes: Vec<StagedWrite>,
    hooks: Vec<CommitHook>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            writes: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stage a write, applied in order at commit
    pub fn stage<F, Fut>(&mut self, write: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.writes.push(Box::new(move || write().boxed()));
    }

    /// Register a hook to run once the commit went through
    pub fn on_commit<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.push(Box::new(move || hook().boxed()));
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Apply staged writes, then run hooks. Returns the number of hooks run.
    ///
    /// The first failing write aborts the commit: later writes and all hooks
    /// are dropped. Writes applied before the failure are not undone.
    pub async fn commit(self) -> Result<usize> {
        let Transaction { id, writes, hooks } = self;

        let total = writes.len();
        for (i, write) in writes.into_iter().enumerate() {
            if let Err(e) = write().await {
                warn!(tx = %id, write = i, total, error = %e, "Transaction aborted, dropping post-commit hooks");
                return Err(e);
            }
        }
        debug!(tx = %id, writes = total, hooks = hooks.len(), "Transaction committed");

        let count = hooks.len();
        for hook in hooks {
            hook().await;
        }
        Ok(count)
    }

    /// Discard staged writes and hooks
    pub fn rollback(self) {
        debug!(
            tx = %self.id,
            writes = self.writes.len(),
            hooks = self.hooks.len(),
            "Transaction rolled back"
        );
    }
}
