//! Transaction scope with a post-commit task queue.
//!
//! A [`UnitOfWork`] wraps one database transaction. Every write of a workflow goes
//! through [`UnitOfWork::txn`]; side effects that must only happen once the writes are
//! durable (notifications, events) are queued with [`UnitOfWork::after_commit`].
//! Dropping the unit without committing rolls the transaction back and discards the
//! queued tasks.

use crate::errors::ServiceError;
use futures::future::BoxFuture;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::{fmt::Display, future::Future};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct UnitOfWork {
    txn: DatabaseTransaction,
    post_commit: Vec<(&'static str, BoxFuture<'static, ()>)>,
}

impl UnitOfWork {
    pub async fn begin(db: &DatabaseConnection) -> Result<Self, ServiceError> {
        let txn = db.begin().await?;
        Ok(Self {
            txn,
            post_commit: Vec::new(),
        })
    }

    /// Connection every step of the workflow must use.
    pub fn txn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// Queues a task to run after a successful commit. Its failure is logged and
    /// never reaches the caller.
    pub fn after_commit<F, E>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.post_commit.push((
            name,
            Box::pin(async move {
                if let Err(err) = task.await {
                    warn!(task = name, error = %err, "post-commit task failed");
                }
            }),
        ));
    }

    pub fn pending_tasks(&self) -> usize {
        self.post_commit.len()
    }

    /// Commits the transaction, then spawns the queued tasks.
    pub async fn commit(self) -> Result<PostCommit, ServiceError> {
        self.txn.commit().await?;

        let handles = self
            .post_commit
            .into_iter()
            .map(|(name, task)| {
                debug!(task = name, "dispatching post-commit task");
                tokio::spawn(task)
            })
            .collect();

        Ok(PostCommit { handles })
    }

    pub async fn rollback(self) -> Result<(), ServiceError> {
        self.txn.rollback().await?;
        Ok(())
    }
}

/// Handles to the tasks spawned by a commit. Dropping it detaches them.
pub struct PostCommit {
    handles: Vec<JoinHandle<()>>,
}

impl PostCommit {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every spawned task to finish.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
