//! The executor: drains the schedule and runs groups against the cache.
//!
//! Each submitted operation is an async function over its shard plus a
//! deferred result future. The executor takes admissible groups, reads
//! every shard the schedule currently mentions (so no group ever runs
//! against a shard another in-flight group is about to replace), applies
//! the group's operations in order, and writes the shard back with an
//! optimistic revision check. Failures reject exactly the futures of the
//! operations they cancel.

use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use coffer_base::{Error, Result};

use crate::cache::ShardCache;
use crate::schedule::{GroupHandle, OpId, Schedule};
use crate::shard::Shard;

/// The future produced by an operation function.
pub type OpFuture = BoxFuture<'static, Result<Json>>;

/// A boxed operation: runs against its group's shard, yields a JSON result.
pub type OpFn = Box<dyn FnOnce(Arc<Shard>) -> OpFuture + Send>;

/// A scheduled operation's function and its result channel.
struct OpTask {
    f: OpFn,
    tx: oneshot::Sender<Result<Json>>,
}

/// A submitted operation: its id (for dependencies) and pending result.
#[derive(Debug)]
pub struct Submission {
    /// The operation id, usable as a dependency of later submissions.
    pub id: OpId,
    rx: oneshot::Receiver<Result<Json>>,
}

impl Submission {
    /// Await the operation's result.
    ///
    /// Resolves once the operation's group has been written to storage, or
    /// rejects with the error that cancelled the operation.
    pub async fn wait(self) -> Result<Json> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Schedule("operation abandoned".into())),
        }
    }
}

/// Drives a [`Schedule`] of operations over a [`ShardCache`].
///
/// Cheap to clone; clones share the schedule and cache. Group requests are
/// spawned onto the ambient tokio runtime, so an executor must live inside
/// one.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    schedule: Schedule<OpTask>,
    cache: ShardCache,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("schedule", &self.inner.schedule)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Executor {
    /// An executor over `cache`.
    pub fn new(cache: ShardCache) -> Self {
        Self {
            inner: Arc::new(Inner {
                schedule: Schedule::new(),
                cache,
            }),
        }
    }

    /// Submit an operation on `shard` depending on `deps`.
    pub fn submit<F, Fut>(&self, shard: &str, deps: &[OpId], f: F) -> Result<Submission>
    where
        F: FnOnce(Arc<Shard>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Json>> + Send + 'static,
    {
        self.add(shard, deps, Box::new(move |shard| f(shard).boxed()))
    }

    /// Submit a boxed operation on `shard` depending on `deps`.
    pub fn add(&self, shard: &str, deps: &[OpId], f: OpFn) -> Result<Submission> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.schedule.add(shard, deps, OpTask { f, tx })?;
        self.poll();
        Ok(Submission { id, rx })
    }

    /// Start every admissible group.
    ///
    /// Groups are started synchronously and their requests spawned; an
    /// operation submitted while its shard is busy batches into the next
    /// group instead.
    pub fn poll(&self) {
        while let Some(group) = self.inner.schedule.next_group() {
            if let Err(err) = group.started() {
                // Lost a race against a concurrent failure; skip it.
                trace!(%err, "skipping stale group");
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                this.request(group).await;
            });
        }
    }

    async fn request(&self, group: GroupHandle<OpTask>) {
        let shard_id = group.shard().to_string();
        let tasks = match group.take_values() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, shard = %shard_id, "group vanished before execution");
                return;
            }
        };
        trace!(shard = %shard_id, ops = tasks.len(), "running group");

        // Read every shard the schedule mentions before touching our own:
        // concurrent groups over overlapping shard sets must all see the
        // same loaded instances.
        let ids = self.inner.schedule.shards();
        let coherent = try_join_all(ids.iter().map(|id| self.inner.cache.read(id))).await;
        let shard = match coherent {
            Ok(_) => self.inner.cache.read(&shard_id).await,
            Err(err) => Err(err),
        };
        let shard = match shard {
            Ok(shard) => shard,
            Err(err) => {
                let senders = tasks.into_iter().map(|(_, task)| task.tx).collect();
                self.fail_group(&group, senders, err);
                self.poll();
                return;
            }
        };

        let mut senders = Vec::with_capacity(tasks.len());
        let mut results = Vec::with_capacity(tasks.len());
        let mut failure = None;
        let mut tasks = tasks.into_iter();
        for (id, task) in tasks.by_ref() {
            senders.push(task.tx);
            match (task.f)(shard.clone()).await {
                Ok(value) => results.push(value),
                Err(err) => {
                    trace!(op = %id, %err, "operation failed");
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            // Earlier ops in the group may have mutated the shard in memory;
            // none of it was written, so drop the cached copy.
            self.inner.cache.evict(&shard_id);
            senders.extend(tasks.map(|(_, task)| task.tx));
            self.fail_group(&group, senders, err);
            self.poll();
            return;
        }

        match self.inner.cache.write(&shard_id).await {
            Ok(()) => {
                for (tx, value) in senders.into_iter().zip(results) {
                    let _ = tx.send(Ok(value));
                }
                if let Err(err) = group.completed() {
                    warn!(%err, "group completion");
                }
            }
            Err(err) => self.fail_group(&group, senders, err),
        }
        self.poll();
    }

    /// Fail the group and reject both its own senders and every operation
    /// cancelled downstream with the same error.
    fn fail_group(
        &self,
        group: &GroupHandle<OpTask>,
        senders: Vec<oneshot::Sender<Result<Json>>>,
        err: Error,
    ) {
        let cancelled = match group.failed() {
            Ok(cancelled) => cancelled,
            Err(other) => {
                warn!(%other, "group failure bookkeeping");
                Vec::new()
            }
        };
        for tx in senders {
            let _ = tx.send(Err(err.clone()));
        }
        for task in cancelled {
            let _ = task.tx.send(Err(err.clone()));
        }
    }
}
