//! The document API: path-addressed reads and writes over the executor.
//!
//! Every operation is planned as one or more scheduled ops: the document
//! write itself, plus directory maintenance on each ancestor so that
//! listings stay consistent. Directory listings are ordinary documents
//! (sorted arrays of child names) stored under the directory's path on the
//! directory's own shard. Transient failures — optimistic write conflicts
//! and scheduling races — are retried with a small bounded backoff; every
//! other error surfaces as-is.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use tracing::{debug, trace};

use coffer_base::{Error, Result};

use crate::cache::ShardCache;
use crate::config::{self, Router};
use crate::executor::Executor;
use crate::keyring::Limits;
use crate::path::DocPath;
use crate::store::Store;

/// Default number of attempts for retryable failures.
const RETRY_LIMIT: u32 = 4;

/// Base backoff between attempts; grows linearly.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

type UpdateFn = dyn Fn(Option<Json>) -> Result<Json> + Send + Sync;

/// An open document store.
#[derive(Debug, Clone)]
pub struct Docs {
    executor: Executor,
    router: Router,
    retries: u32,
    backoff: Duration,
}

impl Docs {
    /// Open the store behind `store` with `password`.
    ///
    /// First use initialises the configuration blob; later opens verify the
    /// password against it and fail `Access` on a mismatch.
    pub async fn open(store: Arc<dyn Store>, password: &str) -> Result<Docs> {
        let bootstrap = config::open(store.as_ref(), password).await?;
        let cache = ShardCache::new(
            store,
            bootstrap.master.clone(),
            bootstrap.verifier.clone(),
            Limits::default(),
        );
        debug!(shards = bootstrap.router.buckets(), "store opened");
        Ok(Self {
            executor: Executor::new(cache),
            router: bootstrap.router,
            retries: RETRY_LIMIT,
            backoff: RETRY_BACKOFF,
        })
    }

    /// The document at `path`, or `None`.
    pub async fn get(&self, path: &str) -> Result<Option<Json>> {
        let path = DocPath::parse(path)?;
        self.retrying(|| self.try_get(&path)).await
    }

    /// The directory listing at `path`, or `None`.
    pub async fn list(&self, path: &str) -> Result<Option<Vec<String>>> {
        let path = DocPath::parse(path)?;
        self.retrying(|| self.try_list(&path)).await
    }

    /// Upsert the document at `path` through `f(current)`.
    ///
    /// `f` may run more than once when the write races other clients.
    pub async fn update<F>(&self, path: &str, f: F) -> Result<()>
    where
        F: Fn(Option<Json>) -> Result<Json> + Send + Sync + 'static,
    {
        let path = parse_document_path(path)?;
        let f: Arc<UpdateFn> = Arc::new(f);
        self.retrying(|| self.try_update(&path, f.clone())).await
    }

    /// Store a new document at `path`, failing `Exists` when present.
    pub async fn create(&self, path: &str, value: Json) -> Result<()> {
        let path = parse_document_path(path)?;
        let target = path.as_str().to_string();
        let f: Arc<UpdateFn> = Arc::new(move |current| match current {
            Some(_) => Err(Error::Exists(target.clone())),
            None => Ok(value.clone()),
        });
        self.retrying(|| self.try_update(&path, f.clone())).await
    }

    /// Remove the document at `path`, failing `Missing` when absent.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let path = parse_document_path(path)?;
        self.retrying(|| self.try_remove(&path)).await
    }

    /// Remove now-empty directory entries on the ancestor chain of `path`.
    pub async fn prune(&self, path: &str) -> Result<()> {
        let path = DocPath::parse(path)?;
        let mut dir = match path.parent() {
            Some(dir) => dir,
            None => return Ok(()),
        };
        while !dir.is_root() {
            let names = self.retrying(|| self.try_list(&dir)).await?;
            if names.is_some_and(|n| !n.is_empty()) {
                break;
            }
            let parent = dir.parent().expect("non-root path has a parent");
            self.retrying(|| self.try_unlink(&dir, &parent)).await?;
            dir = parent;
        }
        Ok(())
    }

    /// Every document path under `path`, breadth-first.
    ///
    /// A value that is an array of strings is taken to be a directory
    /// listing; keeping documents and listings apart is the caller's side of
    /// the layout contract.
    pub async fn find(&self, path: &str) -> Result<Vec<String>> {
        let start = DocPath::parse(path)?;
        let mut docs = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(at) = queue.pop_front() {
            match self.retrying(|| self.try_probe(&at)).await? {
                Probe::Dir(names) => {
                    for name in names {
                        queue.push_back(at.join(&name)?);
                    }
                }
                Probe::Doc => docs.push(at.to_string()),
                Probe::Absent => {}
            }
        }
        Ok(docs)
    }

    async fn try_get(&self, path: &DocPath) -> Result<Option<Json>> {
        let target = path.as_str().to_string();
        let sub = self
            .executor
            .submit(&self.router.route(path), &[], move |shard| async move {
                match shard.get(&target).await? {
                    Some(value) => Ok(json!([value])),
                    None => Ok(json!([])),
                }
            })?;
        let found = sub.wait().await?;
        Ok(found.as_array().and_then(|a| a.first()).cloned())
    }

    async fn try_list(&self, path: &DocPath) -> Result<Option<Vec<String>>> {
        let target = path.as_str().to_string();
        let sub = self
            .executor
            .submit(&self.router.route(path), &[], move |shard| async move {
                match shard.list(&target).await? {
                    Some(names) => Ok(json!([names])),
                    None => Ok(json!([])),
                }
            })?;
        let found = sub.wait().await?;
        match found.as_array().and_then(|a| a.first()) {
            Some(names) => Ok(Some(
                serde_json::from_value(names.clone())
                    .map_err(|err| Error::Corrupt(format!("directory listing: {err}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn try_probe(&self, path: &DocPath) -> Result<Probe> {
        let target = path.as_str().to_string();
        let sub = self
            .executor
            .submit(&self.router.route(path), &[], move |shard| async move {
                match shard.get(&target).await? {
                    None => Ok(Json::Null),
                    Some(Json::Array(items))
                        if items.iter().all(|item| item.is_string()) =>
                    {
                        Ok(json!({ "dir": items }))
                    }
                    Some(_) => Ok(json!({ "doc": true })),
                }
            })?;
        let found = sub.wait().await?;
        if found.is_null() {
            return Ok(Probe::Absent);
        }
        if let Some(names) = found.get("dir") {
            let names: Vec<String> = serde_json::from_value(names.clone())
                .map_err(|err| Error::Corrupt(format!("directory listing: {err}")))?;
            return Ok(Probe::Dir(names));
        }
        Ok(Probe::Doc)
    }

    /// Write the document, then link it into every ancestor listing.
    ///
    /// The link operations depend on the document operation, so a failed
    /// write cancels the whole plan in one stroke.
    async fn try_update(&self, path: &DocPath, f: Arc<UpdateFn>) -> Result<()> {
        trace!(path = %path, "update");
        let target = path.as_str().to_string();
        let doc = self
            .executor
            .submit(&self.router.route(path), &[], move |shard| async move {
                shard.put(&target, |current| f(current)).await?;
                Ok(Json::Null)
            })?;

        let mut links = Vec::new();
        let mut at = path.clone();
        while let Some(parent) = at.parent() {
            let name = at.name().expect("non-root path has a name").to_string();
            let dir = parent.as_str().to_string();
            links.push(self.executor.submit(
                &self.router.route(&parent),
                &[doc.id],
                move |shard| async move {
                    shard.link(&dir, &name).await?;
                    Ok(Json::Null)
                },
            )?);
            at = parent;
        }

        doc.wait().await?;
        for link in links {
            link.wait().await?;
        }
        Ok(())
    }

    async fn try_remove(&self, path: &DocPath) -> Result<()> {
        trace!(path = %path, "remove");
        let target = path.as_str().to_string();
        let doc = self
            .executor
            .submit(&self.router.route(path), &[], move |shard| async move {
                if shard.get(&target).await?.is_none() {
                    return Err(Error::Missing(target));
                }
                shard.rm(&target).await?;
                Ok(Json::Null)
            })?;

        let parent = path.parent().expect("document paths are not the root");
        let name = path.name().expect("non-root path has a name").to_string();
        let dir = parent.as_str().to_string();
        let unlink = self.executor.submit(
            &self.router.route(&parent),
            &[doc.id],
            move |shard| async move {
                shard.unlink(&dir, &name).await?;
                Ok(Json::Null)
            },
        )?;

        doc.wait().await?;
        unlink.wait().await?;
        Ok(())
    }

    /// Drop `dir`'s empty listing and its entry in `parent`.
    async fn try_unlink(&self, dir: &DocPath, parent: &DocPath) -> Result<()> {
        let target = dir.as_str().to_string();
        let listing = self
            .executor
            .submit(&self.router.route(dir), &[], move |shard| async move {
                shard.rm(&target).await?;
                Ok(Json::Null)
            })?;

        let name = dir.name().expect("non-root path has a name").to_string();
        let dir_of_parent = parent.as_str().to_string();
        let unlink = self.executor.submit(
            &self.router.route(parent),
            &[listing.id],
            move |shard| async move {
                shard.unlink(&dir_of_parent, &name).await?;
                Ok(Json::Null)
            },
        )?;

        listing.wait().await?;
        unlink.wait().await?;
        Ok(())
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt + 1 < self.retries => {
                    attempt += 1;
                    trace!(%err, attempt, "retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}

enum Probe {
    Dir(Vec<String>),
    Doc,
    Absent,
}

fn parse_document_path(path: &str) -> Result<DocPath> {
    let parsed = DocPath::parse(path)?;
    if parsed.is_root() {
        return Err(Error::InvalidPath("the root is a directory".into()));
    }
    Ok(parsed)
}
