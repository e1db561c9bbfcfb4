//! End-to-end tests over the public document API.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use coffer::store::fs::FileStore;
use coffer::store::mem::MemStore;
use coffer::store::Store;
use coffer::{Docs, Error};

async fn open_mem() -> Result<(Docs, MemStore)> {
    let store = MemStore::new();
    let docs = Docs::open(Arc::new(store.clone()), "correct horse").await?;
    Ok((docs, store))
}

#[tokio::test(flavor = "multi_thread")]
async fn write_read_list_cycle() -> Result<()> {
    let (docs, _store) = open_mem().await?;

    docs.update("/notes/a", |_| Ok(json!({"n": 1}))).await?;
    docs.update("/notes/b", |_| Ok(json!({"n": 2}))).await?;
    docs.update("/letters/x", |_| Ok(json!("x"))).await?;

    assert_eq!(docs.get("/notes/a").await?, Some(json!({"n": 1})));
    assert_eq!(docs.get("/notes/missing").await?, None);
    assert_eq!(
        docs.list("/notes").await?,
        Some(vec!["a".to_string(), "b".to_string()])
    );
    assert_eq!(
        docs.list("/").await?,
        Some(vec!["letters".to_string(), "notes".to_string()])
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn updates_transform_current_value() -> Result<()> {
    let (docs, _store) = open_mem().await?;
    docs.update("/counter", |_| Ok(json!(0))).await?;
    for _ in 0..5 {
        docs.update("/counter", |current| {
            let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(n + 1))
        })
        .await?;
    }
    assert_eq!(docs.get("/counter").await?, Some(json!(5)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn persists_across_reopen() -> Result<()> {
    let store = MemStore::new();
    {
        let docs = Docs::open(Arc::new(store.clone()), "pw").await?;
        docs.update("/deep/ly/nested/doc", |_| Ok(json!(true))).await?;
    }
    let docs = Docs::open(Arc::new(store.clone()), "pw").await?;
    assert_eq!(docs.get("/deep/ly/nested/doc").await?, Some(json!(true)));
    assert_eq!(docs.list("/deep/ly").await?, Some(vec!["nested".to_string()]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_denied() -> Result<()> {
    let store = MemStore::new();
    Docs::open(Arc::new(store.clone()), "first").await?;
    let denied = Docs::open(Arc::new(store.clone()), "second").await;
    assert!(matches!(denied, Err(Error::Access(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn create_and_remove_enforce_existence() -> Result<()> {
    let (docs, _store) = open_mem().await?;

    docs.create("/a/doc", json!(1)).await?;
    assert!(matches!(
        docs.create("/a/doc", json!(2)).await,
        Err(Error::Exists(_))
    ));
    assert_eq!(docs.get("/a/doc").await?, Some(json!(1)));

    docs.remove("/a/doc").await?;
    assert_eq!(docs.get("/a/doc").await?, None);
    assert_eq!(docs.list("/a").await?, None);
    assert!(matches!(
        docs.remove("/a/doc").await,
        Err(Error::Missing(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn prune_collapses_empty_ancestry() -> Result<()> {
    let (docs, _store) = open_mem().await?;
    docs.update("/a/b/c/doc", |_| Ok(json!(1))).await?;
    docs.update("/a/keep", |_| Ok(json!(2))).await?;

    docs.remove("/a/b/c/doc").await?;
    docs.prune("/a/b/c/doc").await?;

    // /a/b/c and /a/b are gone, /a survives because of /a/keep.
    assert_eq!(docs.list("/a/b/c").await?, None);
    assert_eq!(docs.list("/a/b").await?, None);
    assert_eq!(docs.list("/a").await?, Some(vec!["keep".to_string()]));
    assert_eq!(docs.list("/").await?, Some(vec!["a".to_string()]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn find_walks_the_tree() -> Result<()> {
    let (docs, _store) = open_mem().await?;
    docs.update("/a/one", |_| Ok(json!(1))).await?;
    docs.update("/a/two", |_| Ok(json!(2))).await?;
    docs.update("/a/sub/three", |_| Ok(json!(3))).await?;
    docs.update("/b/four", |_| Ok(json!(4))).await?;

    let mut under_a = docs.find("/a").await?;
    under_a.sort();
    assert_eq!(under_a, vec!["/a/one", "/a/sub/three", "/a/two"]);

    let mut all = docs.find("/").await?;
    all.sort();
    assert_eq!(all.len(), 4);
    assert!(all.contains(&"/b/four".to_string()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_writers_converge() -> Result<()> {
    let store = MemStore::new();
    let one = Docs::open(Arc::new(store.clone()), "pw").await?;
    let two = Docs::open(Arc::new(store.clone()), "pw").await?;

    // Interleave writes from two independent clients; conflicts are
    // absorbed by the retry layer.
    let a = tokio::spawn(async move {
        for i in 0..5 {
            one.update(&format!("/one/doc-{i}"), move |_| Ok(json!(i)))
                .await?;
        }
        Ok::<_, Error>(one)
    });
    let b = tokio::spawn(async move {
        for i in 0..5 {
            two.update(&format!("/two/doc-{i}"), move |_| Ok(json!(i)))
                .await?;
        }
        Ok::<_, Error>(two)
    });
    let _one = a.await??;
    let _two = b.await??;

    // A fresh client sees the union of both writers.
    let fresh = Docs::open(Arc::new(store.clone()), "pw").await?;
    let mut all = fresh.find("/").await?;
    all.sort();
    assert_eq!(all.len(), 10);
    assert_eq!(fresh.get("/one/doc-0").await?, Some(json!(0)));
    assert_eq!(fresh.get("/two/doc-4").await?, Some(json!(4)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn file_store_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileStore::new(dir.path()).await?);
    {
        let docs = Docs::open(store.clone(), "pw").await?;
        docs.update("/on/disk", |_| Ok(json!({"ok": true}))).await?;
    }
    let docs = Docs::open(store, "pw").await?;
    assert_eq!(docs.get("/on/disk").await?, Some(json!({"ok": true})));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_blobs_leak_no_plaintext() -> Result<()> {
    let (docs, store) = open_mem().await?;
    docs.update("/secret/document", |_| Ok(json!("tell nobody")))
        .await?;

    // Walk every stored blob; neither path segments nor values appear.
    for i in 0..coffer::config::DEFAULT_SHARD_COUNT {
        let id = format!("shard-{i:04x}");
        if let Some(stored) = store.read(&id).await? {
            assert!(!stored.value.contains("secret"));
            assert!(!stored.value.contains("document"));
            assert!(!stored.value.contains("tell nobody"));
        }
    }
    Ok(())
}
