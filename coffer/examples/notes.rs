//! Minimal end-to-end tour: open an on-disk store, write a few notes,
//! walk the tree, and show that everything at rest is ciphertext.
//!
//! ```text
//! cargo run --example notes -- /tmp/coffer-notes
//! ```

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use coffer::store::fs::FileStore;
use coffer::Docs;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let root = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coffer-notes".to_string());
    let store = Arc::new(FileStore::new(&root).await?);
    let docs = Docs::open(store, "correct horse battery staple").await?;

    docs.update("/notes/groceries", |_| {
        Ok(json!({ "items": ["bread", "beans"] }))
    })
    .await?;
    docs.update("/notes/ideas/coffer", |_| {
        Ok(json!({ "text": "encrypt everything" }))
    })
    .await?;
    docs.update("/notes/groceries", |current| {
        let mut doc = current.unwrap_or_else(|| json!({ "items": [] }));
        doc["items"].as_array_mut().expect("items array").push(json!("coffee"));
        Ok(doc)
    })
    .await?;

    println!("documents under /notes:");
    for path in docs.find("/notes").await? {
        let value = docs.get(&path).await?.expect("listed doc exists");
        println!("  {path}: {value}");
    }

    println!("top-level directories: {:?}", docs.list("/").await?);
    println!("blobs on disk under {root} are opaque ciphertext lines.");
    Ok(())
}
