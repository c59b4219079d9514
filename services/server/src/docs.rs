// Document binder interface consumed by the query engine.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use millrace_wire::Document;
use tokio::sync::RwLock;

/// Named document binders: lookup by id and lazy full scans.
#[async_trait]
pub trait DocManager: Send + Sync {
    async fn get(&self, binder: &str, doc_id: &str) -> Option<Document>;

    /// Lazy sequence of the binder's documents; empty for an unknown binder.
    async fn open_stream(&self, binder: &str) -> BoxStream<'static, Document>;
}

/// In-memory binder store backing tests and the default server.
#[derive(Default)]
pub struct MemoryDocManager {
    binders: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryDocManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, binder: &str, doc_id: &str, document: Document) {
        self.binders
            .write()
            .await
            .entry(binder.to_string())
            .or_default()
            .insert(doc_id.to_string(), document);
    }
}

#[async_trait]
impl DocManager for MemoryDocManager {
    async fn get(&self, binder: &str, doc_id: &str) -> Option<Document> {
        self.binders.read().await.get(binder)?.get(doc_id).cloned()
    }

    async fn open_stream(&self, binder: &str) -> BoxStream<'static, Document> {
        // Snapshot so the stream does not hold the lock while it drains.
        let docs: Vec<Document> = self
            .binders
            .read()
            .await
            .get(binder)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        stream::iter(docs).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_inserted_documents() {
        let docs = MemoryDocManager::new();
        docs.insert("baskets", "b1", Document::new().put("total", 12i32))
            .await;
        let doc = docs.get("baskets", "b1").await.expect("doc");
        assert_eq!(doc.get_i32("total"), Some(12));
        assert!(docs.get("baskets", "missing").await.is_none());
        assert!(docs.get("missing", "b1").await.is_none());
    }

    #[tokio::test]
    async fn stream_yields_documents_in_id_order() {
        let docs = MemoryDocManager::new();
        docs.insert("baskets", "b2", Document::new().put("id", "b2"))
            .await;
        docs.insert("baskets", "b1", Document::new().put("id", "b1"))
            .await;
        let collected: Vec<Document> = docs.open_stream("baskets").await.collect().await;
        let ids: Vec<&str> = collected
            .iter()
            .filter_map(|doc| doc.get_str("id"))
            .collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn unknown_binder_streams_nothing() {
        let docs = MemoryDocManager::new();
        let collected: Vec<Document> = docs.open_stream("missing").await.collect().await;
        assert!(collected.is_empty());
    }
}
