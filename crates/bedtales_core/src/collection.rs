//! crates/bedtales_core/src/collection.rs
//!
//! An in-memory view of one durable collection.
//!
//! Every mutation is written to the `DocumentStore` first and only then applied to the
//! in-memory list, so the list never shows state the store does not have. Mutations on
//! one collection are serialized behind an async lock, which makes the final in-memory
//! order follow call order even when callers race.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::ports::{DocumentStore, PortResult};
use crate::store::{self, Record};

/// A point-in-time copy of a collection's state.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionSnapshot<T> {
    pub data: Vec<T>,
    /// While true, an empty `data` does not mean the collection is empty.
    pub loading: bool,
    pub error: Option<String>,
}

struct CollectionState<T> {
    data: Vec<T>,
    loading: bool,
    error: Option<String>,
}

pub struct Collection<T: Record> {
    store: Arc<dyn DocumentStore>,
    state: RwLock<CollectionState<T>>,
    writes: Mutex<()>,
}

impl<T: Record> Collection<T> {
    /// Creates an unloaded collection. Call [`Collection::load`] before relying on `data`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            state: RwLock::new(CollectionState {
                data: Vec::new(),
                loading: true,
                error: None,
            }),
            writes: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CollectionState<T>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionState<T>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn fail(&self, action: &str, err: &crate::ports::PortError) {
        error!("Failed to {} {}: {}", action, T::STORE, err);
        self.write().error = Some(format!("Failed to {} {}", action, T::STORE));
    }

    //=====================================================================================
    // Reads
    //=====================================================================================

    pub fn snapshot(&self) -> CollectionSnapshot<T> {
        let state = self.read();
        CollectionSnapshot {
            data: state.data.clone(),
            loading: state.loading,
            error: state.error.clone(),
        }
    }

    pub fn data(&self) -> Vec<T> {
        self.read().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.read().loading
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.read().data.iter().find(|item| item.id() == id).cloned()
    }

    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.read().data.iter().find(|item| predicate(item)).cloned()
    }

    //=====================================================================================
    // Loading
    //=====================================================================================

    /// Loads the whole collection from the store, replacing the in-memory list.
    pub async fn load(&self) -> PortResult<()> {
        let _guard = self.writes.lock().await;
        self.write().loading = true;
        match store::load_all::<T>(self.store.as_ref()).await {
            Ok(records) => {
                debug!("Loaded {} records from {}", records.len(), T::STORE);
                let mut state = self.write();
                state.data = records;
                state.loading = false;
                state.error = None;
                Ok(())
            }
            Err(e) => {
                error!("Failed to load data from {}: {}", T::STORE, e);
                let mut state = self.write();
                state.loading = false;
                state.error = Some(format!("Failed to load data from {}", T::STORE));
                Err(e)
            }
        }
    }

    //=====================================================================================
    // Mutations
    //=====================================================================================

    /// Persists `item`, then puts it at the front of the list, replacing any record
    /// with the same id.
    pub async fn add(&self, item: T) -> PortResult<()> {
        let _guard = self.writes.lock().await;
        if let Err(e) = store::put_record(self.store.as_ref(), &item).await {
            self.fail("add item to", &e);
            return Err(e);
        }
        let mut state = self.write();
        state.data.retain(|existing| existing.id() != item.id());
        state.data.insert(0, item);
        Ok(())
    }

    /// Persists `item`, then replaces the matching record where it sits.
    pub async fn update(&self, item: T) -> PortResult<()> {
        let _guard = self.writes.lock().await;
        if let Err(e) = store::put_record(self.store.as_ref(), &item).await {
            self.fail("update item in", &e);
            return Err(e);
        }
        let mut state = self.write();
        match state.data.iter_mut().find(|existing| existing.id() == item.id()) {
            Some(slot) => *slot = item,
            None => state.data.insert(0, item),
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> PortResult<()> {
        let _guard = self.writes.lock().await;
        if let Err(e) = self.store.delete(T::STORE, id).await {
            self.fail("delete item from", &e);
            return Err(e);
        }
        self.write().data.retain(|item| item.id() != id);
        Ok(())
    }

    pub async fn delete_many(&self, ids: &[String]) -> PortResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.writes.lock().await;
        if let Err(e) = self.store.delete_many(T::STORE, ids).await {
            self.fail("delete multiple items from", &e);
            return Err(e);
        }
        self.write()
            .data
            .retain(|item| !ids.iter().any(|id| id == item.id()));
        Ok(())
    }

    pub async fn clear(&self) -> PortResult<()> {
        let _guard = self.writes.lock().await;
        if let Err(e) = self.store.clear(T::STORE).await {
            self.fail("clear", &e);
            return Err(e);
        }
        self.write().data.clear();
        Ok(())
    }

    /// Persists a batch, then re-reads the whole collection instead of merging.
    pub async fn bulk_add(&self, items: &[T]) -> PortResult<()> {
        let _guard = self.writes.lock().await;
        if let Err(e) = store::bulk_put_records(self.store.as_ref(), items).await {
            self.fail("bulk add items to", &e);
            return Err(e);
        }
        match store::load_all::<T>(self.store.as_ref()).await {
            Ok(records) => {
                self.write().data = records;
                Ok(())
            }
            Err(e) => {
                self.fail("reload", &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AppSetting;
    use crate::store::StoreName;
    use crate::testing::MemoryStore;
    use serde_json::json;

    fn setting(id: &str, value: i64) -> AppSetting {
        AppSetting {
            id: id.to_string(),
            value: json!(value),
        }
    }

    async fn loaded(store: Arc<MemoryStore>) -> Collection<AppSetting> {
        let collection = Collection::new(store);
        collection.load().await.unwrap();
        collection
    }

    #[tokio::test]
    async fn test_starts_loading_and_empty() {
        let store = Arc::new(MemoryStore::new());
        let collection: Collection<AppSetting> = Collection::new(store);
        let snapshot = collection.snapshot();
        assert!(snapshot.loading);
        assert!(snapshot.data.is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_sets_error() {
        let store = Arc::new(MemoryStore::new());
        store.fail_reads(true);
        let collection: Collection<AppSetting> = Collection::new(store);

        assert!(collection.load().await.is_err());
        assert!(!collection.is_loading());
        assert_eq!(collection.error().as_deref(), Some("Failed to load data from settings"));
    }

    #[tokio::test]
    async fn test_add_prepends_and_replaces_same_id() {
        let store = Arc::new(MemoryStore::new());
        let collection = loaded(store.clone()).await;

        collection.add(setting("a", 1)).await.unwrap();
        collection.add(setting("b", 2)).await.unwrap();
        collection.add(setting("a", 3)).await.unwrap();

        let ids: Vec<String> = collection.data().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(collection.get("a").unwrap().value, json!(3));
        assert_eq!(store.count(StoreName::Settings), 2);
    }

    #[tokio::test]
    async fn test_failed_add_leaves_cache_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let collection = loaded(store.clone()).await;
        collection.add(setting("a", 1)).await.unwrap();

        store.fail_writes(true);
        let result = collection.add(setting("b", 2)).await;

        assert!(result.is_err());
        assert_eq!(collection.data().len(), 1);
        assert_eq!(collection.error().as_deref(), Some("Failed to add item to settings"));
    }

    #[tokio::test]
    async fn test_update_keeps_position() {
        let store = Arc::new(MemoryStore::new());
        let collection = loaded(store).await;
        collection.add(setting("a", 1)).await.unwrap();
        collection.add(setting("b", 2)).await.unwrap();

        collection.update(setting("a", 10)).await.unwrap();

        let data = collection.data();
        assert_eq!(data[0].id, "b");
        assert_eq!(data[1].id, "a");
        assert_eq!(data[1].value, json!(10));
    }

    #[tokio::test]
    async fn test_delete_many_ignores_missing_ids() {
        let store = Arc::new(MemoryStore::new());
        let collection = loaded(store.clone()).await;
        for (id, v) in [("a", 1), ("b", 2), ("c", 3)] {
            collection.add(setting(id, v)).await.unwrap();
        }

        collection
            .delete_many(&["a".to_string(), "missing".to_string(), "c".to_string()])
            .await
            .unwrap();

        let ids: Vec<String> = collection.data().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(store.count(StoreName::Settings), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_store_and_cache() {
        let store = Arc::new(MemoryStore::new());
        let collection = loaded(store.clone()).await;
        collection.add(setting("a", 1)).await.unwrap();

        collection.clear().await.unwrap();

        assert!(collection.data().is_empty());
        assert_eq!(store.count(StoreName::Settings), 0);
    }

    #[tokio::test]
    async fn test_bulk_add_refetches_from_store() {
        let store = Arc::new(MemoryStore::new());
        let collection = loaded(store.clone()).await;
        // Written behind the collection's back; a merge would miss it.
        store
            .put(StoreName::Settings, "external", json!({"id": "external", "value": 0}))
            .await
            .unwrap();

        collection
            .bulk_add(&[setting("x", 1), setting("y", 2)])
            .await
            .unwrap();

        let mut ids: Vec<String> = collection.data().into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["external", "x", "y"]);
    }

    #[tokio::test]
    async fn test_concurrent_adds_follow_call_order() {
        let store = Arc::new(MemoryStore::new());
        store.delay_writes(20);
        let collection = Arc::new(loaded(store).await);

        let first = {
            let c = collection.clone();
            tokio::spawn(async move { c.add(setting("first", 1)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = {
            let c = collection.clone();
            tokio::spawn(async move { c.add(setting("second", 2)).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let ids: Vec<String> = collection.data().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["second", "first"]);
    }
}
