use super::{Record, RecordKind, Store, StoreError};
use crate::core::lock;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

type Table = BTreeMap<(RecordKind, String), Record>;

/// In-memory store with staged-copy transactions.
///
/// A batch is applied to a copy of the table and swapped in only when every
/// write succeeded, so a failing batch never leaves partial state behind.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Table>,
    order: Mutex<BTreeMap<RecordKind, Vec<String>>>,
    failing: Mutex<HashSet<RecordKind>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every batch containing a record of `kind` fail.
    pub fn fail_on(&self, kind: RecordKind) {
        lock(&self.failing).insert(kind);
    }

    pub fn heal(&self, kind: RecordKind) {
        lock(&self.failing).remove(&kind);
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        lock(&self.rows).keys().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_by_uri(&self, kind: RecordKind, uri: &str) -> Result<Option<Record>, StoreError> {
        Ok(lock(&self.rows).get(&(kind, uri.to_string())).cloned())
    }

    async fn save_all(&self, records: Vec<Record>) -> Result<(), StoreError> {
        let failing = lock(&self.failing).clone();
        let mut rows = lock(&self.rows);
        let mut staged = rows.clone();
        let mut created = Vec::new();

        for record in records {
            if failing.contains(&record.kind) {
                return Err(StoreError::Backend(format!(
                    "write rejected for {} '{}'",
                    record.kind, record.uri
                )));
            }
            let key = (record.kind, record.uri.clone());
            if !staged.contains_key(&key) && !created.contains(&key) {
                created.push(key.clone());
            }
            staged.insert(key, record);
        }

        *rows = staged;
        drop(rows);

        let mut order = lock(&self.order);
        for (kind, uri) in created {
            order.entry(kind).or_default().push(uri);
        }
        Ok(())
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        let rows = lock(&self.rows);
        let order = lock(&self.order);
        Ok(order
            .get(&kind)
            .map(|uris| {
                uris.iter()
                    .filter_map(|uri| rows.get(&(kind, uri.clone())).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, kind: RecordKind, uri: &str) -> Result<bool, StoreError> {
        let removed = lock(&self.rows).remove(&(kind, uri.to_string())).is_some();
        if removed {
            if let Some(uris) = lock(&self.order).get_mut(&kind) {
                uris.retain(|u| u != uri);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_get() {
        let store = MemoryStore::new();
        store
            .save(Record::new(RecordKind::Config, "c1", json!({"a": 1})))
            .await
            .unwrap();

        let found = store.get_by_uri(RecordKind::Config, "c1").await.unwrap();
        assert_eq!(found.unwrap().body, json!({"a": 1}));
        assert!(store.get_by_uri(RecordKind::Job, "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = MemoryStore::new();
        store.fail_on(RecordKind::Job);

        let result = store
            .save_all(vec![
                Record::new(RecordKind::Config, "c1", json!({})),
                Record::new(RecordKind::Job, "j1", json!({})),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(store.count(RecordKind::Config), 0);
        assert_eq!(store.count(RecordKind::Job), 0);
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let store = MemoryStore::new();
        for uri in ["b", "a", "c"] {
            store
                .save(Record::new(RecordKind::QueueEntry, uri, json!({})))
                .await
                .unwrap();
        }
        // Overwriting keeps the original position.
        store
            .save(Record::new(RecordKind::QueueEntry, "b", json!({"x": 1})))
            .await
            .unwrap();

        let uris: Vec<_> = store
            .list(RecordKind::QueueEntry)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.uri)
            .collect();
        assert_eq!(uris, vec!["b", "a", "c"]);

        assert!(store.delete(RecordKind::QueueEntry, "a").await.unwrap());
        assert_eq!(store.list(RecordKind::QueueEntry).await.unwrap().len(), 2);
    }
}
