//! crates/bedtales_core/src/store.rs
//!
//! Collection names and typed access over the JSON-valued `DocumentStore` port.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::domain::{ApiUsage, AppSetting, Character, HistoryItem, SavedStory};
use crate::ports::{DocumentStore, PortError, PortResult};

/// The named collections of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    Stories,
    History,
    Characters,
    Settings,
    ApiUsage,
}

impl StoreName {
    pub const ALL: [StoreName; 5] = [
        StoreName::Stories,
        StoreName::History,
        StoreName::Characters,
        StoreName::Settings,
        StoreName::ApiUsage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::Stories => "stories",
            StoreName::History => "history",
            StoreName::Characters => "characters",
            StoreName::Settings => "settings",
            StoreName::ApiUsage => "apiUsage",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity persisted in exactly one collection, keyed by its `id`.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const STORE: StoreName;

    fn id(&self) -> &str;
}

impl Record for SavedStory {
    const STORE: StoreName = StoreName::Stories;
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for HistoryItem {
    const STORE: StoreName = StoreName::History;
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Character {
    const STORE: StoreName = StoreName::Characters;
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for AppSetting {
    const STORE: StoreName = StoreName::Settings;
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for ApiUsage {
    const STORE: StoreName = StoreName::ApiUsage;
    fn id(&self) -> &str {
        self.id.as_str()
    }
}

//=========================================================================================
// Typed Helpers
//=========================================================================================

/// Loads and decodes a whole collection.
///
/// Rows that no longer decode as `T` are skipped with a warning so a single corrupted
/// record cannot make the rest of the collection unreadable.
pub async fn load_all<T: Record>(store: &dyn DocumentStore) -> PortResult<Vec<T>> {
    let rows = store.get_all(T::STORE).await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<T>(row) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping malformed record in {}: {}", T::STORE, e),
        }
    }
    Ok(records)
}

pub fn encode<T: Record>(record: &T) -> PortResult<serde_json::Value> {
    serde_json::to_value(record).map_err(|e| {
        PortError::Unexpected(format!("failed to encode {} record: {}", T::STORE, e))
    })
}

pub async fn put_record<T: Record>(store: &dyn DocumentStore, record: &T) -> PortResult<()> {
    let value = encode(record)?;
    store.put(T::STORE, record.id(), value).await
}

pub async fn bulk_put_records<T: Record>(store: &dyn DocumentStore, records: &[T]) -> PortResult<()> {
    let items = records
        .iter()
        .map(|r| Ok((r.id().to_string(), encode(r)?)))
        .collect::<PortResult<Vec<_>>>()?;
    store.bulk_put(T::STORE, items).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionType;
    use crate::testing::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        let row = ApiUsage {
            id: ActionType::CreateStory,
            count: 1,
            last_reset: "2024-05-01".to_string(),
        };

        put_record(&store, &row).await.unwrap();
        put_record(&store, &row).await.unwrap();

        let rows: Vec<ApiUsage> = load_all(&store).await.unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupted_rows() {
        let store = MemoryStore::new();
        store
            .put(StoreName::Settings, "ok", json!({"id": "ok", "value": 1}))
            .await
            .unwrap();
        store
            .put(StoreName::Settings, "broken", json!({"value": 1}))
            .await
            .unwrap();

        let rows: Vec<AppSetting> = load_all(&store).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "ok");
    }

    #[tokio::test]
    async fn test_bulk_put_records_upserts() {
        let store = MemoryStore::new();
        let a = AppSetting { id: "a".into(), value: json!(1) };
        let b = AppSetting { id: "b".into(), value: json!(2) };
        bulk_put_records(&store, &[a.clone(), b]).await.unwrap();
        bulk_put_records(&store, &[AppSetting { id: "a".into(), value: json!(3) }])
            .await
            .unwrap();

        let mut rows: Vec<AppSetting> = load_all(&store).await.unwrap();
        rows.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, json!(3));
    }
}
