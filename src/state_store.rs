use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::Collection;

use crate::domain::MirrorState;

const STATE_DOC_ID: &str = "state";

/// Durable persistence of the engine's `MirrorState`. The state store is
/// expected to be available; failures are logged and surfaced but never
/// abort the engine — the in-memory state remains authoritative until the
/// next successful save.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<MirrorState>;
    async fn save(&self, state: &MirrorState) -> anyhow::Result<()>;
}

/// Serialized shape of the single `_id: "state"` document.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StateDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    state: MirrorState,
}

pub struct MongoStateStore {
    collection: Collection<StateDocument>,
}

impl MongoStateStore {
    pub async fn connect(uri: &str, db_name: &str, collection_name: &str) -> anyhow::Result<Self> {
        let client = mongodb::Client::with_uri_str(uri).await?;
        let collection = client.database(db_name).collection(collection_name);
        Ok(Self { collection })
    }
}

#[async_trait]
impl StateStore for MongoStateStore {
    async fn load(&self) -> anyhow::Result<MirrorState> {
        let found = self
            .collection
            .find_one(doc! { "_id": STATE_DOC_ID }, None)
            .await?;
        Ok(found.map(|d| d.state).unwrap_or_default())
    }

    async fn save(&self, state: &MirrorState) -> anyhow::Result<()> {
        let doc = StateDocument {
            id: STATE_DOC_ID.to_string(),
            state: state.clone(),
        };
        self.collection
            .replace_one(
                doc! { "_id": STATE_DOC_ID },
                &doc,
                mongodb::options::ReplaceOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }
}

/// In-memory test double, e.g. for `SyncEngine` integration tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: tokio::sync::Mutex<MirrorState>,
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> anyhow::Result<MirrorState> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, state: &MirrorState) -> anyhow::Result<()> {
        *self.inner.lock().await = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_in_memory_store() {
        let store = InMemoryStateStore::default();
        let mut state = MirrorState::new();
        state.copied_trades.insert("BTC-USDT".to_string());

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.copied_trades, state.copied_trades);
    }

    #[tokio::test]
    async fn load_on_empty_store_returns_default() {
        let store = InMemoryStateStore::default();
        let loaded = store.load().await.unwrap();
        assert!(loaded.last_positions.is_empty());
    }
}
