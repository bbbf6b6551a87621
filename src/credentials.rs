use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::Collection;
use serde::{Deserialize, Serialize};

use crate::domain::Follower;

/// Master account credentials.
#[derive(Debug, Clone)]
pub struct MasterCredentials {
    pub api_key: String,
    pub secret_key: String,
}

/// Yields the master's and every follower's API credentials. Decryption at
/// rest, user auth, and credential CRUD live in the admin surface — this
/// trait is the only seam the engine needs into that system.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn master(&self) -> anyhow::Result<MasterCredentials>;
    async fn followers(&self) -> anyhow::Result<Vec<Follower>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientDoc {
    name: String,
    api_key: String,
    secret_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialsDocument {
    master: MasterDoc,
    clients: Vec<ClientDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MasterDoc {
    api_key: String,
    secret_key: String,
}

pub struct MongoCredentialStore {
    collection: Collection<CredentialsDocument>,
}

impl MongoCredentialStore {
    pub async fn connect(uri: &str, db_name: &str, collection_name: &str) -> anyhow::Result<Self> {
        let client = mongodb::Client::with_uri_str(uri).await?;
        let collection = client.database(db_name).collection(collection_name);
        Ok(Self { collection })
    }

    async fn doc(&self) -> anyhow::Result<CredentialsDocument> {
        self.collection
            .find_one(doc! {}, None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no credentials document found"))
    }
}

#[async_trait]
impl CredentialStore for MongoCredentialStore {
    async fn master(&self) -> anyhow::Result<MasterCredentials> {
        let doc = self.doc().await?;
        Ok(MasterCredentials {
            api_key: doc.master.api_key,
            secret_key: doc.master.secret_key,
        })
    }

    async fn followers(&self) -> anyhow::Result<Vec<Follower>> {
        let doc = self.doc().await?;
        Ok(doc
            .clients
            .into_iter()
            .enumerate()
            .map(|(i, c)| Follower {
                id: i.to_string(),
                display_name: c.name,
                api_key: c.api_key,
                secret_key: c.secret_key,
            })
            .collect())
    }
}

/// In-memory test double.
pub struct StaticCredentialStore {
    pub master: MasterCredentials,
    pub followers: Vec<Follower>,
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn master(&self) -> anyhow::Result<MasterCredentials> {
        Ok(self.master.clone())
    }

    async fn followers(&self) -> anyhow::Result<Vec<Follower>> {
        Ok(self.followers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_store_returns_configured_followers() {
        let store = StaticCredentialStore {
            master: MasterCredentials { api_key: "mk".into(), secret_key: "ms".into() },
            followers: vec![Follower {
                id: "1".into(),
                display_name: "alice".into(),
                api_key: "ak".into(),
                secret_key: "as".into(),
            }],
        };

        let followers = store.followers().await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].display_name, "alice");
    }
}
