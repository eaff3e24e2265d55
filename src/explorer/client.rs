//! Database client abstraction and its MongoDB implementation.
//!
//! Every inspector owns one client exclusively. The trait exposes the
//! capabilities the explorer needs; raw topology is assembled from them by
//! [`fetch_raw_topology`].

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    Client,
    bson::{Bson, Document, doc},
    options::ClientOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::topology::{RawNode, RawTopology};
use crate::connection::Connection;

/// An index as listed by the server
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub name: String,
    pub keys: Document,
}

#[async_trait]
pub trait DbClient: Send + Sync {
    /// Connect, verifying the server answers. A no-op when already connected.
    async fn connect(&self) -> Result<()>;

    async fn close(&self);

    fn is_connected(&self) -> bool;

    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn list_collections(&self, database: &str) -> Result<Vec<String>>;

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexEntry>>;

    /// Up to `limit` documents in ascending `_id` order
    async fn find(&self, database: &str, collection: &str, limit: usize) -> Result<Vec<Document>>;

    async fn find_one(&self, database: &str, collection: &str, id: &Bson)
    -> Result<Option<Document>>;

    async fn count_documents(&self, database: &str, collection: &str) -> Result<u64>;

    /// Returns the inserted `_id`
    async fn insert_one(&self, database: &str, collection: &str, document: Document)
    -> Result<Bson>;

    /// Returns the number of deleted documents
    async fn delete_one(&self, database: &str, collection: &str, id: &Bson) -> Result<u64>;

    async fn create_collection(&self, database: &str, name: &str) -> Result<()>;

    async fn drop_database(&self, database: &str) -> Result<()>;

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<()>;

    async fn list_roles(&self) -> Result<Vec<Document>>;

    async fn list_users(&self) -> Result<Vec<Document>>;
}

/// Creates one client per connection
pub trait ClientFactory: Send + Sync {
    fn create(&self, connection: &Connection) -> Arc<dyn DbClient>;
}

/// Fetch databases (with collections and indexes), roles and users.
///
/// Failing to list databases fails the whole fetch. A database whose
/// collections cannot be listed, or a collection whose indexes cannot be
/// listed, is logged and left out. Roles and users need privileges the
/// connection may not have, so failures there yield empty lists.
pub async fn fetch_raw_topology(client: &dyn DbClient) -> Result<RawTopology> {
    let database_names = client
        .list_databases()
        .await
        .context("Failed to list databases")?;

    let mut databases = Vec::with_capacity(database_names.len());
    for db_name in database_names {
        let collection_names = match client.list_collections(&db_name).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("Skipping database '{}': {:#}", db_name, e);
                continue;
            }
        };

        let mut collections = Vec::with_capacity(collection_names.len());
        for coll_name in collection_names {
            match client.list_indexes(&db_name, &coll_name).await {
                Ok(indexes) => {
                    let indexes = indexes
                        .into_iter()
                        .map(|idx| RawNode::index(&db_name, idx.name, idx.keys))
                        .collect();
                    collections.push(RawNode::collection(&db_name, coll_name, indexes));
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping collection '{}.{}': {:#}",
                        db_name,
                        coll_name,
                        e
                    );
                }
            }
        }
        databases.push(RawNode::database(db_name, collections));
    }

    let roles = match client.list_roles().await {
        Ok(roles) => detail_nodes(roles, "role", "role"),
        Err(e) => {
            tracing::debug!("Roles not available: {:#}", e);
            Vec::new()
        }
    };
    let users = match client.list_users().await {
        Ok(users) => detail_nodes(users, "user", "user"),
        Err(e) => {
            tracing::debug!("Users not available: {:#}", e);
            Vec::new()
        }
    };

    Ok(RawTopology {
        databases,
        roles,
        users,
    })
}

fn detail_nodes(documents: Vec<Document>, name_field: &str, kind: &str) -> Vec<RawNode> {
    documents
        .into_iter()
        .map(|detail| {
            let name = detail.get_str(name_field).unwrap_or("<unnamed>").to_string();
            let database = detail.get_str("db").ok().map(str::to_string);
            RawNode {
                database,
                detail: Some(detail),
                ..RawNode::new(name, kind)
            }
        })
        .collect()
}

/// Client for a `mongodb://` connection using the mongodb driver.
pub struct MongoDbClient {
    connection: Connection,
    client: RwLock<Option<Client>>,
    connected: AtomicBool,
}

impl MongoDbClient {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("Connection '{}' is not open", self.connection.name))
    }

    async fn collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<mongodb::Collection<Document>> {
        Ok(self.client().await?.database(database).collection(collection))
    }
}

#[async_trait]
impl DbClient for MongoDbClient {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        tracing::info!("Connecting to MongoDB '{}'", self.connection.name);

        let mut client_options = ClientOptions::parse(self.connection.uri.as_str())
            .await
            .context("Failed to parse MongoDB connection URL")?;

        // Set reasonable defaults
        client_options.connect_timeout = Some(Duration::from_secs(10));
        client_options.server_selection_timeout = Some(Duration::from_secs(10));
        client_options.app_name = Some(env!("CARGO_PKG_NAME").to_string());

        let client =
            Client::with_options(client_options).context("Failed to create MongoDB client")?;

        // The driver connects lazily; a ping surfaces unreachable servers now
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB did not answer ping")?;

        *slot = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        let client = self.client.write().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(client) = client {
            client.shutdown().await;
            tracing::debug!("Closed MongoDB connection '{}'", self.connection.name);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let client = self.client().await?;
        let databases = client
            .list_databases()
            .await
            .context("Failed to list databases")?;
        Ok(databases.into_iter().map(|db| db.name).collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>> {
        let db = self.client().await?.database(database);

        let mut collections = db
            .list_collection_names()
            .await
            .context("Failed to list collections")?;

        // Sort for deterministic output
        collections.sort();

        Ok(collections)
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexEntry>> {
        let coll = self.collection(database, collection).await?;
        let models: Vec<mongodb::IndexModel> = coll
            .list_indexes()
            .await
            .context("Failed to list indexes")?
            .try_collect()
            .await
            .context("Failed to collect indexes")?;

        Ok(models
            .into_iter()
            .map(|model| IndexEntry {
                name: model
                    .options
                    .and_then(|o| o.name)
                    .unwrap_or_else(|| "<unnamed>".to_string()),
                keys: model.keys,
            })
            .collect())
    }

    async fn find(&self, database: &str, collection: &str, limit: usize) -> Result<Vec<Document>> {
        // The server reads a zero limit as unlimited
        if limit == 0 {
            return Ok(Vec::new());
        }
        let coll = self.collection(database, collection).await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let cursor = coll
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .limit(limit)
            .await
            .context("Find query failed")?;
        cursor
            .try_collect()
            .await
            .context("Failed to collect find results")
    }

    async fn find_one(
        &self,
        database: &str,
        collection: &str,
        id: &Bson,
    ) -> Result<Option<Document>> {
        let coll = self.collection(database, collection).await?;
        coll.find_one(doc! { "_id": id.clone() })
            .await
            .context("FindOne query failed")
    }

    async fn count_documents(&self, database: &str, collection: &str) -> Result<u64> {
        let coll = self.collection(database, collection).await?;
        coll.count_documents(doc! {})
            .await
            .context("CountDocuments query failed")
    }

    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: Document,
    ) -> Result<Bson> {
        let coll = self.collection(database, collection).await?;
        let result = coll.insert_one(document).await.context("InsertOne failed")?;
        Ok(result.inserted_id)
    }

    async fn delete_one(&self, database: &str, collection: &str, id: &Bson) -> Result<u64> {
        let coll = self.collection(database, collection).await?;
        let result = coll
            .delete_one(doc! { "_id": id.clone() })
            .await
            .context("DeleteOne failed")?;
        Ok(result.deleted_count)
    }

    async fn create_collection(&self, database: &str, name: &str) -> Result<()> {
        self.client()
            .await?
            .database(database)
            .create_collection(name)
            .await
            .context("CreateCollection failed")
    }

    async fn drop_database(&self, database: &str) -> Result<()> {
        self.client()
            .await?
            .database(database)
            .drop()
            .await
            .context("DropDatabase failed")
    }

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.collection(database, collection)
            .await?
            .drop()
            .await
            .context("DropCollection failed")
    }

    async fn list_roles(&self) -> Result<Vec<Document>> {
        let reply = self
            .client()
            .await?
            .database("admin")
            .run_command(doc! { "rolesInfo": 1, "showPrivileges": false })
            .await
            .context("rolesInfo failed")?;
        documents_in(&reply, "roles")
    }

    async fn list_users(&self) -> Result<Vec<Document>> {
        let reply = self
            .client()
            .await?
            .database("admin")
            .run_command(doc! { "usersInfo": { "forAllDBs": true } })
            .await
            .context("usersInfo failed")?;
        documents_in(&reply, "users")
    }
}

fn documents_in(reply: &Document, field: &str) -> Result<Vec<Document>> {
    let array = reply
        .get_array(field)
        .with_context(|| format!("Reply has no '{field}' array"))?;
    Ok(array
        .iter()
        .filter_map(|value| value.as_document().cloned())
        .collect())
}

/// Creates [`MongoDbClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoClientFactory;

impl ClientFactory for MongoClientFactory {
    fn create(&self, connection: &Connection) -> Arc<dyn DbClient> {
        Arc::new(MongoDbClient::new(connection.clone()))
    }
}
