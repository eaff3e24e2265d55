//! In-memory [`DbClient`] for tests.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use mongodb::bson::{Bson, Document, doc, oid::ObjectId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::client::{ClientFactory, DbClient, IndexEntry};
use super::topology::compare_ids;
use crate::connection::Connection;

#[derive(Debug, Default)]
struct FakeCollection {
    name: String,
    indexes: Vec<IndexEntry>,
    documents: Vec<Document>,
}

impl FakeCollection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indexes: vec![IndexEntry {
                name: "_id_".to_string(),
                keys: doc! { "_id": 1 },
            }],
            documents: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    databases: Vec<(String, Vec<FakeCollection>)>,
    roles: Vec<Document>,
    users: Vec<Document>,
    connected: bool,
    unreachable: bool,
    fail_writes: bool,
    reverse_results: bool,
    failing_indexes: Vec<String>,
    failing_find: Vec<String>,
    latency: Option<Duration>,
    connects: usize,
    closes: usize,
    fetches: usize,
}

impl FakeState {
    fn collection_mut(&mut self, database: &str, collection: &str) -> Option<&mut FakeCollection> {
        self.databases
            .iter_mut()
            .find(|(name, _)| name == database)
            .and_then(|(_, colls)| colls.iter_mut().find(|c| c.name == collection))
    }

    fn collection(&self, database: &str, collection: &str) -> Option<&FakeCollection> {
        self.databases
            .iter()
            .find(|(name, _)| name == database)
            .and_then(|(_, colls)| colls.iter().find(|c| c.name == collection))
    }

    fn ensure_collection(&mut self, database: &str, collection: &str) -> &mut FakeCollection {
        let index = match self.databases.iter().position(|(name, _)| name == database) {
            Some(index) => index,
            None => {
                self.databases.push((database.to_string(), Vec::new()));
                self.databases.len() - 1
            }
        };
        let colls = &mut self.databases[index].1;
        let position = match colls.iter().position(|c| c.name == collection) {
            Some(position) => position,
            None => {
                colls.push(FakeCollection::new(collection));
                colls.len() - 1
            }
        };
        &mut colls[position]
    }
}

/// Shared handle; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct FakeClient {
    state: Arc<Mutex<FakeState>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_database(self, database: &str) -> Self {
        {
            let mut state = self.state();
            if !state.databases.iter().any(|(name, _)| name == database) {
                state.databases.push((database.to_string(), Vec::new()));
            }
        }
        self
    }

    /// Collection with documents `_id: 1..=count`
    pub fn with_collection(self, database: &str, collection: &str, count: i32) -> Self {
        let documents = (1..=count).map(|i| doc! { "_id": i, "n": i }).collect();
        self.with_documents(database, collection, documents)
    }

    pub fn with_documents(
        self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Self {
        self.state()
            .ensure_collection(database, collection)
            .documents
            .extend(documents);
        self
    }

    pub fn with_role(self, role: &str) -> Self {
        self.state()
            .roles
            .push(doc! { "role": role, "db": "admin" });
        self
    }

    pub fn with_user(self, user: &str) -> Self {
        self.state()
            .users
            .push(doc! { "user": user, "db": "admin" });
        self
    }

    pub fn failing_indexes(self, collection: &str) -> Self {
        self.state().failing_indexes.push(collection.to_string());
        self
    }

    pub fn failing_find(self, collection: &str) -> Self {
        self.state().failing_find.push(collection.to_string());
        self
    }

    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    pub fn failing_writes(self) -> Self {
        self.state().fail_writes = true;
        self
    }

    /// Return find results in descending order
    pub fn reversed_results(self) -> Self {
        self.state().reverse_results = true;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// Number of `list_databases` calls, one per topology fetch
    pub fn fetches(&self) -> usize {
        self.state().fetches
    }

    pub fn document_count(&self, database: &str, collection: &str) -> usize {
        self.state()
            .collection(database, collection)
            .map_or(0, |c| c.documents.len())
    }

    async fn pause(&self) {
        let latency = self.state().latency;
        match latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn check_reachable(&self) -> Result<()> {
        let state = self.state();
        if state.unreachable {
            bail!("connection refused");
        }
        if !state.connected {
            bail!("not connected");
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_reachable()?;
        if self.state().fail_writes {
            bail!("not authorized");
        }
        Ok(())
    }
}

#[async_trait]
impl DbClient for FakeClient {
    async fn connect(&self) -> Result<()> {
        self.pause().await;
        let mut state = self.state();
        if state.unreachable {
            bail!("connection refused");
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        if state.connected {
            state.connected = false;
            state.closes += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.pause().await;
        self.check_reachable()?;
        let mut state = self.state();
        state.fetches += 1;
        Ok(state.databases.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>> {
        self.check_reachable()?;
        let state = self.state();
        let (_, colls) = state
            .databases
            .iter()
            .find(|(name, _)| name == database)
            .ok_or_else(|| anyhow!("no database {database}"))?;
        let mut names: Vec<_> = colls.iter().map(|c| c.name.clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexEntry>> {
        self.check_reachable()?;
        let state = self.state();
        if state.failing_indexes.iter().any(|c| c == collection) {
            bail!("listIndexes failed");
        }
        state
            .collection(database, collection)
            .map(|c| c.indexes.clone())
            .ok_or_else(|| anyhow!("no collection {database}.{collection}"))
    }

    async fn find(&self, database: &str, collection: &str, limit: usize) -> Result<Vec<Document>> {
        self.pause().await;
        self.check_reachable()?;
        let state = self.state();
        if state.failing_find.iter().any(|c| c == collection) {
            bail!("find failed");
        }
        let mut documents = state
            .collection(database, collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default();
        documents.sort_by(|a, b| {
            compare_ids(
                a.get("_id").unwrap_or(&Bson::Null),
                b.get("_id").unwrap_or(&Bson::Null),
            )
        });
        documents.truncate(limit);
        if state.reverse_results {
            documents.reverse();
        }
        Ok(documents)
    }

    async fn find_one(
        &self,
        database: &str,
        collection: &str,
        id: &Bson,
    ) -> Result<Option<Document>> {
        self.check_reachable()?;
        Ok(self.state().collection(database, collection).and_then(|c| {
            c.documents
                .iter()
                .find(|d| d.get("_id") == Some(id))
                .cloned()
        }))
    }

    async fn count_documents(&self, database: &str, collection: &str) -> Result<u64> {
        self.check_reachable()?;
        Ok(self
            .state()
            .collection(database, collection)
            .map_or(0, |c| c.documents.len() as u64))
    }

    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        mut document: Document,
    ) -> Result<Bson> {
        self.pause().await;
        self.check_write()?;
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert("_id", id.clone());
                id
            }
        };
        let mut state = self.state();
        let coll = state.ensure_collection(database, collection);
        if coll.documents.iter().any(|d| d.get("_id") == Some(&id)) {
            bail!("E11000 duplicate key error");
        }
        coll.documents.push(document);
        Ok(id)
    }

    async fn delete_one(&self, database: &str, collection: &str, id: &Bson) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state();
        let Some(coll) = state.collection_mut(database, collection) else {
            return Ok(0);
        };
        match coll.documents.iter().position(|d| d.get("_id") == Some(id)) {
            Some(position) => {
                coll.documents.remove(position);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn create_collection(&self, database: &str, name: &str) -> Result<()> {
        self.check_write()?;
        let mut state = self.state();
        if state.collection(database, name).is_some() {
            bail!("Collection {database}.{name} already exists");
        }
        state.ensure_collection(database, name);
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<()> {
        self.check_write()?;
        self.state().databases.retain(|(name, _)| name != database);
        Ok(())
    }

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.check_write()?;
        let mut state = self.state();
        if let Some((_, colls)) = state.databases.iter_mut().find(|(name, _)| name == database) {
            colls.retain(|c| c.name != collection);
        }
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<Document>> {
        self.check_reachable()?;
        Ok(self.state().roles.clone())
    }

    async fn list_users(&self) -> Result<Vec<Document>> {
        self.check_reachable()?;
        Ok(self.state().users.clone())
    }
}

/// Hands out registered fakes by connection name, or fresh empty ones
#[derive(Debug, Default)]
pub struct FakeClientFactory {
    clients: Mutex<HashMap<String, FakeClient>>,
    created: Mutex<usize>,
}

impl FakeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(self, connection: &str, client: FakeClient) -> Self {
        self.clients
            .lock()
            .unwrap()
            .insert(connection.to_string(), client);
        self
    }

    pub fn client(&self, connection: &str) -> Option<FakeClient> {
        self.clients.lock().unwrap().get(connection).cloned()
    }

    pub fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

impl ClientFactory for FakeClientFactory {
    fn create(&self, connection: &Connection) -> Arc<dyn DbClient> {
        *self.created.lock().unwrap() += 1;
        let client = self
            .clients
            .lock()
            .unwrap()
            .entry(connection.name.clone())
            .or_default()
            .clone();
        Arc::new(client)
    }
}
