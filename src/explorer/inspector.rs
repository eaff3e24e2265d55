//! Per-connection inspection session.
//!
//! A [`TopologyInspector`] owns one client, keeps the last normalized
//! [`Topology`] and runs commands against the connection. At most one
//! inspection runs at a time; callers that queue behind a running inspection
//! get its result instead of starting another one. Mutations resolve only after
//! the follow-up re-inspection finished.

use anyhow::anyhow;
use mongodb::bson::{Bson, Document};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::client::{DbClient, fetch_raw_topology};
use super::events::ExplorerEvents;
use super::normalize::Normalizer;
use super::topology::{CommandKind, Topology, id_label};
use crate::config::ExplorerOptions;
use crate::connection::Connection;
use crate::error::{ExplorerError, ExplorerResult};

/// A command with its resolved arguments
#[derive(Debug, Clone, PartialEq)]
pub enum CommandInvocation {
    CreateDatabase {
        database: String,
        first_collection: String,
    },
    DropDatabase {
        database: String,
    },
    CreateCollection {
        database: String,
        name: String,
    },
    DropCollection {
        database: String,
        collection: String,
    },
    InsertOne {
        database: String,
        collection: String,
        document: Document,
    },
    DeleteOne {
        database: String,
        collection: String,
        id: Bson,
    },
    FindOne {
        database: String,
        collection: String,
        id: Bson,
    },
}

impl CommandInvocation {
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::CreateDatabase { .. } => CommandKind::CreateDatabase,
            Self::DropDatabase { .. } => CommandKind::DropDatabase,
            Self::CreateCollection { .. } => CommandKind::CreateCollection,
            Self::DropCollection { .. } => CommandKind::DropCollection,
            Self::InsertOne { .. } => CommandKind::InsertOne,
            Self::DeleteOne { .. } => CommandKind::DeleteOne,
            Self::FindOne { .. } => CommandKind::FindOne,
        }
    }

    /// Action phrase for failure messages ("Could not <action> on ...")
    fn action(&self) -> String {
        match self {
            Self::CreateDatabase { database, .. } => format!("create the database '{database}'"),
            Self::DropDatabase { database } => format!("drop the database '{database}'"),
            Self::CreateCollection { name, .. } => format!("create collection '{name}'"),
            Self::DropCollection { collection, .. } => {
                format!("drop the collection '{collection}'")
            }
            Self::InsertOne { collection, .. } => {
                format!("insert the document into '{collection}'")
            }
            Self::DeleteOne { collection, .. } => {
                format!("delete the document from '{collection}'")
            }
            Self::FindOne { collection, .. } => format!("open the document in '{collection}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// A write succeeded. `tree` is the re-inspected topology, absent if the
    /// re-inspection itself failed.
    Applied {
        message: String,
        tree: Option<Arc<Topology>>,
    },
    Found(Option<Document>),
}

pub struct TopologyInspector {
    connection: Connection,
    client: Arc<dyn DbClient>,
    options: ExplorerOptions,
    events: ExplorerEvents,
    tree: RwLock<Option<Arc<Topology>>>,
    inspection: tokio::sync::Mutex<()>,
    /// Bumped whenever an inspection settles, successful or not
    generation: AtomicU64,
    /// Outcome of the most recently settled inspection, handed to joiners
    last_outcome: Mutex<Option<Result<Arc<Topology>, String>>>,
    destroyed: AtomicBool,
}

impl TopologyInspector {
    pub fn new(
        connection: Connection,
        client: Arc<dyn DbClient>,
        options: ExplorerOptions,
        events: ExplorerEvents,
    ) -> Self {
        Self {
            connection,
            client,
            options,
            events,
            tree: RwLock::new(None),
            inspection: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.connection.name
    }

    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn is_inspected(&self) -> bool {
        self.tree().is_some()
    }

    /// The cached topology. A new inspection replaces it with a new `Arc`;
    /// previously returned trees are never modified.
    pub fn tree(&self) -> Option<Arc<Topology>> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, tree: Option<Arc<Topology>>) {
        *self.tree.write().unwrap_or_else(PoisonError::into_inner) = tree;
    }

    /// Connect if needed, fetch and normalize the topology, and cache it.
    ///
    /// A call that has to wait for a running inspection returns that one's
    /// outcome. Failures are reported as error notices and leave the cache as
    /// it was.
    pub async fn inspect(&self) -> ExplorerResult<Arc<Topology>> {
        let seen = self.generation.load(Ordering::SeqCst);
        let _guard = self.inspection.lock().await;

        if self.generation.load(Ordering::SeqCst) != seen {
            debug!("Joined inspection of '{}'", self.name());
            let outcome = self
                .last_outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match outcome {
                Some(Ok(topology)) => return Ok(topology),
                Some(Err(cause)) => {
                    return Err(ExplorerError::connection(self.name(), anyhow!(cause)));
                }
                None => {}
            }
        }

        self.run_inspection().await
    }

    /// Always fetch anew, after any running inspection settled
    pub async fn reinspect(&self) -> ExplorerResult<Arc<Topology>> {
        let _guard = self.inspection.lock().await;
        self.run_inspection().await
    }

    async fn run_inspection(&self) -> ExplorerResult<Arc<Topology>> {
        let result = self.fetch_and_normalize().await;
        let outcome = match &result {
            Ok(topology) => Ok(topology.clone()),
            Err(e) => Err(e.detailed()),
        };
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.generation.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(topology) => {
                if self.destroyed.load(Ordering::SeqCst) {
                    debug!("Dropping inspection result of destroyed '{}'", self.name());
                    return Ok(topology);
                }
                info!(
                    "Inspected '{}': {} databases",
                    self.name(),
                    topology.database_count()
                );
                self.store(Some(topology.clone()));
                Ok(topology)
            }
            Err(e) => {
                warn!("{}", e.detailed());
                self.events.error(e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch_and_normalize(&self) -> ExplorerResult<Arc<Topology>> {
        if !self.client.is_connected() {
            debug!("Connecting inspector '{}'", self.name());
            self.client
                .connect()
                .await
                .map_err(|e| ExplorerError::connection(self.name(), e))?;
        }

        let raw = fetch_raw_topology(self.client.as_ref())
            .await
            .map_err(|e| ExplorerError::fetch(self.name(), "databases", e))?;

        let normalizer = Normalizer::new(
            self.client.clone(),
            self.connection.clone(),
            self.options.clone(),
        );
        Ok(Arc::new(normalizer.normalize(raw).await))
    }

    /// Forget the cached tree so the next inspection rebuilds it. Does not
    /// disconnect and does not abort a running inspection.
    pub fn reset_inspection(&self) {
        self.store(None);
    }

    /// Disconnect and forget the cached tree
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.client.close().await;
        self.store(None);
        debug!("Destroyed inspector '{}'", self.name());
    }

    /// Run a command. Writes re-inspect the connection before returning and
    /// fire a tree change; a failed write leaves the cache untouched.
    pub async fn execute(&self, invocation: CommandInvocation) -> ExplorerResult<CommandOutcome> {
        let action = invocation.action();
        let fail = |e: anyhow::Error| ExplorerError::mutation(self.name(), action.clone(), e);

        if !self.client.is_connected() {
            self.client
                .connect()
                .await
                .map_err(|e| ExplorerError::connection(self.name(), e))?;
        }

        let message = match invocation {
            CommandInvocation::FindOne {
                database,
                collection,
                id,
            } => {
                let document = self
                    .client
                    .find_one(&database, &collection, &id)
                    .await
                    .map_err(fail)?;
                return Ok(CommandOutcome::Found(document));
            }
            CommandInvocation::CreateDatabase {
                database,
                first_collection,
            } => {
                self.client
                    .create_collection(&database, &first_collection)
                    .await
                    .map_err(fail)?;
                format!("Database '{database}' added")
            }
            CommandInvocation::DropDatabase { database } => {
                self.client.drop_database(&database).await.map_err(fail)?;
                format!("Dropped the database '{database}'")
            }
            CommandInvocation::CreateCollection { database, name } => {
                self.client
                    .create_collection(&database, &name)
                    .await
                    .map_err(fail)?;
                format!("Collection '{name}' added")
            }
            CommandInvocation::DropCollection {
                database,
                collection,
            } => {
                self.client
                    .drop_collection(&database, &collection)
                    .await
                    .map_err(fail)?;
                format!("Collection '{collection}' deleted")
            }
            CommandInvocation::InsertOne {
                database,
                collection,
                document,
            } => {
                let id = self
                    .client
                    .insert_one(&database, &collection, document)
                    .await
                    .map_err(fail)?;
                format!("Document '{}' added", id_label(&id))
            }
            CommandInvocation::DeleteOne {
                database,
                collection,
                id,
            } => {
                let deleted = self
                    .client
                    .delete_one(&database, &collection, &id)
                    .await
                    .map_err(fail)?;
                if deleted == 0 {
                    return Err(ExplorerError::NotFound(format!(
                        "Document '{}' not found in '{collection}'",
                        id_label(&id)
                    )));
                }
                format!("Document '{}' deleted", id_label(&id))
            }
        };

        info!("{} on '{}'", message, self.name());
        let tree = self.reinspect().await.ok();
        self.events.tree_changed(Some(self.name()));

        Ok(CommandOutcome::Applied { message, tree })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::events::{ExplorerEvent, Notice, drain};
    use crate::explorer::fake::FakeClient;
    use mongodb::bson::doc;
    use std::time::Duration;

    fn inspector(client: &FakeClient) -> (Arc<TopologyInspector>, ExplorerEvents) {
        let events = ExplorerEvents::new();
        let inspector = TopologyInspector::new(
            Connection::new("A", "mongodb://h/db"),
            Arc::new(client.clone()),
            ExplorerOptions::default(),
            events.clone(),
        );
        (Arc::new(inspector), events)
    }

    #[tokio::test]
    async fn test_inspect_connects_and_caches() {
        let client = FakeClient::new().with_database("admin").with_database("app");
        let (inspector, _) = inspector(&client);
        assert!(!inspector.is_inspected());
        assert!(!inspector.is_connected());

        let tree = inspector.inspect().await.unwrap();

        assert!(inspector.is_connected());
        assert!(Arc::ptr_eq(&tree, &inspector.tree().unwrap()));
        assert_eq!(client.connects(), 1);
    }

    #[tokio::test]
    async fn test_new_inspection_replaces_tree() {
        let client = FakeClient::new().with_database("app");
        let (inspector, _) = inspector(&client);

        let first = inspector.inspect().await.unwrap();
        let second = inspector.inspect().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
        assert_eq!(client.fetches(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_inspections_share_one_fetch() {
        let client = FakeClient::new()
            .with_collection("app", "items", 3)
            .with_latency(Duration::from_millis(20));
        let (inspector, _) = inspector(&client);

        let (a, b, c) = tokio::join!(inspector.inspect(), inspector.inspect(), inspector.inspect());

        assert_eq!(client.fetches(), 1);
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
    }

    #[tokio::test]
    async fn test_joined_inspection_survives_reset() {
        let client = FakeClient::new()
            .with_collection("app", "items", 3)
            .with_latency(Duration::from_millis(20));
        let (inspector, _) = inspector(&client);

        let (first, second) = tokio::join!(
            async {
                let result = inspector.inspect().await;
                inspector.reset_inspection();
                result
            },
            inspector.inspect()
        );

        let first = first.unwrap();
        let second = second.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.fetches(), 1);
    }

    #[tokio::test]
    async fn test_joined_inspection_shares_failure() {
        let client = FakeClient::new()
            .with_database("app")
            .unreachable()
            .with_latency(Duration::from_millis(20));
        let (inspector, _) = inspector(&client);

        let (first, second) = tokio::join!(inspector.inspect(), inspector.inspect());

        assert!(first.is_err());
        let second = second.unwrap_err();
        assert!(second.detailed().contains("connection refused"));
        assert_eq!(client.connects(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported_not_cached() {
        let client = FakeClient::new().with_database("app").unreachable();
        let (inspector, events) = inspector(&client);
        let mut rx = events.subscribe();

        let err = inspector.inspect().await.unwrap_err();

        assert_eq!(err.to_string(), "Failed to connect to MongoDB 'A'.");
        assert!(!inspector.is_inspected());
        assert_eq!(
            drain(&mut rx),
            vec![ExplorerEvent::Notice(Notice::Error(
                "Failed to connect to MongoDB 'A'.".to_string()
            ))]
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_tree() {
        let client = FakeClient::new().with_database("app");
        let (inspector, _) = inspector(&client);
        let before = inspector.inspect().await.unwrap();

        client.set_unreachable(true);
        assert!(inspector.inspect().await.is_err());

        assert!(Arc::ptr_eq(&before, &inspector.tree().unwrap()));
    }

    #[tokio::test]
    async fn test_reset_and_destroy() {
        let client = FakeClient::new().with_database("app");
        let (inspector, _) = inspector(&client);
        inspector.inspect().await.unwrap();

        inspector.reset_inspection();
        assert!(!inspector.is_inspected());
        assert!(inspector.is_connected());

        inspector.inspect().await.unwrap();
        inspector.destroy().await;
        assert!(!inspector.is_inspected());
        assert!(!inspector.is_connected());
        assert_eq!(client.closes(), 1);
    }

    #[tokio::test]
    async fn test_insert_resolves_after_reinspection() {
        let client = FakeClient::new().with_collection("app", "items", 2);
        let (inspector, events) = inspector(&client);
        inspector.inspect().await.unwrap();
        let mut rx = events.subscribe();

        let outcome = inspector
            .execute(CommandInvocation::InsertOne {
                database: "app".to_string(),
                collection: "items".to_string(),
                document: doc! { "_id": 3, "a": 1 },
            })
            .await
            .unwrap();

        let CommandOutcome::Applied { message, tree } = outcome else {
            panic!("insert must apply");
        };
        assert_eq!(message, "Document '3' added");
        let cached = inspector.tree().unwrap();
        assert!(Arc::ptr_eq(&tree.unwrap(), &cached));
        let items = cached.find_database("app").unwrap().child("items").unwrap();
        assert_eq!(items.meta.count, Some(3));
        assert_eq!(items.children.len(), 4);
        assert_eq!(
            drain(&mut rx),
            vec![ExplorerEvent::TreeChanged {
                connection: Some("A".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_cache() {
        let client = FakeClient::new()
            .with_collection("app", "items", 2)
            .failing_writes();
        let (inspector, _) = inspector(&client);
        let before = inspector.inspect().await.unwrap();

        let err = inspector
            .execute(CommandInvocation::DropCollection {
                database: "app".to_string(),
                collection: "items".to_string(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Could not drop the collection 'items' on 'A'.");
        assert!(Arc::ptr_eq(&before, &inspector.tree().unwrap()));
        assert_eq!(client.fetches(), 1);
    }

    #[tokio::test]
    async fn test_find_one_does_not_reinspect() {
        let client = FakeClient::new().with_collection("app", "items", 2);
        let (inspector, _) = inspector(&client);
        inspector.inspect().await.unwrap();

        let outcome = inspector
            .execute(CommandInvocation::FindOne {
                database: "app".to_string(),
                collection: "items".to_string(),
                id: Bson::Int32(2),
            })
            .await
            .unwrap();

        match outcome {
            CommandOutcome::Found(Some(document)) => assert_eq!(document.get_i32("n").unwrap(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(client.fetches(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_document() {
        let client = FakeClient::new().with_collection("app", "items", 1);
        let (inspector, _) = inspector(&client);

        let err = inspector
            .execute(CommandInvocation::DeleteOne {
                database: "app".to_string(),
                collection: "items".to_string(),
                id: Bson::Int32(99),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExplorerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_database_and_drop() {
        let client = FakeClient::new().with_database("admin");
        let (inspector, _) = inspector(&client);

        inspector
            .execute(CommandInvocation::CreateDatabase {
                database: "shop".to_string(),
                first_collection: "orders".to_string(),
            })
            .await
            .unwrap();
        let tree = inspector.tree().unwrap();
        assert!(tree.find_database("shop").unwrap().child("orders").is_some());

        inspector
            .execute(CommandInvocation::DropDatabase {
                database: "shop".to_string(),
            })
            .await
            .unwrap();
        assert!(inspector.tree().unwrap().find_database("shop").is_none());
    }
}
