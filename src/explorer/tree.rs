//! Pull-based, lazily expanded view over all inspectors.
//!
//! [`NodeTree`] never talks to a database itself except through
//! [`TopologyInspector::inspect`] when a root is requested before its
//! connection was inspected. Everything below a root is built from the cached
//! topology.

use futures::future::join_all;
use mongodb::bson::Bson;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use super::client::ClientFactory;
use super::display::DisplayHint;
use super::events::{ExplorerEvent, ExplorerEvents};
use super::inspector::{CommandInvocation, CommandOutcome, TopologyInspector};
use super::topology::{CommandKind, GroupKind, NodeKind, TopologyNode};
use super::validate::{parse_document, validate_collection, validate_database};
use crate::config::ExplorerOptions;
use crate::connection::{Connection, validate_uri};
use crate::error::{ExplorerError, ExplorerResult};

/// Default action when an item is activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Refresh,
    OpenDocument,
}

#[derive(Clone)]
enum ItemContent {
    Inspector,
    Node(TopologyNode),
}

/// One rendered tree entry
#[derive(Clone, Serialize)]
pub struct TreeItem {
    /// Labels from the root down to this item
    pub path: Vec<String>,
    pub label: String,
    /// Context value: the node kind string
    pub kind: String,
    pub collapsible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tooltip: String,
    pub hint: DisplayHint,
    pub commands: Vec<CommandKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<Activation>,
    #[serde(skip)]
    inspector: Arc<TopologyInspector>,
    #[serde(skip)]
    content: ItemContent,
}

impl std::fmt::Debug for TreeItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeItem")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl TreeItem {
    fn root(inspector: Arc<TopologyInspector>) -> Self {
        let label = inspector.name().to_string();
        Self {
            path: vec![label.clone()],
            tooltip: label.clone(),
            label,
            kind: NodeKind::Inspector.as_str().to_string(),
            collapsible: true,
            description: None,
            hint: DisplayHint::for_inspector(inspector.is_connected()),
            commands: vec![CommandKind::CreateDatabase],
            activation: Some(Activation::Refresh),
            inspector,
            content: ItemContent::Inspector,
        }
    }

    fn category(parent: &Self, node: TopologyNode, description: Option<String>) -> Self {
        let mut item = Self::from_node(parent, node);
        item.description = description;
        item
    }

    fn from_node(parent: &Self, node: TopologyNode) -> Self {
        let mut path = parent.path.clone();
        path.push(node.name.clone());

        let collapsible = matches!(
            node.kind,
            NodeKind::Database | NodeKind::Collection | NodeKind::Group(_)
        );
        let description = match node.kind {
            NodeKind::Group(_) | NodeKind::Collection => node
                .meta
                .count
                .filter(|count| *count > 0)
                .map(|count| format!("({count})")),
            _ => None,
        };
        let tooltip = match (&node.kind, &node.meta.detail) {
            (NodeKind::Document, Some(detail)) => {
                serde_json::to_string_pretty(&Bson::Document(detail.clone()).into_relaxed_extjson())
                    .unwrap_or_else(|_| node.name.clone())
            }
            _ => node.name.clone(),
        };
        let activation = (node.kind == NodeKind::Document).then_some(Activation::OpenDocument);

        Self {
            path,
            label: node.name.clone(),
            kind: node.kind.as_str().to_string(),
            collapsible,
            description,
            tooltip,
            hint: DisplayHint::for_kind(&node.kind),
            commands: node.commands.iter().copied().collect(),
            activation,
            inspector: parent.inspector.clone(),
            content: ItemContent::Node(node),
        }
    }

    pub fn connection(&self) -> &Connection {
        self.inspector.connection()
    }

    pub fn supports(&self, command: CommandKind) -> bool {
        self.commands.contains(&command)
    }

    /// The topology node behind this item, absent for inspector roots
    pub fn node(&self) -> Option<&TopologyNode> {
        match &self.content {
            ItemContent::Inspector => None,
            ItemContent::Node(node) => Some(node),
        }
    }
}

/// A node-bound command as requested by the user, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    CreateDatabase {
        name: String,
        first_collection: String,
    },
    DropDatabase,
    CreateCollection {
        name: String,
    },
    DropCollection,
    InsertDocument {
        json: String,
    },
    DeleteDocument,
    FindOne,
}

impl CommandRequest {
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::CreateDatabase { .. } => CommandKind::CreateDatabase,
            Self::DropDatabase => CommandKind::DropDatabase,
            Self::CreateCollection { .. } => CommandKind::CreateCollection,
            Self::DropCollection => CommandKind::DropCollection,
            Self::InsertDocument { .. } => CommandKind::InsertOne,
            Self::DeleteDocument => CommandKind::DeleteOne,
            Self::FindOne => CommandKind::FindOne,
        }
    }
}

fn require<'a, T>(value: Option<&'a T>, what: &str, item: &TreeItem) -> ExplorerResult<&'a T> {
    value.ok_or_else(|| ExplorerError::NotFound(format!("'{}' has no {what}", item.label)))
}

pub struct NodeTree {
    factory: Arc<dyn ClientFactory>,
    options: RwLock<ExplorerOptions>,
    events: ExplorerEvents,
    inspectors: tokio::sync::RwLock<Vec<Arc<TopologyInspector>>>,
}

impl NodeTree {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        options: ExplorerOptions,
        events: ExplorerEvents,
    ) -> Self {
        Self {
            factory,
            options: RwLock::new(options),
            events,
            inspectors: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExplorerEvent> {
        self.events.subscribe()
    }

    pub const fn events(&self) -> &ExplorerEvents {
        &self.events
    }

    /// Applies to inspectors created from now on
    pub fn set_options(&self, options: ExplorerOptions) {
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;
    }

    pub async fn inspectors(&self) -> Vec<Arc<TopologyInspector>> {
        self.inspectors.read().await.clone()
    }

    /// Destroy every inspector and create fresh ones for `connections`.
    /// Connections with an invalid URI are reported and get no inspector.
    pub async fn set_connections(&self, connections: &[Connection]) {
        let mut inspectors = self.inspectors.write().await;
        for inspector in inspectors.drain(..) {
            inspector.destroy().await;
        }

        let options = self
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for connection in connections {
            if validate_uri(&connection.uri).is_err() {
                self.events.error(format!(
                    "MongoDB Connection '{}' has an invalid URI.",
                    connection.name
                ));
                continue;
            }
            inspectors.push(Arc::new(TopologyInspector::new(
                connection.clone(),
                self.factory.create(connection),
                options.clone(),
                self.events.clone(),
            )));
        }
        tracing::debug!("Tree now has {} inspectors", inspectors.len());
        drop(inspectors);

        self.events.tree_changed(None);
    }

    /// One root per inspector, inspecting connections that have no cached
    /// tree yet. Failed inspections still yield a root with no children.
    pub async fn roots(&self) -> Vec<TreeItem> {
        let inspectors = self.inspectors().await;
        join_all(
            inspectors
                .iter()
                .filter(|inspector| !inspector.is_inspected())
                .map(|inspector| inspector.inspect()),
        )
        .await;

        inspectors.into_iter().map(TreeItem::root).collect()
    }

    /// The next level below `item`, built from the cached topology only
    pub fn children_of(&self, item: &TreeItem) -> Vec<TreeItem> {
        match &item.content {
            ItemContent::Inspector => {
                let Some(tree) = item.inspector.tree() else {
                    return Vec::new();
                };
                let databases =
                    TopologyNode::group("databases", GroupKind::Databases, tree.databases.clone())
                        .with_commands([CommandKind::CreateDatabase]);
                let count = format!("({})", tree.database_count());
                let roles = TopologyNode::group("roles", GroupKind::Roles, tree.roles.clone());
                let users = TopologyNode::group("users", GroupKind::Users, tree.users.clone());
                vec![
                    TreeItem::category(item, databases, Some(count)),
                    TreeItem::category(item, roles, None),
                    TreeItem::category(item, users, None),
                ]
            }
            ItemContent::Node(node) => match node.kind {
                NodeKind::Database | NodeKind::Collection | NodeKind::Group(_) => node
                    .children
                    .iter()
                    .map(|child| TreeItem::from_node(item, child.clone()))
                    .collect(),
                NodeKind::Index
                | NodeKind::Document
                | NodeKind::Inspector
                | NodeKind::Generic(_) => Vec::new(),
            },
        }
    }

    /// Find the item at a label path, e.g. `["A", "databases", "app", "users"]`
    pub async fn resolve(&self, path: &[String]) -> ExplorerResult<TreeItem> {
        let not_found =
            || ExplorerError::NotFound(format!("No tree item at '{}'", path.join(" / ")));

        let (root_label, rest) = path.split_first().ok_or_else(not_found)?;
        let mut item = self
            .roots()
            .await
            .into_iter()
            .find(|root| &root.label == root_label)
            .ok_or_else(not_found)?;

        for label in rest {
            item = self
                .children_of(&item)
                .into_iter()
                .find(|child| &child.label == label)
                .ok_or_else(not_found)?;
        }
        Ok(item)
    }

    /// Re-inspect one connection, or reset and re-inspect all of them
    pub async fn refresh(&self, connection: Option<&str>) -> ExplorerResult<()> {
        match connection {
            Some(name) => {
                let inspector = self
                    .inspectors()
                    .await
                    .into_iter()
                    .find(|inspector| inspector.name() == name)
                    .ok_or_else(|| {
                        ExplorerError::NotFound(format!("Unknown connection '{name}'"))
                    })?;
                let result = inspector.reinspect().await;
                self.events.tree_changed(Some(name));
                result.map(|_| ())
            }
            None => {
                let inspectors = self.inspectors().await;
                for inspector in &inspectors {
                    inspector.reset_inspection();
                }
                join_all(inspectors.iter().map(|inspector| inspector.inspect())).await;
                self.events.tree_changed(None);
                Ok(())
            }
        }
    }

    /// Drop all cached trees without disconnecting
    pub async fn reset_inspections(&self) {
        for inspector in self.inspectors().await {
            inspector.reset_inspection();
        }
        self.events.tree_changed(None);
    }

    /// Validate and run a command bound to `item`. The outcome is also
    /// reported as a notice.
    pub async fn execute(
        &self,
        item: &TreeItem,
        request: CommandRequest,
    ) -> ExplorerResult<CommandOutcome> {
        let result = match self.invocation(item, request) {
            Ok(invocation) => item.inspector.execute(invocation).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(CommandOutcome::Applied { message, .. }) => self.events.info(message.clone()),
            Ok(CommandOutcome::Found(_)) => {}
            Err(e) => self.events.error(e.to_string()),
        }
        result
    }

    fn invocation(
        &self,
        item: &TreeItem,
        request: CommandRequest,
    ) -> ExplorerResult<CommandInvocation> {
        let kind = request.kind();
        if !item.supports(kind) {
            return Err(ExplorerError::Unsupported {
                node: item.label.clone(),
                command: kind.as_str().to_string(),
            });
        }

        let meta = item.node().map(|node| &node.meta);
        let database =
            || require(meta.and_then(|m| m.database.as_ref()), "database", item).cloned();
        let collection =
            || require(meta.and_then(|m| m.collection.as_ref()), "collection", item).cloned();
        let document_id =
            || require(meta.and_then(|m| m.document_id.as_ref()), "document id", item).cloned();

        let invocation = match request {
            CommandRequest::CreateDatabase {
                name,
                first_collection,
            } => {
                let tree = item.inspector.tree();
                let existing: Vec<&str> = tree
                    .as_deref()
                    .map(|t| t.all_databases().map(|db| db.name.as_str()).collect())
                    .unwrap_or_default();
                validate_database(&name, existing)?;
                validate_collection(&first_collection, [])?;
                CommandInvocation::CreateDatabase {
                    database: name,
                    first_collection,
                }
            }
            CommandRequest::DropDatabase => CommandInvocation::DropDatabase {
                database: database()?,
            },
            CommandRequest::CreateCollection { name } => {
                let existing = item
                    .node()
                    .map(|node| node.children.iter().map(|c| c.name.as_str()).collect::<Vec<_>>())
                    .unwrap_or_default();
                validate_collection(&name, existing)?;
                CommandInvocation::CreateCollection {
                    database: database()?,
                    name,
                }
            }
            CommandRequest::DropCollection => CommandInvocation::DropCollection {
                database: database()?,
                collection: collection()?,
            },
            CommandRequest::InsertDocument { json } => CommandInvocation::InsertOne {
                document: parse_document(&json)?,
                database: database()?,
                collection: collection()?,
            },
            CommandRequest::DeleteDocument => CommandInvocation::DeleteOne {
                database: database()?,
                collection: collection()?,
                id: document_id()?,
            },
            CommandRequest::FindOne => CommandInvocation::FindOne {
                database: database()?,
                collection: collection()?,
                id: document_id()?,
            },
        };
        Ok(invocation)
    }

    /// Destroy all inspectors; used on teardown
    pub async fn destroy_all(&self) {
        let mut inspectors = self.inspectors.write().await;
        for inspector in inspectors.drain(..) {
            inspector.destroy().await;
        }
    }
}
