//! Turns raw topology into the grouped, capped node tree.
//!
//! System databases are pulled into one `System` group placed first. Each
//! collection gets an `Indexes` group followed by up to `sample_size` sample
//! documents in ascending `_id` order. Normalizing the same raw topology twice
//! yields equal trees.

use futures::future::{BoxFuture, FutureExt};
use mongodb::bson::{Bson, Document};
use std::sync::Arc;

use super::client::DbClient;
use super::topology::{
    CommandKind, GroupKind, NodeKind, NodeMeta, RawNode, RawTopology, Topology, TopologyNode,
    compare_ids, id_label,
};
use crate::config::ExplorerOptions;
use crate::connection::Connection;

pub const SYSTEM_GROUP_NAME: &str = "System";
pub const INDEX_GROUP_NAME: &str = "Indexes";

pub struct Normalizer {
    client: Arc<dyn DbClient>,
    connection: Connection,
    options: ExplorerOptions,
}

impl Normalizer {
    pub fn new(
        client: Arc<dyn DbClient>,
        connection: Connection,
        options: ExplorerOptions,
    ) -> Self {
        Self {
            client,
            connection,
            options,
        }
    }

    pub async fn normalize(&self, raw: RawTopology) -> Topology {
        Topology {
            databases: self.normalize_databases(raw.databases).await,
            roles: self.normalize_children(raw.roles).await,
            users: self.normalize_children(raw.users).await,
        }
    }

    /// Group the system databases first, then the rest in their listed order
    pub async fn normalize_databases(&self, databases: Vec<RawNode>) -> Vec<TopologyNode> {
        let (system, rest): (Vec<_>, Vec<_>) = databases
            .into_iter()
            .partition(|db| self.options.system_databases.contains(&db.name));

        let system = self.normalize_children(system).await;
        let mut group = TopologyNode::group(SYSTEM_GROUP_NAME, GroupKind::SystemDatabases, system);
        group.meta.connection = Some(self.connection.clone());

        let mut nodes = vec![group];
        nodes.extend(self.normalize_children(rest).await);
        nodes
    }

    pub fn normalize_children(&self, items: Vec<RawNode>) -> BoxFuture<'_, Vec<TopologyNode>> {
        async move {
            let mut children = Vec::with_capacity(items.len());
            for item in items {
                match NodeKind::parse(&item.kind) {
                    NodeKind::Database => children.push(self.normalize_database(item).await),
                    NodeKind::Collection => {
                        if let Some(node) = self.normalize_collection(item).await {
                            children.push(node);
                        }
                    }
                    NodeKind::Group(group) => {
                        let values = self.normalize_children(item.children).await;
                        let mut node = TopologyNode::group(item.name, group, values);
                        node.meta.connection = Some(self.connection.clone());
                        node.meta.database = item.database;
                        children.push(node);
                    }
                    _ => children.push(TopologyNode::from_raw(item, &self.connection)),
                }
            }
            children
        }
        .boxed()
    }

    async fn normalize_database(&self, item: RawNode) -> TopologyNode {
        let collections = self.normalize_children(item.children).await;
        let database = item.database.unwrap_or_else(|| item.name.clone());
        TopologyNode {
            children: collections,
            meta: NodeMeta {
                connection: Some(self.connection.clone()),
                database: Some(database),
                detail: item.detail,
                ..NodeMeta::default()
            },
            ..TopologyNode::new(item.name, NodeKind::Database)
        }
        .with_commands([CommandKind::CreateCollection, CommandKind::DropDatabase])
    }

    /// `None` when the collection could not be read; it is left out of the tree.
    async fn normalize_collection(&self, item: RawNode) -> Option<TopologyNode> {
        let Some(database) = item.database.clone() else {
            tracing::warn!("Collection '{}' has no database, skipping", item.name);
            return None;
        };

        // A zero limit means "no limit" to the server
        let sample = async {
            if self.options.sample_size == 0 {
                return Ok(Vec::new());
            }
            self.client
                .find(&database, &item.name, self.options.sample_size)
                .await
        };
        let fetched = futures::try_join!(
            sample,
            self.client.count_documents(&database, &item.name)
        );
        let (mut documents, count) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(
                    "Failed to read collection '{}.{}' on '{}': {:#}",
                    database,
                    item.name,
                    self.connection.name,
                    e
                );
                return None;
            }
        };

        documents.sort_by(|a, b| compare_ids(document_id(a), document_id(b)));
        documents.truncate(self.options.sample_size);

        let indexes = item
            .children
            .into_iter()
            .map(|index| TopologyNode::from_raw(index, &self.connection))
            .collect();
        let mut index_group = TopologyNode::group(INDEX_GROUP_NAME, GroupKind::Indexes, indexes);
        index_group.meta.connection = Some(self.connection.clone());
        index_group.meta.database = Some(database.clone());
        index_group.meta.collection = Some(item.name.clone());

        let mut children = Vec::with_capacity(documents.len() + 1);
        children.push(index_group);
        children.extend(
            documents
                .into_iter()
                .map(|doc| self.document_node(&database, &item.name, doc)),
        );

        Some(
            TopologyNode {
                children,
                meta: NodeMeta {
                    count: Some(count),
                    connection: Some(self.connection.clone()),
                    database: Some(database),
                    collection: Some(item.name.clone()),
                    ..NodeMeta::default()
                },
                ..TopologyNode::new(item.name, NodeKind::Collection)
            }
            .with_commands([CommandKind::InsertOne, CommandKind::DropCollection]),
        )
    }

    fn document_node(
        &self,
        database: &str,
        collection: &str,
        document: Document,
    ) -> TopologyNode {
        let id = document_id(&document).clone();
        TopologyNode {
            meta: NodeMeta {
                connection: Some(self.connection.clone()),
                database: Some(database.to_string()),
                collection: Some(collection.to_string()),
                document_id: Some(id.clone()),
                detail: Some(document),
                ..NodeMeta::default()
            },
            ..TopologyNode::new(id_label(&id), NodeKind::Document)
        }
        .with_commands([CommandKind::FindOne, CommandKind::DeleteOne])
    }
}

fn document_id(document: &Document) -> &Bson {
    document.get("_id").unwrap_or(&Bson::Null)
}
