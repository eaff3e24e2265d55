//! Topology node types, raw and normalized.
//!
//! Raw nodes come straight from the database client and carry their kind as a
//! string (`database`, `collection`, `group:indexes`, ...). Normalization turns
//! them into [`TopologyNode`]s whose kind is a closed enum.

use mongodb::bson::{Bson, Document};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::connection::Connection;

/// What a synthetic group node buckets. Used for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    SystemDatabases,
    Indexes,
    Databases,
    Roles,
    Users,
}

impl GroupKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SystemDatabases => "group:system_db",
            Self::Indexes => "group:indexes",
            Self::Databases => "group:databases",
            Self::Roles => "group:roles",
            Self::Users => "group:users",
        }
    }

    fn from_subtype(subtype: &str) -> Option<Self> {
        match subtype {
            "system_db" => Some(Self::SystemDatabases),
            "indexes" => Some(Self::Indexes),
            "databases" => Some(Self::Databases),
            "roles" => Some(Self::Roles),
            "users" => Some(Self::Users),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Inspector,
    Group(GroupKind),
    Database,
    Collection,
    Index,
    Document,
    /// Anything else (roles, users, ...), keeping the raw kind for display
    Generic(String),
}

impl NodeKind {
    /// Parse a raw kind, switching on the part before any `:subtype` suffix.
    pub fn parse(raw: &str) -> Self {
        let (base, subtype) = match raw.split_once(':') {
            Some((base, subtype)) => (base, Some(subtype)),
            None => (raw, None),
        };

        match base {
            "inspector" => Self::Inspector,
            "database" => Self::Database,
            "collection" => Self::Collection,
            "index" => Self::Index,
            "document" => Self::Document,
            "group" => subtype
                .and_then(GroupKind::from_subtype)
                .map_or_else(|| Self::Generic(raw.to_string()), Self::Group),
            _ => Self::Generic(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Inspector => "inspector",
            Self::Group(group) => group.as_str(),
            Self::Database => "database",
            Self::Collection => "collection",
            Self::Index => "index",
            Self::Document => "document",
            Self::Generic(raw) => raw,
        }
    }

    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NodeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Commands a node can be asked to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    CreateDatabase,
    DropDatabase,
    CreateCollection,
    DropCollection,
    InsertOne,
    DeleteOne,
    FindOne,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateDatabase => "createDatabase",
            Self::DropDatabase => "dropDatabase",
            Self::CreateCollection => "createCollection",
            Self::DropCollection => "dropCollection",
            Self::InsertOne => "insertOne",
            Self::DeleteOne => "deleteOne",
            Self::FindOne => "findOne",
        }
    }

    /// True when the command writes and therefore triggers a re-inspection
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::FindOne)
    }
}

pub type CommandSet = BTreeSet<CommandKind>;

/// Optional facts attached to a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMeta {
    /// Element count (documents of a collection, members of a group)
    pub count: Option<u64>,
    /// Owning connection, used to route commands back to its session
    pub connection: Option<Connection>,
    pub database: Option<String>,
    pub collection: Option<String>,
    /// `_id` of a document node
    pub document_id: Option<Bson>,
    /// Document content, index keys, or role/user details
    pub detail: Option<Document>,
}

/// A node as delivered by the client, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub name: String,
    pub kind: String,
    pub database: Option<String>,
    /// Collections of a database, indexes of a collection, values of a group
    pub children: Vec<RawNode>,
    pub detail: Option<Document>,
}

impl RawNode {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            database: None,
            children: Vec::new(),
            detail: None,
        }
    }

    pub fn database(name: impl Into<String>, collections: Vec<RawNode>) -> Self {
        let name = name.into();
        Self {
            database: Some(name.clone()),
            children: collections,
            ..Self::new(name, "database")
        }
    }

    pub fn collection(database: &str, name: impl Into<String>, indexes: Vec<RawNode>) -> Self {
        Self {
            database: Some(database.to_string()),
            children: indexes,
            ..Self::new(name, "collection")
        }
    }

    pub fn index(database: &str, name: impl Into<String>, keys: Document) -> Self {
        Self {
            database: Some(database.to_string()),
            detail: Some(keys),
            ..Self::new(name, "index")
        }
    }
}

/// Raw topology of one connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTopology {
    pub databases: Vec<RawNode>,
    pub roles: Vec<RawNode>,
    pub users: Vec<RawNode>,
}

/// A normalized node. Children are empty for leaves.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyNode {
    pub name: String,
    pub kind: NodeKind,
    pub children: Vec<TopologyNode>,
    pub meta: NodeMeta,
    pub commands: CommandSet,
}

impl TopologyNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            children: Vec::new(),
            meta: NodeMeta::default(),
            commands: CommandSet::new(),
        }
    }

    pub fn group(name: impl Into<String>, group: GroupKind, children: Vec<TopologyNode>) -> Self {
        let count = children.len() as u64;
        Self {
            children,
            meta: NodeMeta {
                count: Some(count),
                ..NodeMeta::default()
            },
            ..Self::new(name, NodeKind::Group(group))
        }
    }

    /// Plain conversion of a raw node and its children, without any I/O
    pub fn from_raw(raw: RawNode, connection: &Connection) -> Self {
        let kind = NodeKind::parse(&raw.kind);
        let children = raw
            .children
            .into_iter()
            .map(|child| Self::from_raw(child, connection))
            .collect();
        Self {
            name: raw.name,
            kind,
            children,
            meta: NodeMeta {
                connection: Some(connection.clone()),
                database: raw.database,
                detail: raw.detail,
                ..NodeMeta::default()
            },
            commands: CommandSet::new(),
        }
    }

    pub fn with_commands(mut self, commands: impl IntoIterator<Item = CommandKind>) -> Self {
        self.commands.extend(commands);
        self
    }

    pub fn supports(&self, command: CommandKind) -> bool {
        self.commands.contains(&command)
    }

    pub fn child(&self, name: &str) -> Option<&TopologyNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Normalized topology of one connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub databases: Vec<TopologyNode>,
    pub roles: Vec<TopologyNode>,
    pub users: Vec<TopologyNode>,
}

impl Topology {
    /// Number of databases, counting grouped system databases individually
    pub fn database_count(&self) -> u64 {
        self.databases
            .iter()
            .map(|node| match (&node.kind, node.meta.count) {
                (NodeKind::Group(_), Some(count)) => count,
                (NodeKind::Group(_), None) => node.children.len() as u64,
                _ => 1,
            })
            .sum()
    }

    /// All database nodes, looking inside groups
    pub fn all_databases(&self) -> impl Iterator<Item = &TopologyNode> {
        self.databases.iter().flat_map(|node| match node.kind {
            NodeKind::Group(_) => node.children.iter().collect::<Vec<_>>(),
            _ => vec![node],
        })
    }

    pub fn find_database(&self, name: &str) -> Option<&TopologyNode> {
        self.all_databases().find(|db| db.name == name)
    }
}

/// Display label for a document identifier
pub fn id_label(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Rank of a value in MongoDB's cross-type sort order
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Ascending order of `_id` values, as the server sorts them
pub fn compare_ids(a: &Bson, b: &Bson) -> Ordering {
    let by_type = type_rank(a).cmp(&type_rank(b));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::Int32(x), Bson::Int64(y)) => i64::from(*x).cmp(y),
        (Bson::Int64(x), Bson::Int32(y)) => x.cmp(&i64::from(*y)),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => Ordering::Equal,
        },
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}
