//! Presentation hints for tree items. Purely informational for renderers.

use serde::Serialize;

use super::topology::{GroupKind, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayHint {
    HostConnected,
    HostClosed,
    Database,
    Users,
    Roles,
    Collection,
    Document,
    Index,
    IndexGroup,
    SystemDatabaseGroup,
    CollectionGroup,
    Default,
}

impl DisplayHint {
    pub const fn for_inspector(connected: bool) -> Self {
        if connected {
            Self::HostConnected
        } else {
            Self::HostClosed
        }
    }

    pub fn for_kind(kind: &NodeKind) -> Self {
        match kind {
            NodeKind::Database | NodeKind::Group(GroupKind::Databases) => Self::Database,
            NodeKind::Collection => Self::Collection,
            NodeKind::Document => Self::Document,
            NodeKind::Index => Self::Index,
            NodeKind::Group(GroupKind::Indexes) => Self::IndexGroup,
            NodeKind::Group(GroupKind::SystemDatabases) => Self::SystemDatabaseGroup,
            NodeKind::Group(GroupKind::Users) => Self::Users,
            NodeKind::Group(GroupKind::Roles) => Self::Roles,
            NodeKind::Generic(raw) => Self::for_raw(raw),
            NodeKind::Inspector => Self::HostClosed,
        }
    }

    /// Hint for a kind string. Unknown kinds fall back to [`DisplayHint::Default`].
    pub fn for_raw(raw: &str) -> Self {
        match raw {
            "host:connected" => Self::HostConnected,
            "host:closed" => Self::HostClosed,
            "databases" | "database" => Self::Database,
            "users" | "user" => Self::Users,
            "roles" | "role" => Self::Roles,
            "collection" => Self::Collection,
            "document" => Self::Document,
            "index" | "indexes" | "group:indexes" => Self::Index,
            "group:collection" => Self::CollectionGroup,
            "group:system_db" => Self::SystemDatabaseGroup,
            _ => Self::Default,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HostConnected => "host:connected",
            Self::HostClosed => "host:closed",
            Self::Database => "database",
            Self::Users => "users",
            Self::Roles => "roles",
            Self::Collection => "collection",
            Self::Document => "document",
            Self::Index => "index",
            Self::IndexGroup => "indexes",
            Self::SystemDatabaseGroup => "system_db",
            Self::CollectionGroup => "collections",
            Self::Default => "default",
        }
    }
}
