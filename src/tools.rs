//! MCP tool parameter types.
//! These structs are deserialized by rmcp macros but not directly constructed.

use schemars::JsonSchema;
use serde::Deserialize;

/// Parameters for add_connection and remove_connection tools
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConnectionParams {
    /// Display name of the connection. Case-sensitive.
    pub name: String,
    /// mongodb:// or mongodb+srv:// connection URI
    pub uri: String,
}

/// Parameters for the refresh tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RefreshParams {
    /// Connection to re-inspect. Omit to reset and re-inspect every connection.
    #[serde(default)]
    pub connection_name: Option<String>,
}

/// Parameters for tools addressing a single tree item
#[derive(Debug, Deserialize, JsonSchema)]
pub struct NodePathParams {
    /// Labels from the connection root down to the item,
    /// e.g. ["Instant Mongo", "databases", "app", "users"].
    /// Use get_roots and get_children to discover them.
    pub path: Vec<String>,
}

/// Parameters for create_database tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateDatabaseParams {
    /// Path of a connection root or its "databases" item
    pub path: Vec<String>,
    /// Name of the new database. Must not contain / \ . space " $ * < > : | ?
    pub name: String,
    /// A database only exists once it holds a collection; this one is created with it.
    pub first_collection: String,
}

/// Parameters for create_collection tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateCollectionParams {
    /// Path of the database item
    pub path: Vec<String>,
    /// Name of the new collection. Must not start with "system." or contain $
    pub name: String,
}

/// Parameters for insert_document tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InsertDocumentParams {
    /// Path of the collection item
    pub path: Vec<String>,
    /// The document as a JSON object string. Extended JSON such as {"$oid": "..."} is accepted.
    pub document: String,
}
