//! MCP server implementation with tool handlers.

use anyhow::Result;
use mongodb::bson::Bson;
use rmcp::{
    ServerHandler,
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

use crate::app::InstantMongo;
use crate::connection::Connection;
use crate::error::ExplorerError;
use crate::explorer::{CommandOutcome, CommandRequest, ExplorerEvent, Notice, events};
use crate::tools::*;

/// Format anyhow error with full cause chain
fn format_error(e: &anyhow::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.chain().skip(1) {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
    }
    msg
}

/// Caller mistakes become `invalid_params`, everything else `internal_error`
fn to_error_data(e: &ExplorerError) -> rmcp::ErrorData {
    if e.is_client_error() {
        rmcp::ErrorData::invalid_params(e.to_string(), None)
    } else {
        rmcp::ErrorData::internal_error(e.detailed(), None)
    }
}

/// Attach notices raised by a failed call so they are not reported with a later one
fn with_notices(mut error: rmcp::ErrorData, notices: &[Notice]) -> rmcp::ErrorData {
    if !notices.is_empty() {
        error.data = Some(serde_json::json!({ "notices": notices }));
    }
    error
}

fn json_result(value: &impl Serialize) -> Result<CallToolResult, rmcp::ErrorData> {
    let text = serde_json::to_string_pretty(value).map_err(|e| {
        rmcp::ErrorData::internal_error(format!("Failed to serialize response: {e}"), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

pub struct McpServer {
    name: String,
    version: String,
    app: Arc<InstantMongo>,
    /// Notices raised since the last tool call
    notices: Mutex<broadcast::Receiver<ExplorerEvent>>,
    tool_router: ToolRouter<Self>,
}

impl McpServer {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        app: Arc<InstantMongo>,
    ) -> Self {
        let notices = Mutex::new(app.tree().subscribe());
        Self {
            name: name.into(),
            version: version.into(),
            app,
            notices,
            tool_router: Self::tool_router(),
        }
    }

    pub async fn run(self) -> Result<()> {
        use rmcp::ServiceExt;

        tracing::info!("MCP server starting: {} v{}", self.name, self.version);

        let transport = rmcp::transport::stdio();
        let server = self.serve(transport).await?;
        server.waiting().await?;

        tracing::info!("MCP server shutting down");
        Ok(())
    }

    async fn take_notices(&self) -> Vec<Notice> {
        let mut receiver = self.notices.lock().await;
        events::drain(&mut receiver)
            .into_iter()
            .filter_map(|event| match event {
                ExplorerEvent::Notice(notice) => Some(notice),
                ExplorerEvent::TreeChanged { .. } => None,
            })
            .collect()
    }

    async fn run_command(
        &self,
        path: &[String],
        request: CommandRequest,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let tree = self.app.tree();
        let result = match tree.resolve(path).await {
            Ok(item) => tree.execute(&item, request).await,
            Err(e) => Err(e),
        };
        let notices = self.take_notices().await;
        let outcome = result.map_err(|e| with_notices(to_error_data(&e), &notices))?;

        let response = match outcome {
            CommandOutcome::Applied { message, tree } => serde_json::json!({
                "message": message,
                "refreshed": tree.is_some(),
                "notices": notices,
            }),
            CommandOutcome::Found(document) => serde_json::json!({
                "document": document.map(|d| Bson::Document(d).into_relaxed_extjson()),
            }),
        };
        json_result(&response)
    }
}

#[tool_router]
impl McpServer {
    /// Starts the ephemeral mongod server, restarting it if it is already running.
    ///
    /// On success the server is registered as a connection named after
    /// explorer.runtime_connection_name and shows up in get_roots.
    #[tool]
    async fn start_server(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let result = self.app.start_server().await;
        let notices = self.take_notices().await;
        let info = result.map_err(|e| with_notices(to_error_data(&e), &notices))?;

        json_result(&serde_json::json!({
            "status": self.app.server().status(),
            "info": info,
            "notices": notices,
        }))
    }

    /// Stops the ephemeral mongod server and removes its connection.
    /// Stopping a stopped server succeeds.
    #[tool]
    async fn stop_server(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let result = self.app.stop_server().await;
        let notices = self.take_notices().await;
        result.map_err(|e| with_notices(to_error_data(&e), &notices))?;

        json_result(&serde_json::json!({
            "status": self.app.server().status(),
            "notices": notices,
        }))
    }

    /// Returns the ephemeral server status: stopped, starting, running or stopping.
    #[tool]
    fn server_status(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        json_result(&serde_json::json!({ "status": self.app.server().status() }))
    }

    /// Returns port, database name, ip, storage engine, replica set, data path, URI and pid
    /// of the running ephemeral server.
    #[tool]
    fn server_info(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        match self.app.server().instance_info() {
            Some(info) => json_result(&info),
            None => json_result(&serde_json::json!({
                "running": false,
                "message": "Database is not running",
            })),
        }
    }

    /// Lists all connections, runtime ones (including the ephemeral server) first.
    #[tool]
    fn list_connections(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let connections = self.app.connections();

        let response = serde_json::json!({
            "connections": connections.iter().map(|(conn, source)| {
                serde_json::json!({ "name": conn.name, "uri": conn.uri, "source": source })
            }).collect::<Vec<_>>(),
            "count": connections.len()
        });

        json_result(&response)
    }

    /// Adds a runtime connection and creates an inspector for it.
    #[tool]
    async fn add_connection(
        &self,
        Parameters(params): Parameters<ConnectionParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let added = self
            .app
            .add_connection(Connection::new(params.name, params.uri))
            .await
            .map_err(|e| to_error_data(&e))?;

        json_result(&serde_json::json!({ "added": added }))
    }

    /// Removes a runtime connection matching both name and URI.
    #[tool]
    async fn remove_connection(
        &self,
        Parameters(params): Parameters<ConnectionParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let connection = Connection::new(params.name, params.uri);
        if !self.app.remove_connection(&connection).await {
            return Err(rmcp::ErrorData::invalid_params(
                format!(
                    "No runtime connection '{}' with URI '{}'",
                    connection.name, connection.uri
                ),
                None,
            ));
        }

        json_result(&serde_json::json!({ "removed": true }))
    }

    /// Re-reads the configuration file and recreates every inspector.
    #[tool]
    async fn reload_config(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        self.app
            .reload_config()
            .await
            .map_err(|e| rmcp::ErrorData::internal_error(format_error(&e), None))?;

        json_result(&serde_json::json!({ "connections": self.app.connections().len() }))
    }

    /// Returns one root item per connection, inspecting connections that were not inspected yet.
    ///
    /// Connections that cannot be reached still have a root (hint host:closed) without children;
    /// the failure is listed under notices.
    #[tool]
    async fn get_roots(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let roots = self.app.tree().roots().await;

        json_result(&serde_json::json!({
            "items": roots,
            "notices": self.take_notices().await,
        }))
    }

    /// Returns the children of the item at path, from the cached topology.
    ///
    /// Connection roots have "databases", "roles" and "users"; databases have collections;
    /// collections have an "Indexes" group followed by up to 10 sample documents.
    #[tool]
    async fn get_children(
        &self,
        Parameters(params): Parameters<NodePathParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let tree = self.app.tree();
        let item = tree
            .resolve(&params.path)
            .await
            .map_err(|e| to_error_data(&e))?;

        json_result(&serde_json::json!({ "items": tree.children_of(&item) }))
    }

    /// Re-inspects one connection, or resets and re-inspects all of them when no name is given.
    #[tool]
    async fn refresh(
        &self,
        Parameters(params): Parameters<RefreshParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let result = self
            .app
            .tree()
            .refresh(params.connection_name.as_deref())
            .await;
        let notices = self.take_notices().await;
        result.map_err(|e| with_notices(to_error_data(&e), &notices))?;

        json_result(&serde_json::json!({ "refreshed": true, "notices": notices }))
    }

    /// Creates a database together with its first collection.
    #[tool]
    async fn create_database(
        &self,
        Parameters(params): Parameters<CreateDatabaseParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(
            &params.path,
            CommandRequest::CreateDatabase {
                name: params.name,
                first_collection: params.first_collection,
            },
        )
        .await
    }

    /// Drops the database at path.
    #[tool]
    async fn drop_database(
        &self,
        Parameters(params): Parameters<NodePathParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(&params.path, CommandRequest::DropDatabase).await
    }

    /// Creates a collection in the database at path.
    #[tool]
    async fn create_collection(
        &self,
        Parameters(params): Parameters<CreateCollectionParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(&params.path, CommandRequest::CreateCollection { name: params.name })
            .await
    }

    /// Drops the collection at path.
    #[tool]
    async fn drop_collection(
        &self,
        Parameters(params): Parameters<NodePathParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(&params.path, CommandRequest::DropCollection).await
    }

    /// Inserts a JSON document into the collection at path. Returns after the tree was refreshed.
    #[tool]
    async fn insert_document(
        &self,
        Parameters(params): Parameters<InsertDocumentParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(
            &params.path,
            CommandRequest::InsertDocument {
                json: params.document,
            },
        )
        .await
    }

    /// Deletes the sample document at path.
    #[tool]
    async fn delete_document(
        &self,
        Parameters(params): Parameters<NodePathParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(&params.path, CommandRequest::DeleteDocument).await
    }

    /// Fetches the full, current content of the sample document at path.
    #[tool]
    async fn find_document(
        &self,
        Parameters(params): Parameters<NodePathParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        self.run_command(&params.path, CommandRequest::FindOne).await
    }
}

#[tool_handler]
impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
                ..Default::default()
            },
            instructions: Some(
                "Ephemeral MongoDB server and topology explorer. Workflow: \
                 1) start_server to run a throwaway mongod (optional), \
                 2) get_roots to list connections, \
                 3) get_children with a label path to walk databases, collections, \
                 indexes and sample documents, \
                 4) create_database, create_collection, insert_document, delete_document, \
                 drop_collection and drop_database act on the item at a path \
                 and return once the tree is refreshed, \
                 5) find_document shows the full content of a sample document."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::explorer::fake::{FakeClient, FakeClientFactory};
    use crate::server::fake::FakeFactory;

    fn server() -> McpServer {
        let clients = FakeClientFactory::new()
            .with_client("A", FakeClient::new().with_collection("app", "items", 2));
        let config = Config {
            connections: vec![Connection::new("A", "mongodb://h/db")],
            ..Config::default()
        };
        let app = InstantMongo::new(config, Arc::new(FakeFactory::default()), Arc::new(clients));
        McpServer::new("test", "0.0.0", Arc::new(app))
    }

    fn path(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_to_error_data_classifies() {
        let err = to_error_data(&ExplorerError::validation("bad name"));
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);

        let err = to_error_data(&ExplorerError::connection("A", anyhow::anyhow!("refused")));
        assert_eq!(err.code, rmcp::model::ErrorCode::INTERNAL_ERROR);
        assert!(err.message.contains("refused"));
    }

    #[test]
    fn test_format_error_chain() {
        let err = anyhow::anyhow!("inner").context("outer");
        assert_eq!(format_error(&err), "outer: inner");
    }

    #[tokio::test]
    async fn test_insert_then_find_through_commands() {
        let server = server();
        server.app.init().await;

        server
            .run_command(
                &path(&["A", "databases", "app", "items"]),
                CommandRequest::InsertDocument {
                    json: r#"{"_id": 7, "a": 1}"#.to_string(),
                },
            )
            .await
            .unwrap();

        let found = server
            .run_command(
                &path(&["A", "databases", "app", "items", "7"]),
                CommandRequest::FindOne,
            )
            .await;
        assert!(found.is_ok());
        assert!(server.take_notices().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path_is_invalid_params() {
        let server = server();
        server.app.init().await;

        let err = server
            .run_command(&path(&["A", "databases", "nope"]), CommandRequest::DropDatabase)
            .await
            .unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_failed_command_carries_its_notices() {
        let server = server();
        server.app.init().await;

        let err = server
            .run_command(
                &path(&["A", "databases", "app"]),
                CommandRequest::CreateCollection {
                    name: "items".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
        assert_eq!(
            err.data,
            Some(serde_json::json!({
                "notices": [{ "level": "error", "message": "Collection 'items' already exists" }]
            }))
        );
        assert!(server.take_notices().await.is_empty());
    }
}
