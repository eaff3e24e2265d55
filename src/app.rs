//! Composition of the lifecycle controller, the connection registry and the
//! node tree into one context object with explicit init and teardown.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry, ConnectionSource, validate_uri};
use crate::error::ExplorerResult;
use crate::explorer::{ClientFactory, ExplorerEvents, MongoClientFactory, NodeTree};
use crate::server::{InstanceFactory, InstanceInfo, MongodFactory, ServerLifecycleController};

pub struct InstantMongo {
    config_path: Option<PathBuf>,
    runtime_name: Mutex<String>,
    registry: Mutex<ConnectionRegistry>,
    /// Connection registered for the running ephemeral server
    server_connection: Mutex<Option<Connection>>,
    server: ServerLifecycleController,
    tree: NodeTree,
}

impl InstantMongo {
    pub fn new(
        config: Config,
        instances: Arc<dyn InstanceFactory>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        let mut registry = ConnectionRegistry::new();
        registry.set_configured(config.connections);

        Self {
            config_path: None,
            runtime_name: Mutex::new(config.explorer.runtime_connection_name.clone()),
            registry: Mutex::new(registry),
            server_connection: Mutex::new(None),
            server: ServerLifecycleController::new(config.server, instances),
            tree: NodeTree::new(clients, config.explorer, ExplorerEvents::new()),
        }
    }

    /// Real mongod processes and driver clients
    pub fn from_config(config: Config) -> Self {
        Self::new(config, Arc::new(MongodFactory), Arc::new(MongoClientFactory))
    }

    /// File re-read by [`reload_config`](Self::reload_config)
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Create inspectors for the configured connections
    pub async fn init(&self) {
        self.sync_tree().await;
    }

    pub const fn server(&self) -> &ServerLifecycleController {
        &self.server
    }

    pub const fn tree(&self) -> &NodeTree {
        &self.tree
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, ConnectionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connections(&self) -> Vec<(Connection, ConnectionSource)> {
        self.registry().list_with_sources()
    }

    async fn sync_tree(&self) {
        let connections = self.registry().all();
        self.tree.set_connections(&connections).await;
    }

    fn take_server_connection(&self) -> bool {
        let previous = self
            .server_connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        previous.is_some_and(|conn| self.registry().remove_runtime(&conn))
    }

    /// Start (or restart) the ephemeral server and register its connection
    pub async fn start_server(&self) -> ExplorerResult<InstanceInfo> {
        let result = self.server.try_start().await;

        // A restart gets a new port, so the old connection goes either way
        let mut changed = self.take_server_connection();
        if let Ok(info) = &result {
            let name = self
                .runtime_name
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let conn = Connection::new(name, info.uri.clone());
            self.registry().add_runtime(conn.clone());
            *self
                .server_connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(conn);
            changed = true;
            self.tree
                .events()
                .info(format!("Database is running on port {}", info.port));
        } else if let Err(e) = &result {
            self.tree.events().error(e.to_string());
        }

        if changed {
            self.sync_tree().await;
        }
        result
    }

    /// Stop the ephemeral server and drop its connection
    pub async fn stop_server(&self) -> ExplorerResult<()> {
        let result = self.server.stop().await;
        if self.take_server_connection() {
            self.sync_tree().await;
        }
        match &result {
            Ok(()) => self.tree.events().info("Database stopped"),
            Err(e) => self.tree.events().error(e.to_string()),
        }
        result
    }

    /// Add a runtime connection. Returns false when it was already present.
    pub async fn add_connection(&self, connection: Connection) -> ExplorerResult<bool> {
        validate_uri(&connection.uri)?;
        let added = self.registry().add_runtime(connection);
        if added {
            self.sync_tree().await;
        }
        Ok(added)
    }

    /// Remove a runtime connection by (name, uri). Returns false when absent.
    pub async fn remove_connection(&self, connection: &Connection) -> bool {
        let removed = self.registry().remove_runtime(connection);
        if removed {
            self.sync_tree().await;
        }
        removed
    }

    /// Re-read the configuration file and rebuild all inspectors
    pub async fn reload_config(&self) -> Result<()> {
        let config = match &self.config_path {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        info!(
            "Reloaded configuration: {} connections",
            config.connections.len()
        );

        self.registry().set_configured(config.connections);
        *self
            .runtime_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            config.explorer.runtime_connection_name.clone();
        self.tree.set_options(config.explorer);
        self.server.set_options(config.server).await;
        self.sync_tree().await;
        Ok(())
    }

    /// Stop the server, close the status channel and destroy all inspectors
    pub async fn terminate(&self) {
        debug!("Tearing down");
        self.server.terminate().await;
        self.tree.destroy_all().await;
    }
}
