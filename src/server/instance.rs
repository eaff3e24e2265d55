//! Abstraction over the ephemeral server process.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ServerOptions;

/// Connection facts about a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub port: u16,
    pub db_name: String,
    pub ip: String,
    pub storage_engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repl_set: Option<String>,
    pub db_path: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// One ephemeral server. Startable again after a stop.
#[async_trait]
pub trait ServerInstance: Send + Sync {
    /// Start the server and wait until it accepts connections
    async fn start(&mut self) -> Result<InstanceInfo>;

    /// Stop the server; a no-op when it is not running
    async fn stop(&mut self) -> Result<()>;

    /// Present only while running
    fn info(&self) -> Option<&InstanceInfo>;

    fn is_running(&self) -> bool {
        self.info().is_some()
    }
}

/// Creates instances from a configuration snapshot.
pub trait InstanceFactory: Send + Sync {
    fn create(&self, options: &ServerOptions) -> Box<dyn ServerInstance>;
}
