//! Ephemeral MongoDB server lifecycle and topology explorer, served over MCP.

pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod explorer;
pub mod mcp;
pub mod server;
pub mod tools;

pub use app::InstantMongo;
pub use error::{ExplorerError, ExplorerResult};
