//! Topology inspection: per-connection sessions, normalization and the node tree.

pub mod client;
pub mod display;
pub mod events;
pub mod inspector;
pub mod normalize;
pub mod topology;
pub mod tree;
pub mod validate;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{ClientFactory, DbClient, MongoClientFactory, MongoDbClient, fetch_raw_topology};
pub use display::DisplayHint;
pub use events::{ExplorerEvent, ExplorerEvents, Notice};
pub use inspector::{CommandInvocation, CommandOutcome, TopologyInspector};
pub use normalize::Normalizer;
pub use topology::{CommandKind, GroupKind, NodeKind, RawNode, RawTopology, Topology, TopologyNode};
pub use tree::{Activation, CommandRequest, NodeTree, TreeItem};
