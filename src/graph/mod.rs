//! Dependency graph construction over a configuration tree.

pub mod builder;

pub use builder::{DiscoveredTree, GraphBuilder, GraphError};
