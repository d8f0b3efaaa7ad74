//! Directory-keyed DAG model and parallel execution engine
//!
//! The engine knows nothing about what runs at each node:
//! 1. Graph - directed graph of directory paths (`a -> b` means `b`
//!    depends on `a`)
//! 2. Entries - units of work attached to nodes, created on demand by an
//!    [`EntryFactory`] (live or no-op, decided once at creation)
//! 3. Runner - level-synchronous scheduler with a readiness gate, bounded
//!    worker pool, and applied/not-applied/failed accounting

pub mod entry;
pub mod graph;
pub mod runner;

pub use entry::{Entry, EntryFactory, EntryState, ExecutionResult, GraphEntry, Operation};
pub use graph::DirGraph;
pub use runner::{GraphRunner, RunOptions, RunSummary};
