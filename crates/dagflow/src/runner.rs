//! Level-synchronous execution of a directory graph.
//!
//! Scheduling is a breadth-first frontier walk with a barrier between
//! levels: the first frontier is the graph's source nodes, each following
//! frontier is the successors of the nodes that just completed. Every node
//! in a frontier passes a readiness gate (all predecessors terminal and
//! successful) before it is handed to the worker pool; nodes that fail the
//! gate simply stay unscheduled and are revisited when their blocking
//! predecessor completes. Entries for blocked nodes are never created, so
//! a node downstream of a failure ends the run absent from the entry cache
//! and is classified as not applied.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;

use crate::entry::{EntryFactory, EntryState, ExecutionResult, GraphEntry, Operation};
use crate::graph::DirGraph;

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker pool size for each execution phase.
    pub parallelism: usize,
    /// Forwarded to entries (verbose command logging).
    pub debug: bool,
    /// Replace the output of nodes without changes with a short notice.
    pub print_only_changes: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            debug: false,
            print_only_changes: false,
        }
    }
}

/// Aggregate outcome of a run, accumulated across both execution phases.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Nodes that ran (successfully or not).
    pub applied: HashSet<PathBuf>,
    /// Nodes skipped as no-ops or never reached.
    pub not_applied: HashSet<PathBuf>,
    /// Paths whose command exited non-zero, in completion order.
    pub failures: Vec<PathBuf>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another phase's summary into this one.
    pub fn merge(&mut self, other: Self) {
        self.applied.extend(other.applied);
        self.not_applied.extend(other.not_applied);
        self.failures.extend(other.failures);
    }
}

struct Slot {
    entry: GraphEntry,
    state: EntryState,
}

/// Executes entries over a [`DirGraph`] in dependency order.
///
/// The entry cache is owned here and mutated only from the scheduling
/// thread; worker threads only read entries while executing them.
pub struct GraphRunner<'a> {
    graph: &'a DirGraph,
    factory: &'a dyn EntryFactory,
    operation: Operation,
    options: RunOptions,
    entries: HashMap<PathBuf, Slot>,
}

impl<'a> GraphRunner<'a> {
    pub fn new(
        graph: &'a DirGraph,
        factory: &'a dyn EntryFactory,
        operation: Operation,
        options: RunOptions,
    ) -> Self {
        Self {
            graph,
            factory,
            operation,
            options,
            entries: HashMap::new(),
        }
    }

    /// Run the whole graph, frontier by frontier.
    ///
    /// Errors only on entry construction (a configuration problem); a
    /// failing command is recorded in the summary instead.
    pub fn execute_graph(&mut self) -> Result<RunSummary> {
        let pool = self.build_pool()?;
        let mut failures = Vec::new();
        let mut frontier = self.graph.sources();

        while !frontier.is_empty() {
            frontier.sort();
            frontier.dedup();

            let mut batch = Vec::new();
            for node in frontier.drain(..) {
                if self.entries.contains_key(&node) {
                    continue;
                }
                if !self.can_be_applied(&node) {
                    // Revisited once the blocking predecessor completes.
                    continue;
                }
                let entry = self.factory.create(&node)?;
                let state = entry.initial_state();
                self.entries.insert(node.clone(), Slot { entry, state });
                batch.push(node);
            }

            if batch.is_empty() {
                break;
            }

            let results = self.run_batch(&pool, &batch);
            frontier = self.finish_batch(results, &mut failures);
        }

        Ok(self.classify(self.graph.nodes(), failures))
    }

    /// Run the flat post-graph list as one batch. No ordering constraints
    /// among its members; the same pool bound, scope filter, and
    /// aggregation rules apply.
    pub fn execute_post_graph(&mut self, post_graph: &[PathBuf]) -> Result<RunSummary> {
        let pool = self.build_pool()?;

        let mut batch = Vec::new();
        for node in post_graph {
            if self.entries.contains_key(node) {
                continue;
            }
            let entry = self.factory.create(node)?;
            let state = entry.initial_state();
            self.entries.insert(node.clone(), Slot { entry, state });
            batch.push(node.clone());
        }

        let mut failures = Vec::new();
        if !batch.is_empty() {
            let results = self.run_batch(&pool, &batch);
            self.finish_batch(results, &mut failures);
        }

        Ok(self.classify(post_graph.iter(), failures))
    }

    fn build_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.parallelism)
            .build()
            .context("failed to create worker pool")
    }

    /// Readiness gate: every predecessor must already have an entry in a
    /// terminal success state. A missing predecessor means it has not run.
    fn can_be_applied(&self, path: &Path) -> bool {
        self.graph.predecessors(path).iter().all(|pred| {
            self.entries
                .get(pred)
                .is_some_and(|slot| slot.state.satisfies_gate())
        })
    }

    fn run_batch(
        &mut self,
        pool: &rayon::ThreadPool,
        batch: &[PathBuf],
    ) -> Vec<(PathBuf, ExecutionResult)> {
        for path in batch {
            if let Some(slot) = self.entries.get_mut(path)
                && slot.state == EntryState::Pending
            {
                slot.state = EntryState::Executing;
            }
        }

        let operation = self.operation;
        let debug = self.options.debug;
        let entries = &self.entries;

        pool.install(|| {
            batch
                .par_iter()
                .map(|path| {
                    let result = entries[path]
                        .entry
                        .execute(operation, debug)
                        .unwrap_or_else(|err| ExecutionResult {
                            exit_code: 1,
                            output: vec![format!("{err:#}")],
                            changes_detected: true,
                        });
                    (path.clone(), result)
                })
                .collect()
        })
    }

    /// Record results, print output, and compute the next frontier.
    fn finish_batch(
        &mut self,
        results: Vec<(PathBuf, ExecutionResult)>,
        failures: &mut Vec<PathBuf>,
    ) -> Vec<PathBuf> {
        let mut next = Vec::new();
        for (path, result) in results {
            if let Some(slot) = self.entries.get_mut(&path)
                && slot.state != EntryState::NoOp
            {
                slot.state = if result.success() {
                    EntryState::Success
                } else {
                    EntryState::Failed
                };
            }
            self.print_result(&path, &result);
            if !result.success() {
                failures.push(path.clone());
            }
            next.extend(self.graph.successors(&path));
        }
        next
    }

    fn print_result(&self, path: &Path, result: &ExecutionResult) {
        if result.output.is_empty() {
            return;
        }
        if self.options.print_only_changes && !result.changes_detected {
            println!("{}: no changes detected", path.display());
            return;
        }
        println!(
            "\nOutput for {}:\n\n{}\n",
            path.display(),
            result.output.join("\n").trim()
        );
    }

    fn classify<'b>(
        &self,
        nodes: impl Iterator<Item = &'b PathBuf>,
        failures: Vec<PathBuf>,
    ) -> RunSummary {
        let mut summary = RunSummary {
            failures,
            ..Default::default()
        };
        for node in nodes {
            match self.entries.get(node).map(|slot| slot.state) {
                None | Some(EntryState::NoOp) => {
                    summary.not_applied.insert(node.clone());
                }
                Some(_) => {
                    summary.applied.insert(node.clone());
                }
            }
        }
        summary
    }
}
