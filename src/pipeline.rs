//! CSV-driven pipeline execution.
//!
//! A pipeline file sequences directories explicitly instead of deriving
//! an order from wrapper-config dependencies. Rows share a numeric
//! sequence; sequences run one after another, and the rows inside a
//! sequence run in parallel. Destroy walks the sequences in reverse so
//! later stages come down before the stages they were built on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use dagflow::{Entry, ExecutionResult, Operation, RunOptions, RunSummary};
use rayon::prelude::*;
use serde::Deserialize;

use crate::paths;

/// One row of the pipeline file: `seq,directory,variables`.
#[derive(Debug, Deserialize)]
struct PipelineRow {
    seq: i64,
    directory: String,
    #[serde(default)]
    variables: String,
}

/// One directory to execute, with its row-level extra arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub directory: PathBuf,
    pub variables: Vec<String>,
}

/// Steps of one sequence, split by how they may be scheduled.
///
/// Symlinked directories can alias the same backing directory as other
/// rows, and concurrent `init` runs in a shared directory corrupt each
/// other, so links always run one at a time after the parallel batch.
#[derive(Debug, Default)]
struct Sequence {
    parallel: Vec<PipelineStep>,
    sequential: Vec<PipelineStep>,
}

impl Sequence {
    fn len(&self) -> usize {
        self.parallel.len() + self.sequential.len()
    }
}

/// Builds the executable entry for one pipeline step.
pub trait StepFactory: Sync {
    fn create(&self, step: &PipelineStep) -> Result<Box<dyn Entry>>;
}

/// A parsed pipeline: sequences keyed by their number, ready to execute.
pub struct Pipeline {
    operation: Operation,
    sequences: BTreeMap<i64, Sequence>,
}

impl Pipeline {
    /// Parse a pipeline CSV file. Directories are resolved against the
    /// working directory; a row's `variables` cell is split on whitespace.
    pub fn load(operation: Operation, path: &Path) -> Result<Self> {
        if path.extension().is_none_or(|ext| ext != "csv") {
            bail!(
                "{} does not look like a pipeline file, expected a .csv",
                path.display()
            );
        }
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open pipeline file {}", path.display()))?;

        let mut sequences: BTreeMap<i64, Sequence> = BTreeMap::new();
        for row in reader.deserialize() {
            let row: PipelineRow =
                row.with_context(|| format!("malformed row in {}", path.display()))?;
            let directory = paths::get_absolute_path(Path::new(&row.directory))?;
            let step = PipelineStep {
                variables: row
                    .variables
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                directory,
            };
            let sequence = sequences.entry(row.seq).or_default();
            if step.directory.is_symlink() {
                sequence.sequential.push(step);
            } else {
                sequence.parallel.push(step);
            }
        }
        Ok(Self {
            operation,
            sequences,
        })
    }

    /// Total number of steps across all sequences.
    pub fn len(&self) -> usize {
        self.sequences.values().map(Sequence::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute every sequence in order, ascending for plan/apply and
    /// descending for destroy. A failure anywhere in a sequence stops the
    /// pipeline; the steps of the remaining sequences are reported as not
    /// applied.
    ///
    /// Errors only on entry construction or pool setup; a failing command
    /// is recorded in the summary instead.
    pub fn execute(&self, factory: &dyn StepFactory, options: &RunOptions) -> Result<RunSummary> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.parallelism)
            .build()
            .context("failed to create worker pool")?;

        let mut order: Vec<i64> = self.sequences.keys().copied().collect();
        if self.operation == Operation::Destroy {
            order.reverse();
        }

        let mut summary = RunSummary::default();
        let mut halted = false;
        for seq in order {
            let sequence = &self.sequences[&seq];
            if halted {
                for step in sequence.parallel.iter().chain(&sequence.sequential) {
                    summary.not_applied.insert(step.directory.clone());
                }
                continue;
            }

            log::info!("executing sequence {seq}");
            self.run_wave(&pool, &sequence.parallel, factory, options, &mut summary)?;

            // Run each link on its own so aliased directories never
            // overlap, and stop at the first failure like any other step.
            for step in &sequence.sequential {
                if !summary.success() {
                    break;
                }
                self.run_wave(
                    &pool,
                    std::slice::from_ref(step),
                    factory,
                    options,
                    &mut summary,
                )?;
            }
            halted = !summary.success();
        }
        Ok(summary)
    }

    fn run_wave(
        &self,
        pool: &rayon::ThreadPool,
        steps: &[PipelineStep],
        factory: &dyn StepFactory,
        options: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut entries = Vec::with_capacity(steps.len());
        for step in steps {
            let entry = factory
                .create(step)
                .with_context(|| format!("failed to prepare {}", step.directory.display()))?;
            entries.push(entry);
        }

        let operation = self.operation;
        let debug = options.debug;
        let results: Vec<(PathBuf, ExecutionResult)> = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    let result =
                        entry
                            .execute(operation, debug)
                            .unwrap_or_else(|err| ExecutionResult {
                                exit_code: 1,
                                output: vec![format!("{err:#}")],
                                changes_detected: true,
                            });
                    (entry.path().to_path_buf(), result)
                })
                .collect()
        });

        for (path, result) in results {
            print_result(&path, &result, options);
            summary.applied.insert(path.clone());
            if !result.success() {
                summary.failures.push(path);
            }
        }
        Ok(())
    }
}

fn print_result(path: &Path, result: &ExecutionResult, options: &RunOptions) {
    if result.output.is_empty() {
        return;
    }
    if options.print_only_changes && !result.changes_detected {
        println!("{}: no changes detected", path.display());
        return;
    }
    println!(
        "\nOutput for {}:\n\n{}\n",
        path.display(),
        result.output.join("\n").trim()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct ScriptedEntry {
        path: PathBuf,
        exit_code: i32,
        log: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl Entry for ScriptedEntry {
        fn path(&self) -> &Path {
            &self.path
        }

        fn execute(&self, _operation: Operation, _debug: bool) -> Result<ExecutionResult> {
            self.log.lock().unwrap().push(self.path.clone());
            Ok(ExecutionResult {
                exit_code: self.exit_code,
                output: vec![format!("ran {}", self.path.display())],
                changes_detected: true,
            })
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        fail_on: Option<PathBuf>,
        log: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ScriptedFactory {
        fn executed(&self) -> Vec<PathBuf> {
            self.log.lock().unwrap().clone()
        }
    }

    impl StepFactory for ScriptedFactory {
        fn create(&self, step: &PipelineStep) -> Result<Box<dyn Entry>> {
            let exit_code = i32::from(self.fail_on.as_deref() == Some(step.directory.as_path()));
            Ok(Box::new(ScriptedEntry {
                path: step.directory.clone(),
                exit_code,
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn write_pipeline(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("pipeline.csv");
        fs::write(&path, contents).unwrap();
        path
    }

    fn serial_options() -> RunOptions {
        RunOptions {
            parallelism: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_groups_rows_by_sequence() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("network")).unwrap();
        fs::create_dir_all(root.join("app")).unwrap();
        let file = write_pipeline(
            root,
            &format!(
                "seq,directory,variables\n1,{0}/network,\n2,{0}/app,-var env=prod\n",
                root.display()
            ),
        );

        let pipeline = Pipeline::load(Operation::Plan, &file).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.sequences[&1].parallel.len(), 1);
        assert_eq!(
            pipeline.sequences[&2].parallel[0].variables,
            vec!["-var", "env=prod"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_load_routes_symlinked_directories_to_sequential() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("shared")).unwrap();
        std::os::unix::fs::symlink(root.join("shared"), root.join("alias")).unwrap();
        let file = write_pipeline(
            root,
            &format!(
                "seq,directory,variables\n1,{0}/shared,\n1,{0}/alias,\n",
                root.display()
            ),
        );

        let pipeline = Pipeline::load(Operation::Apply, &file).unwrap();
        let sequence = &pipeline.sequences[&1];
        assert_eq!(sequence.parallel.len(), 1);
        assert_eq!(sequence.sequential.len(), 1);
        assert_eq!(sequence.sequential[0].directory, root.join("alias"));
    }

    #[test]
    fn test_load_rejects_non_csv_files() {
        assert!(Pipeline::load(Operation::Plan, Path::new("/tmp/pipeline.yml")).is_err());
    }

    #[test]
    fn test_load_rejects_malformed_rows() {
        let tmp = TempDir::new().unwrap();
        let file = write_pipeline(tmp.path(), "seq,directory,variables\nfirst,/a,\n");
        assert!(Pipeline::load(Operation::Plan, &file).is_err());
    }

    #[test]
    fn test_sequences_run_in_ascending_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for dir in ["one", "two"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let file = write_pipeline(
            root,
            &format!(
                "seq,directory,variables\n2,{0}/two,\n1,{0}/one,\n",
                root.display()
            ),
        );

        let pipeline = Pipeline::load(Operation::Apply, &file).unwrap();
        let factory = ScriptedFactory::default();
        let summary = pipeline.execute(&factory, &serial_options()).unwrap();

        assert!(summary.success());
        assert_eq!(
            factory.executed(),
            vec![root.join("one"), root.join("two")]
        );
    }

    #[test]
    fn test_destroy_reverses_sequence_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for dir in ["base", "mid", "top"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let file = write_pipeline(
            root,
            &format!(
                "seq,directory,variables\n1,{0}/base,\n2,{0}/mid,\n3,{0}/top,\n",
                root.display()
            ),
        );

        let pipeline = Pipeline::load(Operation::Destroy, &file).unwrap();
        let factory = ScriptedFactory::default();
        pipeline.execute(&factory, &serial_options()).unwrap();

        assert_eq!(
            factory.executed(),
            vec![root.join("top"), root.join("mid"), root.join("base")]
        );
    }

    #[test]
    fn test_failed_sequence_stops_later_sequences() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for dir in ["first", "second"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let file = write_pipeline(
            root,
            &format!(
                "seq,directory,variables\n1,{0}/first,\n2,{0}/second,\n",
                root.display()
            ),
        );

        let pipeline = Pipeline::load(Operation::Apply, &file).unwrap();
        let factory = ScriptedFactory {
            fail_on: Some(root.join("first")),
            ..Default::default()
        };
        let summary = pipeline.execute(&factory, &serial_options()).unwrap();

        assert_eq!(summary.failures, vec![root.join("first")]);
        assert!(summary.not_applied.contains(&root.join("second")));
        assert!(!factory.executed().contains(&root.join("second")));
    }
}
