//! Graph entries backed by real Terraform invocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dagflow::{Entry, EntryFactory, ExecutionResult, GraphEntry, Operation};

use crate::config::envvars::{ParameterStore, resolve_envvars};
use crate::config::resolver::{
    calc_backend_config, parse_backend_config_for_dir, parse_variable_files,
    parse_wrapper_configs,
};
use crate::paths;
use crate::pipeline::{PipelineStep, StepFactory};
use crate::tf::TerraformCommand;

/// One schedulable Terraform directory with its configuration fully
/// resolved up front. Resolution happens on the scheduling thread so
/// worker threads only ever run the subprocess.
pub struct TfEntry {
    command: TerraformCommand,
}

impl TfEntry {
    pub fn new(
        path: &Path,
        variables: Vec<String>,
        store: &dyn ParameterStore,
    ) -> Result<Self> {
        let wrapper_config = parse_wrapper_configs(path)?;
        let envvars = resolve_envvars(&wrapper_config.envvars, store)?;

        let backend_args = if wrapper_config.configure_backend {
            match parse_backend_config_for_dir(path)? {
                Some(existing) => {
                    let tfvars = parse_variable_files(path)?;
                    let repo_path = paths::calc_repo_path(path)?;
                    calc_backend_config(&repo_path, &tfvars, &wrapper_config, Some(&existing))
                }
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            command: TerraformCommand {
                working_dir: path.to_path_buf(),
                variables,
                backend_args,
                envvars,
            },
        })
    }
}

impl Entry for TfEntry {
    fn path(&self) -> &Path {
        &self.command.working_dir
    }

    fn execute(&self, operation: Operation, debug: bool) -> Result<ExecutionResult> {
        log::info!("executing {} {operation}", self.path().display());
        self.command.run(operation, debug)
    }
}

/// Builds entries as the scheduler reaches nodes, applying the run's
/// scope: nodes outside the requested prefix become no-ops that satisfy
/// their successors' gates without executing anything.
pub struct TfEntryFactory {
    pub prefix: Option<PathBuf>,
    pub variables: Vec<String>,
    pub store: Arc<dyn ParameterStore>,
}

impl TfEntryFactory {
    fn in_scope(&self, path: &Path) -> bool {
        self.prefix
            .as_ref()
            .is_none_or(|prefix| path.starts_with(prefix))
    }
}

impl EntryFactory for TfEntryFactory {
    fn create(&self, path: &Path) -> Result<GraphEntry> {
        if !self.in_scope(path) {
            return Ok(GraphEntry::NoOp(path.to_path_buf()));
        }
        let entry = TfEntry::new(path, self.variables.clone(), self.store.as_ref())
            .with_context(|| format!("failed to prepare {}", path.display()))?;
        Ok(GraphEntry::Live(Box::new(entry)))
    }
}

/// Builds pipeline steps the same way graph nodes are built. Row-level
/// variables extend the run-wide ones.
pub struct TfStepFactory {
    pub variables: Vec<String>,
    pub store: Arc<dyn ParameterStore>,
}

impl StepFactory for TfStepFactory {
    fn create(&self, step: &PipelineStep) -> Result<Box<dyn Entry>> {
        let mut variables = self.variables.clone();
        variables.extend(step.variables.iter().cloned());
        let entry = TfEntry::new(&step.directory, variables, self.store.as_ref())?;
        Ok(Box::new(entry))
    }
}
