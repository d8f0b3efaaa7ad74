//! The CSV pipeline command.

use std::sync::Arc;

use anyhow::{Result, bail};
use dagflow::{Operation, RunOptions};
use dialoguer::Confirm;

use crate::Context;
use crate::cli::PipelineArgs;
use crate::config::envvars::{AwsCliParameterStore, CachedParameterStore};
use crate::entry::TfStepFactory;
use crate::pipeline::Pipeline;
use crate::ui;

pub fn run(ctx: &Context, args: PipelineArgs) -> Result<()> {
    let operation = Operation::from(args.operation);
    let pipeline = Pipeline::load(operation, &args.file)?;
    if pipeline.is_empty() {
        ui::warn(&format!("no entries in {}", args.file.display()));
        return Ok(());
    }
    let total = pipeline.len();
    if !ctx.quiet {
        ui::info(&format!(
            "{total} pipeline entries in {}",
            args.file.display()
        ));
    }

    if matches!(operation, Operation::Apply | Operation::Destroy) && !args.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Run {operation} across {total} pipeline entries from {}?",
                args.file.display()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::warn("aborted");
            return Ok(());
        }
    }

    let store = Arc::new(CachedParameterStore::new(Box::new(AwsCliParameterStore)));
    let factory = TfStepFactory {
        variables: args.tf_args.clone(),
        store,
    };
    let options = RunOptions {
        parallelism: args.jobs.max(1),
        debug: args.debug,
        print_only_changes: args.changes_only,
    };

    let summary = pipeline.execute(&factory, &options)?;

    super::run::print_summary(&summary);
    if !summary.success() {
        bail!(
            "{} of {total} pipeline entries failed: {}",
            summary.failures.len(),
            summary
                .failures
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if !ctx.quiet {
        ui::success(&format!("{operation} finished across {total} entries"));
    }
    Ok(())
}
