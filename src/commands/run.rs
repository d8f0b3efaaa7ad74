//! The plan/apply/destroy run command.

use std::sync::Arc;

use anyhow::{Result, bail};
use dagflow::{GraphRunner, Operation, RunOptions, RunSummary};
use dialoguer::Confirm;

use crate::Context;
use crate::audit;
use crate::cli::RunArgs;
use crate::config::envvars::{AwsCliParameterStore, CachedParameterStore};
use crate::entry::TfEntryFactory;
use crate::graph::GraphBuilder;
use crate::paths;
use crate::plugins;
use crate::ui;

pub fn run(ctx: &Context, operation: Operation, args: RunArgs) -> Result<()> {
    let root = paths::get_absolute_path(&args.directory)?;
    let prefix = args
        .prefix
        .as_deref()
        .map(paths::get_absolute_path)
        .transpose()?;

    let mut builder = GraphBuilder::new();
    let tree = builder.build(&root)?;
    let total = tree.graph.len() + tree.post_graph.len();
    if total == 0 {
        ui::warn(&format!(
            "no Terraform directories found under {}",
            root.display()
        ));
        return Ok(());
    }
    if !ctx.quiet {
        ui::info(&format!(
            "{} directories in the dependency graph, {} outside it",
            tree.graph.len(),
            tree.post_graph.len()
        ));
    }

    if matches!(operation, Operation::Apply | Operation::Destroy) && !args.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Run {operation} across {total} directories under {}?",
                root.display()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::warn("aborted");
            return Ok(());
        }
    }

    let root_config = builder.config_for(&root)?;
    plugins::download_plugins(&root_config.plugins)?;

    // Destroy runs dependents before their dependencies.
    let graph = if operation == Operation::Destroy {
        tree.graph.reversed()
    } else {
        tree.graph
    };

    let store = Arc::new(CachedParameterStore::new(Box::new(AwsCliParameterStore)));
    let factory = TfEntryFactory {
        prefix,
        variables: args.tf_args.clone(),
        store,
    };
    let options = RunOptions {
        parallelism: args.jobs.max(1),
        debug: args.debug,
        print_only_changes: args.changes_only,
    };

    let mut runner = GraphRunner::new(&graph, &factory, operation, options);
    let mut summary = runner.execute_graph()?;
    summary.merge(runner.execute_post_graph(&tree.post_graph)?);

    if let Some(url) = &args.audit_api {
        audit::post_run_record(url, operation, &root, &summary);
    }

    print_summary(&summary);
    if !summary.success() {
        bail!(
            "{} of {total} directories failed: {}",
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
        ui::success(&format!("{operation} finished across {total} directories"));
    }
    Ok(())
}

pub(crate) fn print_summary(summary: &RunSummary) {
    ui::header("Run summary");
    ui::kv("applied", &summary.applied.len().to_string());
    ui::kv("not applied", &summary.not_applied.len().to_string());
    ui::kv("failed", &summary.failures.len().to_string());

    if !summary.not_applied.is_empty() {
        ui::section("Not applied");
        let mut skipped: Vec<_> = summary.not_applied.iter().collect();
        skipped.sort();
        for dir in skipped {
            ui::dim(&dir.display().to_string());
        }
    }
    if !summary.failures.is_empty() {
        ui::section("Failures");
        for dir in &summary.failures {
            ui::error(&dir.display().to_string());
        }
    }
}
