//! Terraform subprocess adapter.
//!
//! Each node execution is an `init` followed by the requested operation.
//! `apply` is gated behind a `plan -detailed-exitcode` into a plan file so
//! nothing runs when there is nothing to change. Transient network errors
//! are retried with jittered backoff under a wall-clock budget.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use dagflow::{ExecutionResult, Operation};
use rand::Rng;

/// Line Terraform prints when an apply or destroy touched nothing.
pub const NO_CHANGES_MARKER: &str = "Resources: 0 added, 0 changed, 0 destroyed";

/// `plan -detailed-exitcode` convention: 0 = no changes, 2 = changes
/// pending, anything else = error.
const DETAILED_EXIT_CHANGES: i32 = 2;

const MAX_RETRIES: u32 = 5;
const RETRY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Substrings identifying transient failures worth retrying.
const RETRIABLE_ERRORS: [&str; 10] = [
    "RequestError: send request failed",
    "unexpected EOF",
    "Throttling",
    "timeout while waiting for state",
    "ServiceUnavailable: Service Unavailable",
    "failed to decode query XML error response",
    "connection reset by peer",
    "Please try again.",
    "Client.Timeout exceeded",
    "Request limit for operation",
];

/// A fully-resolved Terraform invocation for one directory.
#[derive(Debug)]
pub struct TerraformCommand {
    pub working_dir: PathBuf,
    /// Extra arguments appended to every operation (not to `init`).
    pub variables: Vec<String>,
    /// `-reconfigure` / `-backend-config=...` flags for `init`.
    pub backend_args: Vec<String>,
    /// Resolved environment. `None` removes the variable from the child.
    pub envvars: BTreeMap<String, Option<String>>,
}

impl TerraformCommand {
    /// Run `init` then the operation, concatenating output with a blank
    /// separator line. A failed `init` aborts immediately and is treated
    /// as "changes detected" since the state is unknown.
    pub fn run(&self, operation: Operation, debug: bool) -> Result<ExecutionResult> {
        let mut init_args = vec!["init".to_string()];
        init_args.extend(self.backend_args.iter().cloned());
        let (init_code, mut output) = self.execute(&init_args, debug)?;
        if init_code != 0 {
            return Ok(ExecutionResult {
                exit_code: init_code,
                output,
                changes_detected: true,
            });
        }
        output.push(String::new());

        let ExecutionResult {
            exit_code,
            output: operation_output,
            changes_detected,
        } = match operation {
            Operation::Plan => self.run_plan(debug)?,
            Operation::Apply => self.run_apply(debug)?,
            Operation::Destroy => self.run_destroy(debug)?,
        };
        output.extend(operation_output);
        Ok(ExecutionResult {
            exit_code,
            output,
            changes_detected,
        })
    }

    fn run_plan(&self, debug: bool) -> Result<ExecutionResult> {
        let mut args = vec!["plan".to_string(), "-detailed-exitcode".to_string()];
        args.extend(self.variables.iter().cloned());
        let (code, output) = self.execute(&args, debug)?;
        let (exit_code, changes_detected) = normalize_plan_exit(code);
        Ok(ExecutionResult {
            exit_code,
            output,
            changes_detected,
        })
    }

    fn run_apply(&self, debug: bool) -> Result<ExecutionResult> {
        let plan_file = tempfile::Builder::new()
            .prefix("tfplan-")
            .tempfile()
            .context("failed to create plan file")?;
        let plan_path = plan_file.path().to_string_lossy().into_owned();

        let mut plan_args = vec![
            "plan".to_string(),
            "-detailed-exitcode".to_string(),
            format!("-out={plan_path}"),
        ];
        plan_args.extend(self.variables.iter().cloned());
        let (plan_code, mut output) = self.execute(&plan_args, debug)?;

        if plan_code == 0 {
            // Nothing to apply.
            return Ok(ExecutionResult {
                exit_code: 0,
                output,
                changes_detected: false,
            });
        }
        if plan_code != DETAILED_EXIT_CHANGES {
            return Ok(ExecutionResult {
                exit_code: plan_code,
                output,
                changes_detected: true,
            });
        }

        output.push(String::new());
        let apply_args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            plan_path,
        ];
        let (apply_code, apply_output) = self.execute(&apply_args, debug)?;
        let changes_detected = !contains_no_changes_marker(&apply_output);
        output.extend(apply_output);
        Ok(ExecutionResult {
            exit_code: apply_code,
            output,
            changes_detected,
        })
    }

    fn run_destroy(&self, debug: bool) -> Result<ExecutionResult> {
        let mut args = vec!["destroy".to_string(), "-auto-approve".to_string()];
        args.extend(self.variables.iter().cloned());
        let (code, output) = self.execute(&args, debug)?;
        let changes_detected = !contains_no_changes_marker(&output);
        Ok(ExecutionResult {
            exit_code: code,
            output,
            changes_detected,
        })
    }

    /// Execute one Terraform subcommand, retrying transient failures.
    fn execute(&self, args: &[String], debug: bool) -> Result<(i32, Vec<String>)> {
        let started = Instant::now();
        let mut jitter = Jitter::new();
        let mut tries = 0;
        loop {
            let (exit_code, output) = self.execute_once(args, debug)?;
            tries += 1;

            let retriable = retriable_errors(&output);
            if exit_code == 0 || retriable.is_empty() || tries >= MAX_RETRIES {
                return Ok((exit_code, output));
            }
            log::warn!(
                "transient errors running terraform {} in {}: {retriable:?}",
                args.join(" "),
                self.working_dir.display()
            );
            if started.elapsed() >= RETRY_TIMEOUT {
                bail!(
                    "timed out retrying terraform {} in {}",
                    args.join(" "),
                    self.working_dir.display()
                );
            }
            std::thread::sleep(jitter.backoff());
        }
    }

    fn execute_once(&self, args: &[String], debug: bool) -> Result<(i32, Vec<String>)> {
        let mut command = Command::new("terraform");
        command.args(args).current_dir(&self.working_dir);
        for (name, value) in &self.envvars {
            match value {
                Some(value) => {
                    command.env(name, value);
                }
                None => {
                    command.env_remove(name);
                }
            }
        }
        if debug {
            command.env("TF_LOG", "DEBUG");
        }

        let output = command.output().with_context(|| {
            format!(
                "failed to launch terraform {} in {}",
                args.join(" "),
                self.working_dir.display()
            )
        })?;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        Ok((output.status.code().unwrap_or(1), lines))
    }
}

/// Normalize a bare `plan -detailed-exitcode` result: "changes pending" is
/// not a failure, but it is a change.
fn normalize_plan_exit(code: i32) -> (i32, bool) {
    match code {
        0 => (0, false),
        code if code == DETAILED_EXIT_CHANGES => (0, true),
        code => (code, true),
    }
}

fn contains_no_changes_marker(output: &[String]) -> bool {
    output.iter().any(|line| line.contains(NO_CHANGES_MARKER))
}

fn retriable_errors(output: &[String]) -> Vec<&'static str> {
    RETRIABLE_ERRORS
        .iter()
        .copied()
        .filter(|error| output.iter().any(|line| line.contains(error)))
        .collect()
}

/// Exponential backoff with full jitter, capped at one minute per wait.
struct Jitter {
    iteration: u32,
}

impl Jitter {
    fn new() -> Self {
        Self { iteration: 0 }
    }

    fn backoff(&mut self) -> Duration {
        let ceiling = (100u64 << self.iteration.min(16)).min(60_000);
        self.iteration += 1;
        let millis = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(millis)
    }
}
