// Shell-command executors - the capability behind dispatch transitions

//! # Executors
//!
//! An executor takes a command line plus options and answers with
//! `(job_id, success)`. Batch schedulers submit and return the scheduler's
//! job id; [`ForkExecutor`] runs the command locally and returns the child
//! pid. Either way dispatch is *submission*: whether the job ultimately
//! succeeds comes back later through the job's own response tokens.

use async_trait::async_trait;
use std::process::Stdio;
use tracing::{debug, error, info};

use crate::protocol::ExecutorOptions;
use crate::Result;

/// The capability the dispatch handler is wired with:
/// `(command_line, options) -> (job_id, success)`
#[async_trait]
pub trait ShellCommandExecutor: Send + Sync {
    async fn execute(&self, command_line: &[String], options: &ExecutorOptions)
        -> Result<(u64, bool)>;
}

/// Run the command locally via fork/exec.
///
/// Applies working directory, environment and stdio redirections from the
/// options; scheduler-only options (queue, rlimits, uid/gid) are logged and
/// ignored. The child is reaped in the background so dispatch can answer
/// immediately with the pid.
#[derive(Debug, Default)]
pub struct ForkExecutor;

impl ForkExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ShellCommandExecutor for ForkExecutor {
    async fn execute(
        &self,
        command_line: &[String],
        options: &ExecutorOptions,
    ) -> Result<(u64, bool)> {
        let program = match command_line.first() {
            Some(program) => program,
            None => {
                error!("refusing to execute an empty command line");
                return Ok((0, false));
            }
        };

        let mut command = tokio::process::Command::new(program);
        command.args(&command_line[1..]);

        if let Some(working_directory) = &options.working_directory {
            command.current_dir(working_directory);
        }
        command.envs(&options.environment);

        command.stdin(match &options.stdin {
            Some(path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        });
        command.stdout(match &options.stdout {
            Some(path) => Stdio::from(std::fs::File::create(path)?),
            None => Stdio::null(),
        });
        command.stderr(match &options.stderr {
            Some(path) => Stdio::from(std::fs::File::create(path)?),
            None => Stdio::null(),
        });

        if options.queue.is_some() || options.user_id.is_some() || options.group_id.is_some() {
            debug!(
                queue = ?options.queue,
                user_id = ?options.user_id,
                group_id = ?options.group_id,
                "scheduler-only options ignored by the fork executor"
            );
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(%program, error = %e, "failed to spawn command");
                return Ok((0, false));
            }
        };

        let job_id = child.id().unwrap_or(0) as u64;
        info!(%program, job_id, "forked shell command");

        // Reap in the background; the exit status travels back through the
        // job's own response tokens, not through dispatch.
        let program = program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%program, %status, "child exited"),
                Err(e) => error!(%program, error = %e, "failed to reap child"),
            }
        });

        Ok((job_id, true))
    }
}
