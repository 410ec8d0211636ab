//! Execution controls for built-in steps.
//!
//! Two reserved step ids get built-in handlers when execution controls are
//! enabled: `quality_checks` runs the configured hooks, `commit` commits the
//! worktree. Both require a capability flag and route every command through
//! `run_retryable`, which bounds attempts and truncates captured output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guide_core::config::{QualityHook, MAX_COMMAND_ATTEMPTS};
use guide_core::templates::{COMMIT_STEP, QUALITY_CHECKS_STEP};
use guide_core::{Config, Id};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::engine::{StepContext, StepOutcome};

/// Captured command output is cut to this many characters.
pub const OUTPUT_LIMIT: usize = 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("capability denied: step {step} requires {capability}")]
    CapabilityDenied {
        step: String,
        capability: &'static str,
    },
    #[error("command {name} failed after {attempts} attempt(s): {detail}")]
    CommandFailed {
        name: String,
        attempts: u32,
        detail: String,
    },
    #[error("invalid commit message: {0}")]
    InvalidCommitMessage(String),
    #[error("{0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// A single command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Label used in logs and errors.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl CommandRequest {
    /// A command line run through `sh -c`.
    pub fn shell(name: &str, command: &str, working_dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            working_dir: working_dir.to_path_buf(),
        }
    }
}

/// Result of one command attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: String,
    /// Runner asked for another attempt regardless of the exit code.
    pub retryable: bool,
    /// Set when the command could not be executed at all.
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            ..Self::default()
        }
    }

    /// Whether this attempt failed and should be tried again.
    pub fn needs_retry(&self) -> bool {
        self.retryable || self.error.is_some() || self.exit_code != 0
    }

    fn describe(&self) -> String {
        match &self.error {
            Some(error) => error.clone(),
            None if self.exit_code != 0 => format!("exit code {}", self.exit_code),
            None => "runner requested retry".to_string(),
        }
    }
}

/// Executes commands for built-in steps.
#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> CommandResult;
}

/// Runner that succeeds without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunner;

#[async_trait]
impl ExecutionRunner for NoopRunner {
    async fn run(&self, request: &CommandRequest) -> CommandResult {
        debug!(command = %request.name, "noop runner skipping command");
        CommandResult::success("")
    }
}

/// Runner that spawns real processes.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner {
    /// Per-command timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

#[async_trait]
impl ExecutionRunner for ShellRunner {
    async fn run(&self, request: &CommandRequest) -> CommandResult {
        debug!(command = %request.name, program = %request.program, "executing command");

        let mut process = Command::new(&request.program);
        process
            .args(&request.args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandResult {
                    exit_code: -1,
                    error: Some(format!("failed to spawn {}: {e}", request.program)),
                    ..CommandResult::default()
                }
            }
        };

        // Drain both pipes while the child runs; a full pipe blocks its writer.
        let stdout_reader = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_reader = tokio::spawn(read_pipe(child.stderr.take()));

        let waited = match self.timeout {
            Some(limit) => {
                tokio::select! {
                    result = child.wait() => result,
                    () = tokio::time::sleep(limit) => {
                        if let Err(e) = child.kill().await {
                            warn!(command = %request.name, error = %e, "failed to kill timed-out command");
                        }
                        let _ = child.wait().await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        return CommandResult {
                            exit_code: -1,
                            retryable: true,
                            error: Some(format!("timed out after {}s", limit.as_secs())),
                            ..CommandResult::default()
                        };
                    }
                }
            }
            None => child.wait().await,
        };

        let exit_code = match waited {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                stdout_reader.abort();
                stderr_reader.abort();
                return CommandResult {
                    exit_code: -1,
                    error: Some(e.to_string()),
                    ..CommandResult::default()
                };
            }
        };

        let stdout = stdout_reader.await.unwrap_or_default();
        let stderr = stderr_reader.await.unwrap_or_default();

        let mut output = String::from_utf8_lossy(&stdout).to_string();
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&String::from_utf8_lossy(&stderr));
        }

        CommandResult::failure(exit_code, output)
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// Cut `output` to at most `OUTPUT_LIMIT` characters.
pub fn truncate_output(output: &str) -> String {
    match output.char_indices().nth(OUTPUT_LIMIT) {
        Some((cut, _)) => output[..cut].to_string(),
        None => output.to_string(),
    }
}

/// Default commit message when none is configured.
pub fn default_commit_message(run_id: &Id) -> String {
    format!("chore(workflow): checkpoint run {run_id}")
}

/// Check the first line against `type(scope)!: subject`.
pub fn validate_commit_message(message: &str) -> Result<()> {
    let invalid = || ExecutionError::InvalidCommitMessage(message.to_string());
    let header = message.lines().next().unwrap_or_default();

    let Some((prefix, subject)) = header.split_once(": ") else {
        return Err(invalid());
    };
    if subject.trim().is_empty() {
        return Err(invalid());
    }

    let prefix = prefix.strip_suffix('!').unwrap_or(prefix);
    let kind = match prefix.split_once('(') {
        Some((kind, rest)) => {
            let scope = rest.strip_suffix(')').ok_or_else(invalid)?;
            if scope.is_empty() || scope.contains(['(', ')']) {
                return Err(invalid());
            }
            kind
        }
        None => prefix,
    };
    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(invalid());
    }
    Ok(())
}

/// Built-in step handlers and the retryable command primitive.
pub struct ExecutionControls {
    enabled: bool,
    allow_quality_checks: bool,
    allow_commit: bool,
    hooks: Vec<QualityHook>,
    max_attempts: u32,
    commit_message: Option<String>,
    working_dir: PathBuf,
    runner: Arc<dyn ExecutionRunner>,
}

impl std::fmt::Debug for ExecutionControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionControls")
            .field("enabled", &self.enabled)
            .field("allow_quality_checks", &self.allow_quality_checks)
            .field("allow_commit", &self.allow_commit)
            .field("hooks", &self.hooks)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for ExecutionControls {
    fn default() -> Self {
        Self::from_config(&Config::default(), Arc::new(NoopRunner))
    }
}

impl ExecutionControls {
    pub fn from_config(config: &Config, runner: Arc<dyn ExecutionRunner>) -> Self {
        Self {
            enabled: config.execution_controls,
            allow_quality_checks: config.allow_quality_checks,
            allow_commit: config.allow_commit,
            hooks: config.quality_hooks.clone(),
            max_attempts: config.effective_command_attempts(),
            commit_message: config.commit_message.clone(),
            working_dir: config.workspace_root.clone(),
            runner,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `step_id` is handled here rather than dispatched.
    pub fn handles(&self, step_id: &str) -> bool {
        self.enabled && (step_id == QUALITY_CHECKS_STEP || step_id == COMMIT_STEP)
    }

    /// Run the built-in handler for `ctx.step_id`, if there is one.
    pub async fn run_builtin(&self, ctx: &StepContext) -> Option<Result<StepOutcome>> {
        if !self.enabled {
            return None;
        }
        match ctx.step_id.as_str() {
            QUALITY_CHECKS_STEP => Some(self.quality_checks(ctx).await),
            COMMIT_STEP => Some(self.commit(ctx).await),
            _ => None,
        }
    }

    /// Run `request` up to the attempt cap; returns truncated output of the passing attempt.
    pub async fn run_retryable(&self, request: &CommandRequest) -> Result<String> {
        let max_attempts = self.max_attempts.clamp(1, MAX_COMMAND_ATTEMPTS);
        let mut detail = String::new();

        for attempt in 1..=max_attempts {
            debug!(command = %request.name, attempt, max_attempts, "running command");
            let result = self.runner.run(request).await;
            let output = truncate_output(&result.output);

            if !result.needs_retry() {
                return Ok(output);
            }

            detail = result.describe();
            if !output.is_empty() {
                detail = format!("{detail}: {output}");
            }
            warn!(
                command = %request.name,
                attempt,
                max_attempts,
                error = %result.describe(),
                "command attempt failed"
            );
        }

        Err(ExecutionError::CommandFailed {
            name: request.name.clone(),
            attempts: max_attempts,
            detail,
        })
    }

    async fn quality_checks(&self, ctx: &StepContext) -> Result<StepOutcome> {
        if !self.allow_quality_checks {
            return Err(ExecutionError::CapabilityDenied {
                step: ctx.step_id.clone(),
                capability: "allow_quality_checks",
            });
        }

        info!(run_id = %ctx.run_id, hooks = self.hooks.len(), "running quality checks");

        let mut summary = Vec::with_capacity(self.hooks.len());
        let mut skipped = 0usize;
        for hook in &self.hooks {
            let request = CommandRequest::shell(&hook.name, &hook.command, &self.working_dir);
            match self.run_retryable(&request).await {
                Ok(_) => summary.push(format!("{}: passed", hook.name)),
                Err(e) if !hook.required => {
                    warn!(run_id = %ctx.run_id, hook = %hook.name, error = %e, "optional quality hook failed, skipping");
                    summary.push(format!("{}: failed (optional, skipped)", hook.name));
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(StepOutcome {
            outcome: if skipped == 0 {
                "passed".to_string()
            } else {
                "passed_with_warnings".to_string()
            },
            output: Some(truncate_output(&summary.join("\n"))),
        })
    }

    async fn commit(&self, ctx: &StepContext) -> Result<StepOutcome> {
        if !self.allow_commit {
            return Err(ExecutionError::CapabilityDenied {
                step: ctx.step_id.clone(),
                capability: "allow_commit",
            });
        }

        let message = self
            .commit_message
            .clone()
            .unwrap_or_else(|| default_commit_message(&ctx.run_id));
        validate_commit_message(&message)?;

        info!(run_id = %ctx.run_id, message = %message, "committing worktree");

        let stage = CommandRequest {
            name: "git add".to_string(),
            program: "git".to_string(),
            args: vec!["add".to_string(), "--all".to_string()],
            working_dir: self.working_dir.clone(),
        };
        self.run_retryable(&stage).await?;

        let commit = CommandRequest {
            name: "git commit".to_string(),
            program: "git".to_string(),
            args: vec!["commit".to_string(), "-m".to_string(), message.clone()],
            working_dir: self.working_dir.clone(),
        };
        let output = self.run_retryable(&commit).await?;

        Ok(StepOutcome {
            outcome: "committed".to_string(),
            output: Some(if output.is_empty() { message } else { output }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Runner that replays scripted results and records every request.
    #[derive(Default)]
    struct ScriptedRunner {
        results: Mutex<VecDeque<CommandResult>>,
        requests: Mutex<Vec<CommandRequest>>,
    }

    impl ScriptedRunner {
        fn new(results: Vec<CommandResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExecutionRunner for ScriptedRunner {
        async fn run(&self, request: &CommandRequest) -> CommandResult {
            self.requests.lock().unwrap().push(request.clone());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| CommandResult::success("ok"))
        }
    }

    fn create_test_context(step_id: &str) -> StepContext {
        StepContext {
            run_id: Id::from_string("run-1"),
            template_id: "solid_phase_delivery".to_string(),
            workspace_id: "ws-1".to_string(),
            worktree_id: "wt-1".to_string(),
            phase_id: "deliver".to_string(),
            step_id: step_id.to_string(),
            prompt: String::new(),
            user_prompt: String::new(),
        }
    }

    fn controls(config: Config, runner: Arc<ScriptedRunner>) -> ExecutionControls {
        ExecutionControls::from_config(&config, runner)
    }

    fn enabled_config() -> Config {
        Config {
            execution_controls: true,
            allow_quality_checks: true,
            allow_commit: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn retryable_command_succeeds_on_second_attempt() {
        let runner = ScriptedRunner::new(vec![
            CommandResult::failure(1, "flaky"),
            CommandResult::success("done"),
        ]);
        let controls = controls(enabled_config(), Arc::clone(&runner));
        let request = CommandRequest::shell("tests", "cargo test", Path::new("."));

        let output = controls.run_retryable(&request).await.unwrap();
        assert_eq!(output, "done");
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn retryable_command_exhausts_attempts() {
        let runner = ScriptedRunner::new(vec![
            CommandResult {
                retryable: true,
                ..CommandResult::default()
            },
            CommandResult {
                error: Some("spawn failed".to_string()),
                ..CommandResult::default()
            },
            CommandResult::success("never reached"),
        ]);
        let controls = controls(enabled_config(), Arc::clone(&runner));
        let request = CommandRequest::shell("tests", "cargo test", Path::new("."));

        let err = controls.run_retryable(&request).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::CommandFailed { attempts: 2, .. }
        ));
        assert!(err.to_string().contains("spawn failed"));
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn attempts_are_hard_capped() {
        let runner = ScriptedRunner::new((0..10).map(|_| CommandResult::failure(2, "")).collect());
        let config = Config {
            command_max_attempts: 9,
            ..enabled_config()
        };
        let controls = controls(config, Arc::clone(&runner));
        let request = CommandRequest::shell("lint", "cargo clippy", Path::new("."));

        assert!(controls.run_retryable(&request).await.is_err());
        assert_eq!(runner.calls(), MAX_COMMAND_ATTEMPTS as usize);
    }

    #[test]
    fn output_is_truncated_by_characters() {
        let long = "é".repeat(OUTPUT_LIMIT + 10);
        let cut = truncate_output(&long);
        assert_eq!(cut.chars().count(), OUTPUT_LIMIT);
        assert_eq!(truncate_output("short"), "short");
    }

    #[tokio::test]
    async fn quality_checks_require_capability() {
        let runner = ScriptedRunner::new(vec![]);
        let config = Config {
            allow_quality_checks: false,
            ..enabled_config()
        };
        let controls = controls(config, Arc::clone(&runner));

        let result = controls
            .run_builtin(&create_test_context(QUALITY_CHECKS_STEP))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(ExecutionError::CapabilityDenied { .. })
        ));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn optional_hook_failure_is_skipped() {
        let runner = ScriptedRunner::new(vec![
            CommandResult::success("tests ok"),
            CommandResult::failure(1, "fmt diff"),
            CommandResult::failure(1, "fmt diff"),
        ]);
        let config = Config {
            quality_hooks: vec![
                QualityHook::required("tests", "cargo test"),
                QualityHook::optional("fmt", "cargo fmt --check"),
            ],
            ..enabled_config()
        };
        let controls = controls(config, Arc::clone(&runner));

        let outcome = controls
            .run_builtin(&create_test_context(QUALITY_CHECKS_STEP))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.outcome, "passed_with_warnings");
        assert!(outcome.output.unwrap().contains("fmt: failed"));
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn required_hook_failure_aborts() {
        let runner = ScriptedRunner::new(vec![
            CommandResult::failure(101, "test failed"),
            CommandResult::failure(101, "test failed"),
        ]);
        let config = Config {
            quality_hooks: vec![
                QualityHook::required("tests", "cargo test"),
                QualityHook::required("lint", "cargo clippy"),
            ],
            ..enabled_config()
        };
        let controls = controls(config, Arc::clone(&runner));

        let result = controls
            .run_builtin(&create_test_context(QUALITY_CHECKS_STEP))
            .await
            .unwrap();
        assert!(matches!(result, Err(ExecutionError::CommandFailed { ref name, .. }) if name == "tests"));
        // The lint hook never ran.
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn commit_rejects_bad_message_before_running() {
        let runner = ScriptedRunner::new(vec![]);
        let config = Config {
            commit_message: Some("fixed stuff".to_string()),
            ..enabled_config()
        };
        let controls = controls(config, Arc::clone(&runner));

        let result = controls
            .run_builtin(&create_test_context(COMMIT_STEP))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(ExecutionError::InvalidCommitMessage(_))
        ));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn commit_uses_default_message() {
        let runner = ScriptedRunner::new(vec![]);
        let controls = controls(enabled_config(), Arc::clone(&runner));

        let outcome = controls
            .run_builtin(&create_test_context(COMMIT_STEP))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.outcome, "committed");

        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1]
            .args
            .contains(&"chore(workflow): checkpoint run run-1".to_string()));
    }

    #[tokio::test]
    async fn disabled_controls_have_no_builtins() {
        let runner = ScriptedRunner::new(vec![]);
        let controls = controls(Config::default(), Arc::clone(&runner));
        assert!(!controls.handles(COMMIT_STEP));
        assert!(controls
            .run_builtin(&create_test_context(COMMIT_STEP))
            .await
            .is_none());
    }

    #[test]
    fn conventional_commit_grammar() {
        for ok in [
            "feat: add runs",
            "fix(engine): stop double advance",
            "refactor(api)!: rename endpoints",
            "chore!: drop legacy matcher",
            "docs(readme): explain\n\nlonger body",
        ] {
            assert!(validate_commit_message(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "add runs",
            "Feat: add runs",
            "feat(): empty scope",
            "feat(a(b)): nested",
            "feat:",
            "feat: ",
            "feat:missing space",
        ] {
            assert!(validate_commit_message(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn shell_runner_captures_output_and_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ShellRunner::default();

        let ok = runner
            .run(&CommandRequest::shell("echo", "echo hello", dir.path()))
            .await;
        assert_eq!(ok.exit_code, 0);
        assert!(ok.output.contains("hello"));
        assert!(!ok.needs_retry());

        let failed = runner
            .run(&CommandRequest::shell("fail", "echo oops >&2; exit 3", dir.path()))
            .await;
        assert_eq!(failed.exit_code, 3);
        assert!(failed.output.contains("oops"));
        assert!(failed.needs_retry());
    }

    #[tokio::test]
    async fn shell_runner_drains_output_larger_than_a_pipe_buffer() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ShellRunner {
            timeout: Some(Duration::from_secs(20)),
        };

        let result = runner
            .run(&CommandRequest::shell(
                "noisy",
                "head -c 200000 /dev/zero | tr '\\0' x; head -c 100000 /dev/zero | tr '\\0' y >&2; exit 0",
                dir.path(),
            ))
            .await;
        assert_eq!(result.error, None);
        assert_eq!(result.exit_code, 0);
        assert!(!result.needs_retry());
        assert_eq!(result.output.len(), 200_000 + 1 + 100_000);
        assert!(result.output.starts_with('x'));
        assert!(result.output.ends_with('y'));
    }

    #[tokio::test]
    async fn shell_runner_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ShellRunner {
            timeout: Some(Duration::from_millis(50)),
        };
        let result = runner
            .run(&CommandRequest::shell("sleep", "sleep 5", dir.path()))
            .await;
        assert!(result.retryable);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
