//! Execution engine for confirmed actions.
//!
//! Every apply gets a fresh workspace. Resource types with a dedicated driver
//! are provisioned through it; everything else is handed to Terraform
//! (`init`, `apply`, `output`) running inside the workspace.
//!
//! Temporary credentials reach Terraform only through the child process
//! environment. No credentials file is ever rendered.
//!
//! Workspaces are never cleaned up inline, whatever the outcome; the janitor
//! reaps them once they age out.

use crate::action_ledger::PendingAction;
use crate::config::Config;
use crate::credential_broker::TemporaryCredentials;
use crate::error::BridgeError;
use crate::plan_generator::{ExecutionStrategy, MANAGED_BY_TAG};
use crate::resource_driver::{BucketConnector, S3BucketDriver, S3Connector};
use crate::workspace::{Workspace, WorkspaceState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

/// Longest slice of tool output carried in an error message.
const OUTPUT_TAIL_CHARS: usize = 4000;
/// How long to wait for output pipes to drain after killing a child.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Structured result of a successful apply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub resource_id: String,
    pub outputs: BTreeMap<String, String>,
    pub workspace_id: Option<String>,
}

// =============================================================================
// Traits for Dependency Injection
// =============================================================================

/// A single external program invocation.
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
    pub cwd: &'a Path,
    pub env: &'a [(&'static str, String)],
    pub timeout: Duration,
}

/// Captured result of an [`Invocation`].
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Trait for running external processes.
///
/// This abstraction enables testing without spawning real processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the invocation to completion or until its timeout elapses.
    async fn run(&self, invocation: &Invocation<'_>) -> Result<ProcessOutput, BridgeError>;

    /// Checks if a program exists in PATH.
    fn program_exists(&self, program: &str) -> bool;
}

// =============================================================================
// Default Implementations
// =============================================================================

/// Process runner backed by `tokio::process`.
pub struct SystemProcessRunner;

async fn drain<R>(reader: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        // Whatever was read before an error is still worth reporting.
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<ProcessOutput, BridgeError> {
        let mut cmd = tokio::process::Command::new(invocation.program);
        cmd.args(invocation.args)
            .current_dir(invocation.cwd)
            .envs(invocation.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::provisioning(format!("Failed to start {}: {}", invocation.program, e)))?;
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let (status, timed_out) = match tokio::time::timeout(invocation.timeout, child.wait()).await {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                warn!(
                    "{} exceeded {}s, killing it",
                    invocation.program,
                    invocation.timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill {}: {}", invocation.program, e);
                }
                (None, true)
            }
        };

        let stdout = tokio::time::timeout(DRAIN_GRACE, stdout_task)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let stderr = tokio::time::timeout(DRAIN_GRACE, stderr_task)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        Ok(ProcessOutput {
            success: status.map(|s| s.success()).unwrap_or(false),
            exit_code: status.and_then(|s| s.code()),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
        })
    }

    fn program_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

// =============================================================================
// Engine Implementation
// =============================================================================

#[derive(Debug, Deserialize)]
struct TerraformOutput {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// Realizes staged actions against the remote account.
pub struct ExecutionEngine {
    workspace_root: PathBuf,
    terraform_binary: String,
    tool_timeout: Duration,
    runner: Arc<dyn ProcessRunner>,
    bucket_driver: S3BucketDriver,
}

impl ExecutionEngine {
    pub fn new(config: &Config) -> Self {
        Self::with_deps(
            config.workspace_root(),
            config.terraform_binary.clone(),
            config.tool_timeout(),
            Arc::new(SystemProcessRunner),
            Arc::new(S3Connector),
        )
    }

    /// Creates an engine with injected dependencies (for testing).
    pub fn with_deps(
        workspace_root: PathBuf,
        terraform_binary: String,
        tool_timeout: Duration,
        runner: Arc<dyn ProcessRunner>,
        connector: Arc<dyn BucketConnector>,
    ) -> Self {
        Self {
            workspace_root,
            terraform_binary,
            tool_timeout,
            runner,
            bucket_driver: S3BucketDriver::new(connector),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Executes a consumed action with freshly assumed credentials.
    pub async fn apply(
        &self,
        action: &PendingAction,
        credentials: &TemporaryCredentials,
    ) -> Result<ApplyOutcome, BridgeError> {
        let region = action
            .resource_config
            .get("region")
            .and_then(|r| r.as_str())
            .ok_or_else(|| BridgeError::internal("Staged action has no region"))?
            .to_string();

        let mut workspace = Workspace::create(&self.workspace_root, &action.action_id, action.resource_type)?;
        workspace.render("main.tf", &action.rendered_artifact)?;
        workspace.render("provider.tf", &render_provider(&region))?;

        info!(
            "Applying {} action {} in {}",
            action.resource_type.label(),
            action.action_id,
            workspace.id
        );
        workspace.transition(WorkspaceState::Executing);

        let result = match action.resource_type.strategy() {
            ExecutionStrategy::Driver => self.bucket_driver.provision(&action.resource_config, credentials).await,
            ExecutionStrategy::Tool => self.run_terraform(&workspace, credentials, &region).await,
        };

        match result {
            Ok(mut outcome) => {
                workspace.transition(WorkspaceState::Completed);
                outcome.workspace_id = Some(workspace.id.clone());
                info!("Action {} completed: {}", action.action_id, outcome.resource_id);
                Ok(outcome)
            }
            Err(e) => {
                workspace.transition(WorkspaceState::Failed);
                error!("Action {} failed in {}: {}", action.action_id, workspace.id, e);
                Err(e)
            }
        }
    }

    async fn run_terraform(
        &self,
        workspace: &Workspace,
        credentials: &TemporaryCredentials,
        region: &str,
    ) -> Result<ApplyOutcome, BridgeError> {
        if !self.runner.program_exists(&self.terraform_binary) {
            return Err(BridgeError::provisioning_with_hint(
                format!("'{}' was not found on PATH. No changes were made.", self.terraform_binary),
                "Install Terraform (https://developer.hashicorp.com/terraform/install) or set terraform_binary in ~/.skyward/config.toml.",
            ));
        }

        let env = credential_env(credentials, region);
        let deadline = Instant::now() + self.tool_timeout;

        self.terraform_step(workspace, &env, deadline, &["init", "-input=false", "-no-color"])
            .await?;
        self.terraform_step(workspace, &env, deadline, &["apply", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        let output = self
            .terraform_step(workspace, &env, deadline, &["output", "-json", "-no-color"])
            .await?;

        let outputs = parse_outputs(&output.stdout)?;
        let resource_id = outputs
            .get("id")
            .or_else(|| outputs.get("arn"))
            .cloned()
            .unwrap_or_else(|| workspace.id.clone());

        Ok(ApplyOutcome {
            resource_id,
            outputs,
            workspace_id: None,
        })
    }

    async fn terraform_step(
        &self,
        workspace: &Workspace,
        env: &[(&'static str, String)],
        deadline: Instant,
        args: &[&str],
    ) -> Result<ProcessOutput, BridgeError> {
        let step = args[0];
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error(step, self.tool_timeout, &ProcessOutput::default()));
        }

        info!("Running terraform {} in {}", step, workspace.id);
        let output = self
            .runner
            .run(&Invocation {
                program: &self.terraform_binary,
                args,
                cwd: &workspace.directory,
                env,
                timeout: remaining,
            })
            .await?;

        if output.timed_out {
            return Err(timeout_error(step, self.tool_timeout, &output));
        }
        if !output.success {
            let mut message = format!(
                "terraform {} failed (exit code {}):\n{}",
                step,
                output.exit_code.map_or("unknown".to_string(), |c| c.to_string()),
                tail(&combined(&output), OUTPUT_TAIL_CHARS)
            );
            if step == "apply" {
                message.push_str("\nSome resources may have been created before the failure; they were NOT rolled back.");
            }
            return Err(BridgeError::provisioning(message));
        }
        Ok(output)
    }
}

fn timeout_error(step: &str, limit: Duration, output: &ProcessOutput) -> BridgeError {
    BridgeError::provisioning_with_hint(
        format!(
            "terraform {} did not finish within {}s and was stopped. Partial output:\n{}",
            step,
            limit.as_secs(),
            tail(&combined(output), OUTPUT_TAIL_CHARS)
        ),
        "Resources may have been partially created. Check the account before requesting the change again.",
    )
}

/// Provider configuration scoped to one workspace. Holds no secrets.
fn render_provider(region: &str) -> String {
    format!(
        r#"terraform {{
  required_providers {{
    aws = {{
      source  = "hashicorp/aws"
      version = "~> 5.0"
    }}
    archive = {{
      source  = "hashicorp/archive"
      version = "~> 2.4"
    }}
  }}
}}

provider "aws" {{
  region = "{region}"

  default_tags {{
    tags = {{
      "{tag_key}" = "{tag_value}"
    }}
  }}
}}
"#,
        region = region,
        tag_key = MANAGED_BY_TAG.0,
        tag_value = MANAGED_BY_TAG.1
    )
}

fn credential_env(credentials: &TemporaryCredentials, region: &str) -> Vec<(&'static str, String)> {
    vec![
        ("AWS_ACCESS_KEY_ID", credentials.access_key_id.clone()),
        ("AWS_SECRET_ACCESS_KEY", credentials.secret_access_key.clone()),
        ("AWS_SESSION_TOKEN", credentials.session_token.clone()),
        ("AWS_REGION", region.to_string()),
        ("AWS_DEFAULT_REGION", region.to_string()),
        ("TF_IN_AUTOMATION", "1".to_string()),
        ("TF_INPUT", "0".to_string()),
    ]
}

fn parse_outputs(stdout: &str) -> Result<BTreeMap<String, String>, BridgeError> {
    let raw: HashMap<String, TerraformOutput> = serde_json::from_str(stdout).map_err(|e| {
        BridgeError::provisioning(format!(
            "Resources were applied but terraform outputs could not be read: {}",
            e
        ))
    })?;
    Ok(raw
        .into_iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                "<sensitive>".to_string()
            } else {
                match output.value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }
            };
            (name, value)
        })
        .collect())
}

fn combined(output: &ProcessOutput) -> String {
    match (output.stdout.trim().is_empty(), output.stderr.trim().is_empty()) {
        (true, true) => "(no output)".to_string(),
        (false, true) => output.stdout.clone(),
        (true, false) => output.stderr.clone(),
        (false, false) => format!("{}\n{}", output.stdout, output.stderr),
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan_generator::{PlanGenerator, ResourceType};
    use crate::resource_driver::tests::{credentials, FixedConnector, RecordingBucketApi};
    use crate::workspace::RECORD_FILE;
    use std::sync::Mutex;

    // =========================================================================
    // Mock implementations
    // =========================================================================

    #[derive(Debug, Clone)]
    struct RecordedCall {
        program: String,
        args: Vec<String>,
        cwd: PathBuf,
        env_keys: Vec<&'static str>,
    }

    /// Mock runner that answers per terraform subcommand.
    struct MockProcessRunner {
        installed: bool,
        responses: HashMap<&'static str, ProcessOutput>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl MockProcessRunner {
        fn healthy() -> Self {
            let mut responses = HashMap::new();
            responses.insert("init", ok("Terraform has been successfully initialized!"));
            responses.insert("apply", ok("Apply complete! Resources: 1 added, 0 changed, 0 destroyed."));
            responses.insert(
                "output",
                ok(r#"{"id":{"sensitive":false,"type":"string","value":"https://sqs.us-east-1.amazonaws.com/1/q"},
                       "arn":{"sensitive":false,"type":"string","value":"arn:aws:sqs:us-east-1:1:q"},
                       "secret":{"sensitive":true,"type":"string","value":"hunter2"}}"#),
            );
            Self {
                installed: true,
                responses,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with(mut self, step: &'static str, output: ProcessOutput) -> Self {
            self.responses.insert(step, output);
            self
        }

        fn missing() -> Self {
            Self {
                installed: false,
                ..Self::healthy()
            }
        }

        fn steps(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.args[0].clone()).collect()
        }
    }

    fn ok(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            success: true,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    #[async_trait]
    impl ProcessRunner for MockProcessRunner {
        async fn run(&self, invocation: &Invocation<'_>) -> Result<ProcessOutput, BridgeError> {
            self.calls.lock().unwrap().push(RecordedCall {
                program: invocation.program.to_string(),
                args: invocation.args.iter().map(|a| a.to_string()).collect(),
                cwd: invocation.cwd.to_path_buf(),
                env_keys: invocation.env.iter().map(|(k, _)| *k).collect(),
            });
            Ok(self.responses.get(invocation.args[0]).cloned().unwrap_or_default())
        }

        fn program_exists(&self, _program: &str) -> bool {
            self.installed
        }
    }

    fn staged(message: &str) -> PendingAction {
        let plan = PlanGenerator::new("us-east-1").generate(message);
        PendingAction {
            action_id: "0190f5c2-0000-7000-8000-000000000000".to_string(),
            request: message.to_string(),
            resource_type: plan.resource_type.unwrap(),
            resource_config: plan.resource_config,
            rendered_artifact: plan.rendered_artifact,
            created_at: 0,
        }
    }

    fn engine(root: &Path, runner: Arc<MockProcessRunner>, bucket: Arc<RecordingBucketApi>) -> ExecutionEngine {
        ExecutionEngine::with_deps(
            root.to_path_buf(),
            "terraform".to_string(),
            Duration::from_secs(300),
            runner,
            Arc::new(FixedConnector(bucket)),
        )
    }

    fn record_state(dir: &Path) -> String {
        let record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join(RECORD_FILE)).unwrap()).unwrap();
        record["state"].as_str().unwrap().to_string()
    }

    // =========================================================================
    // Terraform path
    // =========================================================================

    #[tokio::test]
    async fn test_tool_path_runs_init_apply_output() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockProcessRunner::healthy());
        let engine = engine(root.path(), runner.clone(), Arc::new(RecordingBucketApi::default()));

        let outcome = engine.apply(&staged("create an sqs queue"), &credentials()).await.unwrap();

        assert_eq!(runner.steps(), vec!["init", "apply", "output"]);
        assert_eq!(outcome.resource_id, "https://sqs.us-east-1.amazonaws.com/1/q");
        assert_eq!(outcome.outputs["arn"], "arn:aws:sqs:us-east-1:1:q");
        assert_eq!(outcome.outputs["secret"], "<sensitive>");

        let ws_dir = root.path().join(outcome.workspace_id.unwrap());
        let calls = runner.calls.lock().unwrap();
        assert!(calls.iter().all(|c| c.cwd == ws_dir && c.program == "terraform"));
        assert!(calls[0].env_keys.contains(&"AWS_SESSION_TOKEN"));
        assert_eq!(record_state(&ws_dir), "completed");
    }

    #[tokio::test]
    async fn test_rendered_files_hold_no_credentials() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockProcessRunner::healthy());
        let engine = engine(root.path(), runner, Arc::new(RecordingBucketApi::default()));

        let outcome = engine.apply(&staged("create a dynamodb table"), &credentials()).await.unwrap();

        let ws_dir = root.path().join(outcome.workspace_id.unwrap());
        for file in ["main.tf", "provider.tf", RECORD_FILE] {
            let contents = std::fs::read_to_string(ws_dir.join(file)).unwrap();
            assert!(!contents.contains("ASIATEST"), "{} leaks access key", file);
            assert!(!contents.contains("test-secret-value"), "{} leaks secret", file);
            assert!(!contents.contains("test-session-token"), "{} leaks token", file);
        }
        let provider = std::fs::read_to_string(ws_dir.join("provider.tf")).unwrap();
        assert!(provider.contains("region = \"us-east-1\""));
    }

    #[tokio::test]
    async fn test_missing_terraform_fails_before_running() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockProcessRunner::missing());
        let engine = engine(root.path(), runner.clone(), Arc::new(RecordingBucketApi::default()));

        let err = engine.apply(&staged("create a redis cache"), &credentials()).await.unwrap_err();

        assert!(matches!(err, BridgeError::Provisioning { .. }));
        assert!(err.hint().unwrap().contains("Install Terraform"));
        assert!(runner.steps().is_empty());
    }

    #[tokio::test]
    async fn test_apply_failure_stops_and_reports_partial_application() {
        let root = tempfile::tempdir().unwrap();
        let failed = ProcessOutput {
            success: false,
            exit_code: Some(1),
            stderr: "Error: creating Lambda Function: AccessDeniedException".to_string(),
            ..Default::default()
        };
        let runner = Arc::new(MockProcessRunner::healthy().with("apply", failed));
        let engine = engine(root.path(), runner.clone(), Arc::new(RecordingBucketApi::default()));

        let err = engine.apply(&staged("create a lambda"), &credentials()).await.unwrap_err();

        assert_eq!(runner.steps(), vec!["init", "apply"]);
        let message = err.to_string();
        assert!(message.contains("AccessDeniedException"));
        assert!(message.contains("NOT rolled back"));

        let dirs: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(dirs.len(), 1, "workspace is left for the janitor");
        let dir = dirs.into_iter().next().unwrap().unwrap().path();
        assert_eq!(record_state(&dir), "failed");
    }

    #[tokio::test]
    async fn test_timeout_surfaces_partial_output_and_keeps_workspace() {
        let root = tempfile::tempdir().unwrap();
        let hung = ProcessOutput {
            stdout: "aws_instance.main: Still creating... [4m50s elapsed]".to_string(),
            timed_out: true,
            ..Default::default()
        };
        let runner = Arc::new(MockProcessRunner::healthy().with("apply", hung));
        let engine = engine(root.path(), runner, Arc::new(RecordingBucketApi::default()));

        let err = engine.apply(&staged("launch an ec2 instance"), &credentials()).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("did not finish within 300s"));
        assert!(message.contains("Still creating"));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_outputs_are_reported() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockProcessRunner::healthy().with("output", ok("not json")));
        let engine = engine(root.path(), runner, Arc::new(RecordingBucketApi::default()));

        let err = engine.apply(&staged("create an sqs queue"), &credentials()).await.unwrap_err();

        assert!(err.to_string().contains("outputs could not be read"));
    }

    // =========================================================================
    // Driver path
    // =========================================================================

    #[tokio::test]
    async fn test_bucket_uses_driver_not_terraform() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockProcessRunner::healthy());
        let bucket = Arc::new(RecordingBucketApi::default());
        let engine = engine(root.path(), runner.clone(), bucket.clone());
        let action = staged("create an s3 bucket");
        assert_eq!(action.resource_type, ResourceType::S3Bucket);

        let outcome = engine.apply(&action, &credentials()).await.unwrap();

        assert!(runner.steps().is_empty());
        assert_eq!(bucket.calls.lock().unwrap().len(), 5);
        assert_eq!(outcome.resource_id, action.resource_config["bucket_name"]);
        let ws_dir = root.path().join(outcome.workspace_id.unwrap());
        assert!(ws_dir.join("main.tf").exists());
        assert_eq!(record_state(&ws_dir), "completed");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "ééééé";
        let t = tail(text, 3);
        assert!(t.len() <= 3);
        assert!(text.ends_with(t));
        assert_eq!(tail("short", 100), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = SystemProcessRunner
            .run(&Invocation {
                program: "sh",
                args: &["-c", "echo \"$SKYWARD_PROBE\"; echo oops >&2; exit 3"],
                cwd: dir.path(),
                env: &[("SKYWARD_PROBE", "hello".to_string())],
                timeout: Duration::from_secs(10),
            })
            .await
            .unwrap();

        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_enforces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let output = SystemProcessRunner
            .run(&Invocation {
                program: "sh",
                args: &["-c", "echo partial; exec sleep 30"],
                cwd: dir.path(),
                env: &[],
                timeout: Duration::from_millis(500),
            })
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(!output.success);
        assert_eq!(output.stdout.trim(), "partial");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
