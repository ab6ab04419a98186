//! `shell-command` action
//!
//! Runs the resolved command through `sh -c` on the host.
//!
//! Example:
//! ```yaml
//! - id: build
//!   action: shell-command
//!   command: "cargo build --release && echo ARTIFACT=target/release/app"
//!   workingDir: ${inputs.REPO_PATH}
//!   env:
//!     RUSTFLAGS: "-D warnings"
//!   outputs: [ARTIFACT]
//! ```
//!
//! Outputs: every stdout line of the form `KEY=value` becomes output `KEY`.
//! `stdout`, `stderr` and `exit_code` are always present.

use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::engine::error::{ActionFailure, StepErrorKind};

static OUTPUT_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.*)$").expect("Invalid output line regex")
});

/// A fully resolved shell invocation
#[derive(Debug, Clone, Default)]
pub struct ShellInvocation {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

/// Execute a command and collect its outputs
pub async fn execute_shell_command(
    invocation: &ShellInvocation,
) -> Result<Map<String, Value>, ActionFailure> {
    if invocation.command.trim().is_empty() {
        return Err(ActionFailure::invalid_input(
            "shell-command requires a non-empty 'command'",
        ));
    }

    info!("Executing shell command: {}", invocation.command);

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&invocation.command);
    cmd.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    if let Some(dir) = &invocation.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // A timed-out or cancelled step drops this future; take the child with it
    cmd.kill_on_drop(true);

    let output = cmd.output().await.map_err(|e| {
        ActionFailure::new(
            StepErrorKind::Command,
            format!("Failed to execute command: {}", e),
        )
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let code = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        let message = if stderr.is_empty() {
            format!("Command exited with code {}", code)
        } else {
            format!("Command exited with code {}: {}", code, stderr)
        };
        return Err(ActionFailure::new(StepErrorKind::Command, message));
    }

    let mut outputs = parse_output_lines(&stdout);
    debug!("Command produced outputs: {:?}", outputs.keys().collect::<Vec<_>>());

    outputs.insert("stdout".to_string(), Value::String(stdout));
    outputs.insert("stderr".to_string(), Value::String(stderr));
    outputs.insert("exit_code".to_string(), Value::from(code));
    Ok(outputs)
}

/// Extract `KEY=value` lines; later lines win
pub fn parse_output_lines(stdout: &str) -> Map<String, Value> {
    let mut outputs = Map::new();
    for line in stdout.lines() {
        if let Some(caps) = OUTPUT_LINE_REGEX.captures(line.trim_end()) {
            outputs.insert(caps[1].to_string(), Value::String(caps[2].to_string()));
        }
    }
    outputs
}
