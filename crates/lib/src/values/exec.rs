//! External command execution for dynamic values and script hooks.
//!
//! Commands inherit the parent environment plus the resolved values exported
//! as `STEVEDORE_*` variables. Every run is bounded by a timeout and races
//! the deploy's cancellation token.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelToken;

use super::ValuesError;

/// Everything a spawned command needs from the surrounding deploy.
#[derive(Debug, Clone)]
pub struct ExecContext<'a> {
  /// Working directory for the command.
  pub dir: &'a Path,
  /// Extra environment exported to the command.
  pub env: &'a BTreeMap<String, String>,
  pub cancel: &'a CancelToken,
  pub timeout: Duration,
}

/// Run an argv-style command and return its trimmed stdout.
pub async fn run_argv(argv: &[String], ctx: &ExecContext<'_>) -> Result<String, ValuesError> {
  let Some((bin, args)) = argv.split_first() else {
    return Err(ValuesError::EmptyCommand);
  };

  let mut command = Command::new(bin);
  command.args(args);
  run_command(command, &argv.join(" "), ctx).await
}

/// Run a multi-line script through the platform shell and return its trimmed
/// stdout.
pub async fn run_script(script: &str, ctx: &ExecContext<'_>) -> Result<String, ValuesError> {
  // The script is written to a temp file so shebang lines and multi-line
  // bodies behave exactly as they would from disk.
  let mut file = tempfile::Builder::new().prefix("stevedore-script-").tempfile()?;
  file.write_all(script.as_bytes())?;
  file.flush()?;

  let command = script_command(file.path());
  let label = first_line(script);
  run_command(command, &label, ctx).await
}

async fn run_command(mut command: Command, label: &str, ctx: &ExecContext<'_>) -> Result<String, ValuesError> {
  debug!(cmd = %label, dir = %ctx.dir.display(), "running command");

  command
    .current_dir(ctx.dir)
    .envs(ctx.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let wait = tokio::time::timeout(ctx.timeout, command.output());

  let output = tokio::select! {
    result = wait => match result {
      Ok(output) => output?,
      Err(_) => {
        return Err(ValuesError::TimedOut {
          cmd: label.to_string(),
          seconds: ctx.timeout.as_secs(),
        });
      }
    },
    _ = ctx.cancel.cancelled() => {
      return Err(ValuesError::Cancelled { cmd: label.to_string() });
    }
  };

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    return Err(ValuesError::CmdFailed {
      cmd: label.to_string(),
      code: output.status.code(),
    });
  }

  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(unix)]
fn script_command(path: &Path) -> Command {
  let mut command = Command::new("/bin/sh");
  command.arg(path);
  command
}

#[cfg(windows)]
fn script_command(path: &Path) -> Command {
  let mut command = Command::new("powershell.exe");
  command.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"]).arg(path);
  command
}

fn first_line(script: &str) -> String {
  script.trim().lines().next().unwrap_or_default().to_string()
}
