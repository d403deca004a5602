use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("exit status {code}")]
pub struct ExitError {
    pub code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("\"{command}\" ran for more than {timeout:?}.")]
    Timeout { command: String, timeout: Duration },

    #[error("{source}")]
    Failed {
        output: String,
        #[source]
        source: ExitError,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Output captured before the process failed, empty for timeouts.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Failed { output, .. } => output,
            _ => "",
        }
    }
}

/// Runs external programs. The provisioner goes through this seam for every
/// tool and remote-shell invocation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, returning stdout followed by stderr.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, ExecError>;
}

/// Spawns real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, ExecError> {
        exec_with_timeout(timeout, program, args).await
    }
}

pub fn format_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend(args.iter().map(String::as_str));
    parts.join(" ")
}

/// Runs a program, killing it (and anything it spawned) once `timeout`
/// elapses.
pub async fn exec_with_timeout(
    timeout: Duration,
    program: &str,
    args: &[String],
) -> Result<String, ExecError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| ExecError::Spawn {
        program: program.to_string(),
        source: e,
    })?;
    let pid = child.id();

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ExecError::Spawn {
            program: program.to_string(),
            source: e,
        })?,
        Err(_) => {
            // The child itself was killed when its future was dropped.
            if let Some(pid) = pid {
                terminate_group(pid);
            }
            let command = format_command(program, args);
            tracing::warn!(command = %command, ?timeout, "command timed out");
            return Err(ExecError::Timeout { command, timeout });
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(ExecError::Failed {
            output: combined,
            source: ExitError {
                code: output.status.code().unwrap_or(-1),
            },
        });
    }
    Ok(combined)
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    // Negative pid addresses the whole process group.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}
