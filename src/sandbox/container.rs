use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, RunletError};

/// Result of executing a command inside a sandbox container.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandResult {
    /// Combined stdout/stderr, non-empty parts joined and trimmed.
    pub fn combined_output(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(self.stdout.as_str());
        }
        if !self.stderr.is_empty() {
            parts.push(self.stderr.as_str());
        }
        parts.join("\n").trim().to_string()
    }
}

/// Handle to one live session container. Cheap to clone; the registry owns
/// the lifecycle, borrowers only exec into it.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub workdir: String,
}

impl ContainerHandle {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Check the daemon's view of the container state.
    pub async fn is_running(&self) -> bool {
        match Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", &self.id])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
        {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Err(_) => false,
        }
    }

    /// Execute an argv-style command in the container's working directory.
    pub async fn exec(&self, command: &[&str]) -> Result<CommandResult> {
        debug!(container_id = %self.short_id(), command = ?command, "Executing via docker exec");

        let output = Command::new("docker")
            .args(["exec", "-w", &self.workdir, &self.id])
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RunletError::ContainerExec(format!("Failed to run docker exec: {}", e)))?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(1) as i64,
        })
    }

    /// Execute a shell snippet via `sh -c`.
    pub async fn exec_sh(&self, script: &str) -> Result<CommandResult> {
        self.exec(&["sh", "-c", script]).await
    }

    /// Write `content` to `filename` in the working directory by piping the
    /// bytes over stdin. No shell quoting of the content is involved, so it
    /// round-trips byte-for-byte.
    pub async fn write_file(&self, filename: &str, content: &str) -> Result<()> {
        let mut child = Command::new("docker")
            .args(["exec", "-i", "-w", &self.workdir, &self.id])
            .args(["sh", "-c", &format!("cat > '{}'", filename)])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RunletError::ContainerExec(format!("Failed to spawn docker exec: {}", e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            RunletError::ContainerExec(format!("Failed to write code file: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunletError::ContainerExec(format!(
                "Failed to write code file: {}",
                stderr
            )));
        }

        Ok(())
    }

    /// Stop and remove the container. Failures are logged, not fatal.
    pub async fn stop_and_remove(&self) {
        let stop = Command::new("docker")
            .args(["stop", "-t", "5", &self.id])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        if let Ok(output) = &stop {
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(container_id = %self.short_id(), error = %stderr, "Failed to stop container");
            }
        }

        let rm = Command::new("docker")
            .args(["rm", "-f", &self.id])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        if let Ok(output) = &rm {
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(container_id = %self.short_id(), error = %stderr, "Failed to remove container");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output_joins_nonempty_parts() {
        let result = CommandResult {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: 1,
        };
        assert_eq!(result.combined_output(), "out\n\nerr");

        let result = CommandResult {
            stdout: String::new(),
            stderr: "only stderr\n".to_string(),
            exit_code: 1,
        };
        assert_eq!(result.combined_output(), "only stderr");
    }

    #[test]
    fn test_short_id_truncates() {
        let handle = ContainerHandle {
            id: "0123456789abcdef0123".to_string(),
            workdir: "/workspace".to_string(),
        };
        assert_eq!(handle.short_id(), "0123456789ab");

        let handle = ContainerHandle {
            id: "short".to_string(),
            workdir: "/workspace".to_string(),
        };
        assert_eq!(handle.short_id(), "short");
    }
}
