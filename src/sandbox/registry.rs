use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::types::SandboxPolicy;
use crate::error::{Result, RunletError};
use crate::sandbox::container::ContainerHandle;

/// Caller-chosen identifier correlating all executions of one conversation
/// with exactly one reusable container.
pub type SessionId = u64;

/// Path to the sandbox image Dockerfile relative to the crate root
const DOCKERFILE_PATH: &str = "docker/Dockerfile.sandbox";

#[derive(Default)]
struct Slot {
    container: Option<ContainerHandle>,
}

/// Owns the session -> container mapping and all container lifecycle
/// decisions. Create/reuse decisions are serialized per session through a
/// slot mutex; different sessions only share a brief map lock.
pub struct SandboxRegistry {
    policy: SandboxPolicy,
    slots: Mutex<HashMap<SessionId, Arc<Mutex<Slot>>>>,
}

impl SandboxRegistry {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Check if the Docker daemon is accessible on this system.
    pub fn is_available() -> bool {
        match std::process::Command::new("docker")
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn container_name(session: SessionId) -> String {
        format!("runlet-session-{}", session)
    }

    async fn slot(&self, session: SessionId) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        slots.entry(session).or_default().clone()
    }

    /// Whether a live container already exists for this session. Used to
    /// tell callers up front that an expensive creation is coming.
    pub async fn contains(&self, session: SessionId) -> bool {
        let slot = self.slot(session).await;
        let guard = slot.lock().await;
        if let Some(container) = &guard.container {
            if container.is_running().await {
                return true;
            }
        }
        drop(guard);
        matches!(Self::lookup(session).await, Some((_, true)))
    }

    /// Return the session's container, reusing the registered one when it is
    /// still running and creating a fresh one otherwise. The boolean reports
    /// whether a creation happened.
    pub async fn acquire(&self, session: SessionId) -> Result<(ContainerHandle, bool)> {
        let slot = self.slot(session).await;
        let mut guard = slot.lock().await;

        if let Some(container) = &guard.container {
            if container.is_running().await {
                return Ok((container.clone(), false));
            }
            guard.container = None;
        }

        // Adopt a still-running container left over from a previous process.
        match Self::lookup(session).await {
            Some((id, true)) => {
                debug!(session = session, container_id = %id, "Adopted running container");
                let handle = ContainerHandle {
                    id,
                    workdir: self.policy.workdir.clone(),
                };
                guard.container = Some(handle.clone());
                return Ok((handle, false));
            }
            Some((id, false)) => {
                // Stale stopped container holding the name
                let _ = Command::new("docker")
                    .args(["rm", "-f", &id])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
            None => {}
        }

        let handle = self.create_container(session).await?;
        guard.container = Some(handle.clone());
        Ok((handle, true))
    }

    /// Borrow the registered container without creating one.
    pub async fn get(&self, session: SessionId) -> Option<ContainerHandle> {
        let slot = self.slot(session).await;
        let guard = slot.lock().await;
        if let Some(container) = &guard.container {
            return Some(container.clone());
        }
        drop(guard);
        match Self::lookup(session).await {
            Some((id, true)) => Some(ContainerHandle {
                id,
                workdir: self.policy.workdir.clone(),
            }),
            _ => None,
        }
    }

    /// Stop, remove and unregister the session's container. Idempotent:
    /// unknown sessions and repeated calls are no-ops.
    pub async fn release(&self, session: SessionId) {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.remove(&session)
        };

        let container = match slot {
            Some(slot) => {
                let mut guard = slot.lock().await;
                guard.container.take()
            }
            None => Self::lookup(session).await.map(|(id, _)| ContainerHandle {
                id,
                workdir: self.policy.workdir.clone(),
            }),
        };

        if let Some(container) = container {
            info!(session = session, container_id = %container.short_id(), "Releasing session container");
            container.stop_and_remove().await;
        }
    }

    /// Release every session this process registered plus any container
    /// carrying our name prefix left over from earlier processes.
    pub async fn release_all(&self) {
        let mut sessions: Vec<SessionId> = {
            let slots = self.slots.lock().await;
            slots.keys().copied().collect()
        };
        for session in Self::active_sessions().await {
            if !sessions.contains(&session) {
                sessions.push(session);
            }
        }
        for session in sessions {
            self.release(session).await;
        }
    }

    /// Session ids of all containers carrying our name prefix, whichever
    /// process created them.
    pub async fn active_sessions() -> Vec<SessionId> {
        let output = Command::new("docker")
            .args([
                "ps",
                "-a",
                "--filter",
                "name=runlet-session-",
                "--format",
                "{{.Names}}",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|name| name.trim().strip_prefix("runlet-session-"))
                .filter_map(|id| id.parse().ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Find a container by its session name. Returns (id, running).
    async fn lookup(session: SessionId) -> Option<(String, bool)> {
        let output = Command::new("docker")
            .args([
                "inspect",
                "-f",
                "{{.Id}} {{.State.Running}}",
                &Self::container_name(session),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let id = parts.next()?.to_string();
        let running = parts.next() == Some("true");
        Some((id, running))
    }

    async fn create_container(&self, session: SessionId) -> Result<ContainerHandle> {
        self.ensure_image().await?;

        info!(session = session, image = %self.policy.image, "Creating session container");

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &Self::container_name(session)]);

        // Resource quota
        cmd.arg(format!("--cpus={}", self.policy.cpu_cores));
        cmd.arg(format!("--memory={}m", self.policy.memory_limit_mb));

        if !self.policy.enable_networking {
            cmd.arg("--network=none");
        }

        cmd.args(["-e", &format!("SESSION_ID={}", session)]);
        cmd.args(["-w", &self.policy.workdir]);

        // Keep the container alive for repeated exec calls
        cmd.arg(&self.policy.image);
        cmd.args(["tail", "-f", "/dev/null"]);

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            RunletError::ContainerCreate(format!("Failed to start container: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunletError::ContainerCreate(format!(
                "Failed to start container: {}",
                stderr
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(session = session, container_id = %&id[..id.len().min(12)], "Session container started");

        Ok(ContainerHandle {
            id,
            workdir: self.policy.workdir.clone(),
        })
    }

    async fn ensure_image(&self) -> Result<()> {
        if Self::image_exists(&self.policy.image).await {
            return Ok(());
        }

        if self.policy.build_image {
            Self::build_image(&self.policy.image).await
        } else {
            Err(RunletError::ContainerCreate(format!(
                "Docker image '{}' not found. Set build_image=true to auto-build, or build manually with: docker build -t {} -f {} .",
                self.policy.image, self.policy.image, DOCKERFILE_PATH
            )))
        }
    }

    async fn image_exists(image: &str) -> bool {
        match Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn build_image(image: &str) -> Result<()> {
        info!(image = %image, "Building sandbox image...");

        let dockerfile = Self::find_dockerfile()?;
        let dockerfile_abs = dockerfile.canonicalize().map_err(|e| {
            RunletError::ContainerCreate(format!("Cannot resolve Dockerfile path: {}", e))
        })?;

        // Project root is the parent of the docker/ directory
        let project_root = dockerfile_abs
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| {
                RunletError::ContainerCreate("Cannot determine project root".to_string())
            })?;

        let output = Command::new("docker")
            .args([
                "build",
                "-t",
                image,
                "-f",
                dockerfile_abs.to_str().unwrap_or(DOCKERFILE_PATH),
                ".",
            ])
            .current_dir(project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                RunletError::ContainerCreate(format!("Failed to run docker build: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunletError::ContainerCreate(format!(
                "Failed to build sandbox image: {}",
                stderr
            )));
        }

        info!(image = %image, "Sandbox image built successfully");
        Ok(())
    }

    fn find_dockerfile() -> Result<PathBuf> {
        let local_path = PathBuf::from(DOCKERFILE_PATH);
        if local_path.exists() {
            return Ok(local_path);
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let exe_dockerfile = exe_dir.join(DOCKERFILE_PATH);
                if exe_dockerfile.exists() {
                    return Ok(exe_dockerfile);
                }

                // Walk up parent directories (for development)
                let mut parent = exe_dir.to_path_buf();
                for _ in 0..5 {
                    let candidate = parent.join(DOCKERFILE_PATH);
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                    if let Some(p) = parent.parent() {
                        parent = p.to_path_buf();
                    } else {
                        break;
                    }
                }
            }
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let cargo_dockerfile = PathBuf::from(manifest_dir).join(DOCKERFILE_PATH);
            if cargo_dockerfile.exists() {
                return Ok(cargo_dockerfile);
            }
        }

        Err(RunletError::ContainerCreate(format!(
            "Dockerfile not found at {}. Build the image manually with: docker build -t runlet-sandbox:latest -f {} .",
            DOCKERFILE_PATH, DOCKERFILE_PATH
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_is_per_session() {
        assert_eq!(SandboxRegistry::container_name(1), "runlet-session-1");
        assert_eq!(SandboxRegistry::container_name(42), "runlet-session-42");
    }

    #[tokio::test]
    async fn test_release_unknown_session_is_noop() {
        // No docker interaction happens for a session that was never
        // registered and has no named container.
        let registry = SandboxRegistry::new(SandboxPolicy::default());
        registry.release(u64::MAX).await;
        registry.release(u64::MAX).await;
    }
}
