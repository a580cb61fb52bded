use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sandbox::container::ContainerHandle;

/// A file created in the sandbox working directory by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    pub content: String,
}

/// List the working directory's file names. `None` when the listing fails,
/// so a caller can tell an unreadable workspace from an empty one and skip
/// diffing rather than misreport pre-existing files as new.
pub async fn snapshot(container: &ContainerHandle) -> Option<BTreeSet<String>> {
    match container.exec_sh("ls -1").await {
        Ok(result) if result.exit_code == 0 => Some(
            result
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
        ),
        Ok(result) => {
            debug!(exit_code = result.exit_code, "Workspace listing failed");
            None
        }
        Err(e) => {
            debug!(error = %e, "Workspace listing failed");
            None
        }
    }
}

/// Names present after the run but not before, minus the injected script
/// itself.
pub fn diff(
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
    injected: &str,
) -> Vec<String> {
    after
        .difference(before)
        .filter(|name| name.as_str() != injected)
        .cloned()
        .collect()
}

/// Read each named file's content. Unreadable files (deleted between the
/// listing and the read, or binary beyond cat) are skipped, not fatal.
pub async fn read_all(container: &ContainerHandle, filenames: &[String]) -> Vec<Artifact> {
    let mut artifacts = Vec::with_capacity(filenames.len());
    for filename in filenames {
        match container.exec(&["cat", filename]).await {
            Ok(result) if result.exit_code == 0 => {
                artifacts.push(Artifact {
                    filename: filename.clone(),
                    content: result.stdout,
                });
            }
            Ok(result) => {
                debug!(filename = %filename, exit_code = result.exit_code, "Skipping unreadable artifact");
            }
            Err(e) => {
                debug!(filename = %filename, error = %e, "Skipping unreadable artifact");
            }
        }
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_reports_new_files_only() {
        let before = set(&["existing.txt"]);
        let after = set(&["existing.txt", "plot.png", "data.csv"]);
        let new = diff(&before, &after, "script_x.py");
        assert_eq!(new, vec!["data.csv".to_string(), "plot.png".to_string()]);
    }

    #[test]
    fn test_diff_excludes_injected_script() {
        let before = BTreeSet::new();
        let after = set(&["script_20260101_120000_000.py", "out.txt"]);
        let new = diff(&before, &after, "script_20260101_120000_000.py");
        assert_eq!(new, vec!["out.txt".to_string()]);
    }

    #[test]
    fn test_diff_ignores_deletions() {
        let before = set(&["gone.txt", "kept.txt"]);
        let after = set(&["kept.txt"]);
        assert!(diff(&before, &after, "script.py").is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_of_unreachable_container_is_none() {
        // The listing either fails to spawn or exits non-zero; both mean
        // the snapshot is unusable, not empty.
        let container = ContainerHandle {
            id: "no-such-container".to_string(),
            workdir: "/workspace".to_string(),
        };
        assert!(snapshot(&container).await.is_none());
    }

    #[test]
    fn test_diff_is_sorted() {
        let before = BTreeSet::new();
        let after = set(&["z.txt", "a.txt", "m.txt"]);
        let new = diff(&before, &after, "script.py");
        assert_eq!(
            new,
            vec!["a.txt".to_string(), "m.txt".to_string(), "z.txt".to_string()]
        );
    }
}
