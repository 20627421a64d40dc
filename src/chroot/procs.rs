use std::path::Path;

use anyhow::{Context as _, Result};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

/// Pids whose root directory, per `/proc/<pid>/root`, is `root`.
pub fn processes_rooted_at(proc_dir: &Path, root: &Path) -> Result<Vec<i32>> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let pattern = format!("{}/[0-9]*/root", proc_dir.display());

    let mut pids = Vec::new();
    for entry in glob::glob(&pattern).context("Failed to scan process roots")? {
        let Ok(entry) = entry else { continue };
        let Ok(link) = std::fs::read_link(&entry) else {
            continue;
        };
        if link != root {
            continue;
        }
        let pid = entry
            .parent()
            .and_then(Path::file_name)
            .and_then(|pid| pid.to_str())
            .and_then(|pid| pid.parse::<i32>().ok());
        pids.extend(pid);
    }
    Ok(pids)
}

/// Sends SIGKILL to every process living inside the chroot at `root`.
pub fn kill_processes_in(root: &Path) -> Result<()> {
    for pid in processes_rooted_at(Path::new("/proc"), root)? {
        tracing::info!(pid, ?root, "Killing process left in chroot");
        if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            tracing::warn!(pid, ?error, "Failed to kill process");
        }
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_processes_rooted_at() -> Result<()> {
        let me = std::process::id() as i32;
        assert!(processes_rooted_at(Path::new("/proc"), Path::new("/"))?.contains(&me));

        let dir = tempfile::tempdir()?;
        assert!(processes_rooted_at(Path::new("/proc"), dir.path())?.is_empty());
        Ok(())
    }
}
