use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use glob::{glob_with, MatchOptions};

/// File kept open inside a chroot for as long as a session uses it.
pub const LOCK_FILE: &str = ".chroot.lock";

/// An open file descriptor on `<root>/.chroot.lock`. Other sessions find out
/// the chroot is in use by looking for open descriptors on the same file.
pub struct ChrootLock {
    path: PathBuf,
    file: Option<File>,
}

impl ChrootLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open chroot lock {path:?}"))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn release(&mut self) {
        self.file = None;
    }
}

/// Pids with an open descriptor on `path`, found through `/proc/<pid>/fd`.
pub fn lock_holders(proc_dir: &Path, path: &Path) -> Result<Vec<u32>> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let pattern = format!("{}/[0-9]*/fd/*", proc_dir.display());
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let mut holders = Vec::new();
    for entry in glob_with(&pattern, options).context("Failed to scan open files")? {
        // Processes come and go while we look, and most fds of other users
        // are unreadable
        let Ok(entry) = entry else { continue };
        let Ok(link) = std::fs::read_link(&entry) else {
            continue;
        };
        if link != target {
            continue;
        }

        let pid = entry
            .strip_prefix(proc_dir)
            .ok()
            .and_then(|rest| rest.iter().next())
            .and_then(|pid| pid.to_str())
            .and_then(|pid| pid.parse::<u32>().ok());
        if let Some(pid) = pid {
            if !holders.contains(&pid) {
                holders.push(pid);
            }
        }
    }
    Ok(holders)
}

/// Whether a process other than this one holds `path` open.
pub fn is_busy(path: &Path) -> Result<bool> {
    let me = std::process::id();
    Ok(lock_holders(Path::new("/proc"), path)?
        .into_iter()
        .any(|pid| pid != me))
}
