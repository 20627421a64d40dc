use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{context::BuildContext, fs::cmd::CheckCommandOutput as _};

const SELINUX_ENFORCE: &str = "/sys/fs/selinux/enforce";

fn module_listed(proc_modules: &str, module: &str) -> bool {
    proc_modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == module || name == module.replace('-', "_"))
}

fn filesystem_listed(proc_filesystems: &str, fstype: &str) -> bool {
    proc_filesystems
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|name| name == fstype)
}

/// Loads a kernel module unless `/proc/modules` says it is already there.
pub async fn load_module(ctx: &BuildContext, module: &str) -> Result<()> {
    let loaded = tokio::fs::read_to_string("/proc/modules")
        .await
        .map(|content| module_listed(&content, module))
        .unwrap_or(false);
    if loaded {
        return Ok(());
    }

    tracing::debug!("Loading kernel module {module}");
    Command::new("modprobe")
        .arg(module)
        .run_in(ctx)
        .await
        .with_context(|| format!("Failed to load kernel module '{module}'"))?;
    Ok(())
}

pub async fn filesystem_supported(fstype: &str) -> Result<bool> {
    let content = tokio::fs::read_to_string("/proc/filesystems")
        .await
        .context("Failed to read /proc/filesystems")?;
    Ok(filesystem_listed(&content, fstype))
}

/// Switches selinux to permissive mode so it does not block writes into a new filesystem.
pub async fn disable_selinux_enforcement() -> Result<()> {
    let enforce = Path::new(SELINUX_ENFORCE);
    if !enforce.exists() {
        return Ok(());
    }

    let current = tokio::fs::read_to_string(enforce)
        .await
        .with_context(|| format!("Failed to read {enforce:?}"))?;
    if current.trim() == "0" {
        return Ok(());
    }

    tracing::info!("Setting selinux to permissive mode");
    tokio::fs::write(enforce, "0")
        .await
        .with_context(|| format!("Failed to write {enforce:?}"))?;
    Ok(())
}
