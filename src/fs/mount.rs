use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{async_defer, context::BuildContext, error::MountError};

use super::cmd::CheckCommandOutput as _;

/// Whether something is mounted exactly at `path`, according to `/proc/mounts`.
pub fn is_mounted(path: &Path) -> Result<bool> {
    let mounted = mnt::MountIter::new_from_proc()
        .context("Failed to read /proc/mounts")?
        .any(|item| {
            if let Ok(item) = item {
                return item.file == path;
            }
            false
        });
    Ok(mounted)
}

/// Mount targets at or below `root`, in the order the kernel lists them.
pub fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mounts = mnt::MountIter::new_from_proc()
        .context("Failed to read /proc/mounts")?
        .filter_map(|item| item.ok())
        .map(|item| item.file)
        .filter(|file| file.starts_with(root))
        .collect();
    Ok(mounts)
}

/// Mount plumbing shared by all filesystem drivers: one device mounted at one
/// directory, created on demand and optionally removed again on unmount.
pub struct MountPoint {
    ctx: BuildContext,
    device: PathBuf,
    mountdir: PathBuf,
    fstype: Option<String>,
    rm_mountdir: bool,
    created_dir: bool,
    mounted: bool,
}

impl MountPoint {
    pub fn new(
        ctx: BuildContext,
        device: impl Into<PathBuf>,
        mountdir: impl Into<PathBuf>,
        fstype: Option<&str>,
        rm_mountdir: bool,
    ) -> Self {
        Self {
            ctx,
            device: device.into(),
            mountdir: mountdir.into(),
            fstype: fstype.map(str::to_owned),
            rm_mountdir,
            created_dir: false,
            mounted: false,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn set_device(&mut self, device: impl Into<PathBuf>) {
        self.device = device.into();
    }

    pub fn mountdir(&self) -> &Path {
        &self.mountdir
    }

    pub fn is_active(&self) -> bool {
        self.mounted
    }

    pub async fn mount(&mut self, options: Option<&str>) -> Result<()> {
        if self.mounted {
            return Ok(());
        }

        if !self.mountdir.exists() {
            tokio::fs::create_dir_all(&self.mountdir)
                .await
                .with_context(|| format!("Failed to create mount point {:?}", self.mountdir))
                .context(MountError::new("Failed to create mount point"))?;
            self.created_dir = true;
        }

        let mut cmd = Command::new("mount");
        if let Some(fstype) = &self.fstype {
            cmd.arg("-t").arg(fstype);
        }
        if let Some(options) = options.filter(|options| !options.is_empty()) {
            cmd.arg("-o").arg(options);
        }
        cmd.arg(&self.device)
            .arg(&self.mountdir)
            .run_in(&self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!(
                    "Failed to mount {:?} to {:?}",
                    self.device, self.mountdir
                ))
            })?;

        tracing::debug!(device = ?self.device, mountdir = ?self.mountdir, ?options, "Mounted");
        self.mounted = true;
        Ok(())
    }

    /// Unmounts and mounts again with new options, keeping the mount directory.
    pub async fn remount(&mut self, options: Option<&str>) -> Result<()> {
        self.umount_only().await?;
        self.mount(options).await
    }

    async fn umount_only(&mut self) -> Result<()> {
        if self.mounted || is_mounted(&self.mountdir)? {
            Command::new("umount")
                .arg(&self.mountdir)
                .run_in(&self.ctx)
                .await
                .with_context(|| {
                    MountError::new(format!("Failed to unmount {:?}", self.mountdir))
                })?;
            tracing::debug!(mountdir = ?self.mountdir, "Unmounted");
        }
        self.mounted = false;
        Ok(())
    }

    pub async fn unmount(&mut self) -> Result<()> {
        self.umount_only().await?;

        if self.rm_mountdir && self.created_dir {
            if let Err(error) = tokio::fs::remove_dir(&self.mountdir).await {
                tracing::warn!(?error, "Failed to remove mount point {:?}", self.mountdir);
            }
            self.created_dir = false;
        }
        Ok(())
    }
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }

        async_defer! {
            async {
                if let Err(error) = self.unmount().await {
                    tracing::warn!("{error:#}");
                }
            }
        }
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use anyhow::Result;

    #[test]
    fn test_proc_is_mounted() -> Result<()> {
        assert!(is_mounted(Path::new("/proc"))?);
        assert!(!is_mounted(Path::new("/proc/self"))?);
        Ok(())
    }

    #[test]
    fn test_mounts_under() -> Result<()> {
        let mounts = mounts_under(Path::new("/proc"))?;
        assert!(mounts.iter().any(|mount| mount == Path::new("/proc")));
        assert!(mounts.iter().all(|mount| mount.starts_with("/proc")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_unmount_without_mount_is_noop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut mount = MountPoint::new(
            BuildContext::default(),
            "/dev/null",
            dir.path().join("mnt"),
            Some("ext4"),
            true,
        );
        mount.unmount().await?;
        mount.unmount().await?;
        assert!(!mount.is_active());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_failed_mount_is_mount_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mountdir = dir.path().join("mnt");
        let mut mount = MountPoint::new(
            BuildContext::default(),
            dir.path().join("no-such-device"),
            &mountdir,
            Some("ext4"),
            true,
        );

        let error = mount.mount(None).await.unwrap_err();
        assert!(error.downcast_ref::<MountError>().is_some());
        assert!(!mount.is_active());
        // The directory was created by us and is removed again
        assert!(mountdir.exists());
        mount.unmount().await?;
        assert!(!mountdir.exists());
        Ok(())
    }
}
