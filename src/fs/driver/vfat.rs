use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    context::BuildContext,
    error::MountError,
    fs::{block::disk::Disk, cmd::CheckCommandOutput as _},
    types::FsType,
};

use super::FilesystemDriver;

/// FAT volume labels are limited to 11 characters.
const FAT_LABEL_MAX: usize = 11;

pub struct VfatDriver {
    ctx: BuildContext,
    fstype: FsType,
}

/// Volume id derived from the current time, as passed to `mkfs.vfat -i`.
fn volume_id(epoch_secs: u64) -> String {
    format!("{:08x}", epoch_secs as u32)
}

/// How blkid prints a FAT volume id: `XXXX-XXXX`.
fn volume_id_to_uuid(volume_id: &str) -> String {
    let (high, low) = volume_id.split_at(4);
    format!("{high}-{low}").to_uppercase()
}

pub(crate) async fn blkid_uuid(ctx: &BuildContext, device: &Path) -> Result<String> {
    let stdout = Command::new("blkid")
        .arg("-s")
        .arg("UUID")
        .arg("-o")
        .arg("value")
        .arg(device)
        .run_in(ctx)
        .await
        .with_context(|| MountError::new(format!("Failed to read UUID of {device:?}")))?;
    Ok(String::from_utf8_lossy(&stdout).trim().to_owned())
}

impl VfatDriver {
    pub fn new(ctx: BuildContext, fstype: FsType) -> Self {
        Self { ctx, fstype }
    }
}

#[async_trait]
impl FilesystemDriver for VfatDriver {
    fn fstype(&self) -> FsType {
        self.fstype
    }

    async fn format(&self, device: &Path, label: &str) -> Result<String> {
        let epoch_secs = chrono::Utc::now().timestamp().max(0) as u64;
        let volume_id = volume_id(epoch_secs);
        let label: String = label.chars().take(FAT_LABEL_MAX).collect();

        tracing::info!("Formatting {} filesystem on {device:?}", self.fstype);
        Command::new(format!("mkfs.{}", self.fstype))
            .arg("-n")
            .arg(&label)
            .arg("-i")
            .arg(&volume_id)
            .arg(device)
            .run_in(&self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!(
                    "Error creating {} filesystem on {device:?}",
                    self.fstype
                ))
            })?;

        Ok(volume_id_to_uuid(&volume_id))
    }

    async fn read_uuid(&self, device: &Path) -> Result<String> {
        blkid_uuid(&self.ctx, device).await
    }

    async fn fsck(&self, target: &Path) -> Result<()> {
        Command::new(format!("fsck.{}", self.fstype))
            .arg("-n")
            .arg(target)
            .run_in(&self.ctx)
            .await
            .with_context(|| MountError::new(format!("Filesystem check of {target:?} failed")))?;
        Ok(())
    }

    /// FAT cannot be resized in place here, only the backing file grows.
    async fn resize(&self, disk: &mut Disk, size: u64) -> Result<u64> {
        if size > disk.stored_len().await? {
            disk.expand(size).await?;
        }
        self.fsck(disk.path()).await?;
        Ok(disk.size())
    }

    async fn minimal_size(&self, disk: &Disk) -> Result<u64> {
        Ok(disk.size())
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_volume_id() {
        assert_eq!(volume_id(0x5f3a_1b2c), "5f3a1b2c");
        assert_eq!(volume_id(42), "0000002a");
        assert_eq!(volume_id(0x1_0000_0001), "00000001");
    }

    #[test]
    fn test_volume_id_to_uuid() {
        assert_eq!(volume_id_to_uuid("5f3a1b2c"), "5F3A-1B2C");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_minimal_size_is_disk_size() -> anyhow::Result<()> {
        let driver = VfatDriver::new(BuildContext::default(), FsType::Vfat);
        let disk = Disk::sparse_loopback("/nonexistent/boot.img", 50 * 1024 * 1024);
        assert_eq!(driver.minimal_size(&disk).await?, 50 * 1024 * 1024);
        Ok(())
    }
}
