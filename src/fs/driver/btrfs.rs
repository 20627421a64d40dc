use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    context::BuildContext,
    error::MountError,
    fs::{block::disk::Disk, cmd::CheckCommandOutput as _, kmod},
    types::FsType,
};

use super::{vfat::blkid_uuid, FilesystemDriver};

pub struct BtrfsDriver {
    ctx: BuildContext,
}

impl BtrfsDriver {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FilesystemDriver for BtrfsDriver {
    fn fstype(&self) -> FsType {
        FsType::Btrfs
    }

    async fn prepare(&self) -> Result<()> {
        if !kmod::filesystem_supported("btrfs").await? {
            kmod::load_module(&self.ctx, "btrfs")
                .await
                .context(MountError::new("Btrfs is not supported by the running kernel"))?;
        }
        kmod::disable_selinux_enforcement().await
    }

    async fn format(&self, device: &Path, label: &str) -> Result<String> {
        tracing::info!("Formatting btrfs filesystem on {device:?}");
        Command::new("mkfs.btrfs")
            .arg("-f")
            .arg("-L")
            .arg(label)
            .arg(device)
            .run_in(&self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!("Error creating btrfs filesystem on {device:?}"))
            })?;

        self.read_uuid(device).await
    }

    async fn read_uuid(&self, device: &Path) -> Result<String> {
        blkid_uuid(&self.ctx, device).await
    }

    async fn fsck(&self, target: &Path) -> Result<()> {
        Command::new("btrfsck")
            .arg(target)
            .run_in(&self.ctx)
            .await
            .with_context(|| MountError::new(format!("Filesystem check of {target:?} failed")))?;
        Ok(())
    }

    /// Only grows the backing file. The filesystem itself is grown online by
    /// btrfs once mounted.
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

    fn default_mount_options(&self) -> Option<&'static str> {
        Some("subvolid=0")
    }
}
