use std::path::Path;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    context::BuildContext,
    error::MountError,
    fs::{block::disk::Disk, cmd::CheckCommandOutput as _},
    types::FsType,
};

use super::{search_minimal, FilesystemDriver};

const EXT_BLOCK_SIZE: u64 = 4096;

pub struct ExtDriver {
    ctx: BuildContext,
    fstype: FsType,
}

/// Picks `<field>: value` out of `dumpe2fs -h` output.
pub fn parse_dumpe2fs_field<'a>(output: &'a str, field: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field).then(|| value.trim())
    })
}

async fn dumpe2fs(ctx: &BuildContext, target: &Path) -> Result<String> {
    let stdout = Command::new("dumpe2fs")
        .arg("-h")
        .arg(target)
        .run_in(ctx)
        .await
        .with_context(|| MountError::new(format!("Failed to read superblock of {target:?}")))?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Runs `resize2fs` and reports whether it succeeded.
pub(crate) async fn try_resize2fs(ctx: &BuildContext, target: &Path, size: u64) -> Result<bool> {
    let code = Command::new("resize2fs")
        .arg(target)
        .arg(format!("{}K", size / 1024))
        .run_for_exit_code(ctx)
        .await?;
    Ok(code == 0)
}

pub(crate) async fn resize2fs(ctx: &BuildContext, target: &Path, size: u64) -> Result<()> {
    if !try_resize2fs(ctx, target, size).await? {
        return Err(MountError::new(format!(
            "Failed to resize filesystem {target:?} to {size} bytes"
        ))
        .into());
    }
    Ok(())
}

/// Forced check with automatic repair. Exit codes below 4 mean the
/// filesystem is (now) clean.
pub(crate) async fn e2fsck(ctx: &BuildContext, target: &Path) -> Result<()> {
    Command::new("e2fsck")
        .arg("-f")
        .arg("-y")
        .arg(target)
        .run_with_status_checker(ctx, |code, _, _| {
            if code >= 4 {
                bail!("Bad exit code")
            }
            Ok(())
        })
        .await
        .with_context(|| MountError::new(format!("Filesystem check of {target:?} failed")))
}

impl ExtDriver {
    pub fn new(ctx: BuildContext, fstype: FsType) -> Self {
        Self { ctx, fstype }
    }

    async fn block_geometry(&self, target: &Path) -> Result<(u64, u64)> {
        let output = dumpe2fs(&self.ctx, target).await?;
        let parse = |field: &str| {
            parse_dumpe2fs_field(&output, field)
                .and_then(|value| value.parse::<u64>().ok())
                .with_context(|| {
                    MountError::new(format!("No valid '{field}' in superblock of {target:?}"))
                })
        };
        Ok((parse("Block count")?, parse("Block size")?))
    }
}

#[async_trait]
impl FilesystemDriver for ExtDriver {
    fn fstype(&self) -> FsType {
        self.fstype
    }

    async fn format(&self, device: &Path, label: &str) -> Result<String> {
        tracing::info!("Formatting {} filesystem on {device:?}", self.fstype);
        Command::new(format!("mkfs.{}", self.fstype))
            .arg("-F")
            .arg("-L")
            .arg(label)
            .arg("-m")
            .arg("1")
            .arg("-b")
            .arg(EXT_BLOCK_SIZE.to_string())
            .arg(device)
            .run_in(&self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!(
                    "Error creating {} filesystem on {device:?}",
                    self.fstype
                ))
            })?;

        let uuid = self.read_uuid(device).await?;

        Command::new("tune2fs")
            .arg("-c0")
            .arg("-i0")
            .arg("-Odir_index")
            .arg("-ouser_xattr,acl")
            .arg(device)
            .run_in(&self.ctx)
            .await
            .with_context(|| MountError::new(format!("Failed to tune filesystem on {device:?}")))?;

        Ok(uuid)
    }

    async fn read_uuid(&self, device: &Path) -> Result<String> {
        let output = dumpe2fs(&self.ctx, device).await?;
        parse_dumpe2fs_field(&output, "Filesystem UUID")
            .map(str::to_owned)
            .with_context(|| MountError::new(format!("No filesystem UUID found on {device:?}")))
    }

    async fn fsck(&self, target: &Path) -> Result<()> {
        e2fsck(&self.ctx, target).await
    }

    async fn resize(&self, disk: &mut Disk, size: u64) -> Result<u64> {
        let (blocks, block_size) = self.block_geometry(disk.path()).await?;
        if blocks * block_size == size {
            return Ok(size);
        }

        if size > disk.stored_len().await? {
            disk.expand(size).await?;
        }

        self.fsck(disk.path()).await?;
        resize2fs(&self.ctx, disk.path(), size).await?;
        tracing::debug!(image = ?disk.path(), size, "Resized filesystem");
        Ok(size)
    }

    async fn minimal_size(&self, disk: &Disk) -> Result<u64> {
        let target = disk.path();
        self.fsck(target).await?;
        let (blocks, block_size) = self.block_geometry(target).await?;

        tracing::info!("Resizing filesystem {target:?} to minimal size");
        let ctx = &self.ctx;
        let minimal_blocks =
            search_minimal(0, blocks, |t| try_resize2fs(ctx, target, t * block_size)).await?;

        // The search may have ended on a failed attempt
        resize2fs(&self.ctx, target, minimal_blocks * block_size).await?;
        Ok(minimal_blocks * block_size)
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use anyhow::Result;

    const DUMPE2FS_HEADER: &str = "dumpe2fs 1.46.5 (30-Dec-2021)
Filesystem volume name:   platform
Last mounted on:          <not available>
Filesystem UUID:          5f2b6b43-29f5-4f4a-9d8e-8f2b0b3e4c11
Filesystem magic number:  0xEF53
Filesystem features:      has_journal ext_attr resize_inode dir_index filetype sparse_super
Block count:              262144
Reserved block count:     2621
Block size:               4096
";

    #[test]
    fn test_parse_dumpe2fs_field() {
        assert_eq!(
            parse_dumpe2fs_field(DUMPE2FS_HEADER, "Filesystem UUID"),
            Some("5f2b6b43-29f5-4f4a-9d8e-8f2b0b3e4c11")
        );
        assert_eq!(parse_dumpe2fs_field(DUMPE2FS_HEADER, "Block count"), Some("262144"));
        assert_eq!(parse_dumpe2fs_field(DUMPE2FS_HEADER, "Block size"), Some("4096"));
        assert_eq!(
            parse_dumpe2fs_field(DUMPE2FS_HEADER, "Filesystem volume name"),
            Some("platform")
        );
        assert_eq!(parse_dumpe2fs_field(DUMPE2FS_HEADER, "Inode count"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    #[ignore = "requires e2fsprogs"]
    async fn test_resparse_cycle_on_image_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fs.img");
        let ctx = BuildContext::default();
        let driver = ExtDriver::new(ctx, FsType::Ext4);

        let mut disk = Disk::sparse_loopback(&path, 256 * 1024 * 1024);
        crate::fs::block::disk::expand_file(&path, disk.size(), true).await?;
        let uuid = driver.format(&path, "test").await?;
        assert_eq!(uuid.len(), 36);
        assert_eq!(driver.read_uuid(&path).await?, uuid);

        let minimal = driver.minimal_size(&disk).await?;
        assert!(minimal < disk.size());
        assert_eq!(minimal % EXT_BLOCK_SIZE, 0);

        // Shrinking below the minimum must not work
        assert!(!try_resize2fs(&BuildContext::default(), &path, minimal - EXT_BLOCK_SIZE).await?);

        // Reuse at a larger nominal size: the file is short of it
        disk.truncate(minimal).await?;
        disk.set_size(512 * 1024 * 1024);
        assert_eq!(driver.resize(&mut disk, 512 * 1024 * 1024).await?, 512 * 1024 * 1024);
        assert_eq!(tokio::fs::metadata(&path).await?.len(), 512 * 1024 * 1024);
        Ok(())
    }
}
