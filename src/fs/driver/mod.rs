//! Per-filesystem format, check, resize and minimisation logic.
//!
//! Drivers never mount anything themselves; mount plumbing lives in
//! [`crate::fs::mount::MountPoint`] and the two are composed by
//! [`crate::fs::fsmount::FsMount`].

pub mod btrfs;
pub mod ext;
pub mod swap;
pub mod vfat;

use std::{future::Future, path::Path};

use anyhow::Result;
use async_trait::async_trait;

use crate::{context::BuildContext, error::CreatorError, fs::block::disk::Disk, types::FsType};

#[async_trait]
pub trait FilesystemDriver: Send + Sync {
    fn fstype(&self) -> FsType;

    /// Host preparation needed before the filesystem can be created or mounted.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Creates the filesystem and returns its UUID.
    async fn format(&self, device: &Path, label: &str) -> Result<String>;

    async fn read_uuid(&self, device: &Path) -> Result<String>;

    async fn fsck(&self, target: &Path) -> Result<()>;

    /// Resizes the (unmounted) filesystem on `disk` to `size` bytes, growing
    /// the backing file first when needed. Returns the resulting size.
    async fn resize(&self, disk: &mut Disk, size: u64) -> Result<u64>;

    /// Smallest size in bytes the filesystem on `disk` can be shrunk to. May
    /// leave the filesystem at that size.
    async fn minimal_size(&self, disk: &Disk) -> Result<u64>;

    fn default_mount_options(&self) -> Option<&'static str> {
        None
    }
}

pub fn driver_for(fstype: FsType, ctx: &BuildContext) -> Result<Box<dyn FilesystemDriver>> {
    let driver: Box<dyn FilesystemDriver> = match fstype {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            Box::new(ext::ExtDriver::new(ctx.clone(), fstype))
        }
        FsType::Vfat | FsType::Msdos => Box::new(vfat::VfatDriver::new(ctx.clone(), fstype)),
        FsType::Btrfs => Box::new(btrfs::BtrfsDriver::new(ctx.clone())),
        FsType::Swap => {
            return Err(CreatorError::UnsupportedFsType(format!(
                "{fstype} has no mountable filesystem"
            ))
            .into())
        }
    };
    Ok(driver)
}

/// Bracket-narrowing search for the smallest `t` in `(bot, top]` for which
/// `attempt(t)` succeeds, assuming `attempt(top)` does. Stops when
/// `top == bot + 1`.
pub async fn search_minimal<F, Fut>(mut bot: u64, mut top: u64, mut attempt: F) -> Result<u64>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    while top > bot + 1 {
        let t = bot + (top - bot) / 2;
        if attempt(t).await? {
            top = t;
        } else {
            bot = t;
        }
    }
    Ok(top)
}
