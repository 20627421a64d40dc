use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::{
    context::BuildContext,
    error::MountError,
    fs::{
        block::disk::Disk,
        driver::{self, FilesystemDriver},
        mount::MountPoint,
    },
    types::FsType,
};

/// A filesystem on a [`Disk`]: created or reused on first mount, mounted
/// through a [`MountPoint`].
///
/// Fields drop in declaration order, so the mount goes away before the loop
/// device behind it is detached.
pub struct FsMount {
    mount: MountPoint,
    driver: Box<dyn FilesystemDriver>,
    disk: Disk,
    ctx: BuildContext,
    label: String,
    fsopts: Option<String>,
    uuid: Option<String>,
}

impl FsMount {
    pub fn new(
        ctx: BuildContext,
        disk: Disk,
        fstype: FsType,
        mountdir: impl Into<PathBuf>,
        label: impl Into<String>,
        fsopts: Option<String>,
    ) -> Result<Self> {
        let driver = driver::driver_for(fstype, &ctx)?;
        let mount = MountPoint::new(
            ctx.clone(),
            disk.path(),
            mountdir,
            Some(&fstype.to_string()),
            true,
        );
        Ok(Self {
            mount,
            driver,
            disk,
            ctx,
            label: label.into(),
            fsopts,
            uuid: None,
        })
    }

    pub fn fstype(&self) -> FsType {
        self.driver.fstype()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn device(&self) -> Option<&Path> {
        self.disk.device()
    }

    pub fn mountdir(&self) -> &Path {
        self.mount.mountdir()
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn fsopts(&self) -> Option<&str> {
        self.fsopts.as_deref()
    }

    pub fn set_fsopts(&mut self, fsopts: Option<String>) {
        self.fsopts = fsopts;
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_active()
    }

    /// Whether an existing filesystem should be picked up instead of formatting.
    fn reuse_existing(&self) -> bool {
        self.ctx.skip_format || (!self.disk.fixed() && self.disk.exists())
    }

    async fn create(&mut self) -> Result<()> {
        self.driver.prepare().await?;

        let reuse = self.reuse_existing();
        if reuse && !self.disk.fixed() {
            // Grow the image file to its nominal size before it is attached
            let size = self.disk.size();
            self.driver.resize(&mut self.disk, size).await?;
        }

        self.disk.create().await?;
        let device = self
            .disk
            .device()
            .map(Path::to_path_buf)
            .context(MountError::new("Disk has no device node"))?;

        let uuid = if reuse {
            tracing::debug!(?device, "Reusing existing {} filesystem", self.fstype());
            self.driver.read_uuid(&device).await?
        } else {
            self.driver.format(&device, &self.label).await?
        };
        tracing::debug!(?device, %uuid, "Filesystem ready");

        self.mount.set_device(device);
        self.uuid = Some(uuid);
        Ok(())
    }

    /// Mounts with `options`, falling back to the configured fsopts and then
    /// the driver defaults. The filesystem is created on the first call only.
    pub async fn mount(&mut self, options: Option<&str>) -> Result<()> {
        if self.mount.is_active() {
            return Ok(());
        }
        if self.uuid.is_none() {
            self.create().await?;
        } else if self.disk.device().is_none() {
            // Detached by an earlier cleanup or resparse
            self.disk.create().await?;
            if let Some(device) = self.disk.device().map(Path::to_path_buf) {
                self.mount.set_device(device);
            }
        }

        let options = options
            .or(self.fsopts.as_deref())
            .or(self.driver.default_mount_options())
            .map(str::to_owned);
        self.mount.mount(options.as_deref()).await
    }

    pub async fn remount(&mut self, options: Option<&str>) -> Result<()> {
        self.mount.remount(options).await
    }

    pub async fn unmount(&mut self) -> Result<()> {
        self.mount.unmount().await
    }

    /// Unmounts and detaches. Problems are logged, never returned.
    pub async fn cleanup(&mut self) {
        if let Err(error) = self.unmount().await {
            tracing::warn!("{error:#}");
        }
        self.disk.cleanup();
    }

    /// Shrinks the filesystem and its backing file to the minimum, then grows
    /// it back to `size` when given. Returns the minimal size in bytes.
    pub async fn resparse(&mut self, size: Option<u64>) -> Result<u64> {
        self.cleanup().await;

        let minimal = self.driver.minimal_size(&self.disk).await?;
        if !self.disk.fixed() {
            self.disk.truncate(minimal).await?;
        }

        if let Some(size) = size.filter(|size| *size > minimal) {
            self.driver.resize(&mut self.disk, size).await?;
        }

        tracing::info!(image = ?self.disk.path(), minimal, "Resparsed filesystem");
        Ok(minimal)
    }
}
