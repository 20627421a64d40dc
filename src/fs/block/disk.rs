use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use again::RetryPolicy;
use anyhow::{Context as _, Result};
use loopdev::{LoopControl, LoopDevice};
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};

use crate::error::MountError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskBacking {
    /// A sparse image file, expanded to the target size on create.
    SparseFile,
    /// An existing image file used as-is.
    File,
    /// A pre-existing block device.
    Raw,
}

/// One backing store of an image: an image file bound to a loop device, or a
/// raw block device.
pub struct Disk {
    path: PathBuf,
    size: u64,
    backing: DiskBacking,
    loop_device: Option<LoopDevice>,
    device: Option<PathBuf>,
}

impl Disk {
    pub fn sparse_loopback(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            backing: DiskBacking::SparseFile,
            loop_device: None,
            device: None,
        }
    }

    /// An existing image file. The size is taken from the file itself.
    pub fn loopback(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat image file {path:?}"))?
            .len();
        Ok(Self {
            path,
            size,
            backing: DiskBacking::File,
            loop_device: None,
            device: None,
        })
    }

    pub fn raw(device: impl Into<PathBuf>, size: u64) -> Self {
        let device = device.into();
        Self {
            path: device.clone(),
            size,
            backing: DiskBacking::Raw,
            loop_device: None,
            device: Some(device),
        }
    }

    /// The image file, or the device node for raw disks.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn backing(&self) -> DiskBacking {
        self.backing
    }

    /// Raw disks cannot be grown or shrunk.
    pub fn fixed(&self) -> bool {
        self.backing == DiskBacking::Raw
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// The block device node, available after [`Disk::create`].
    pub fn device(&self) -> Option<&Path> {
        self.device.as_deref()
    }

    pub async fn create(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        if self.backing == DiskBacking::SparseFile {
            expand_file(&self.path, self.size, true).await?;
        }

        let lc = LoopControl::open()
            .context("Failed to open loop control, maybe forgot to run 'sudo modprobe loop'?")
            .context(MountError::new("Failed to allocate loop device"))?;
        let path = &self.path;
        // Loop device numbers race with other attachers; retry until one sticks
        let ld = RetryPolicy::exponential(Duration::from_millis(1))
            .with_max_retries(200)
            .with_max_delay(Duration::from_millis(1000))
            .retry(|| async {
                let ld = lc.next_free()?;
                ld.with().attach(path)?;
                Ok::<_, anyhow::Error>(ld)
            })
            .await
            .with_context(|| MountError::new(format!("Failed to attach {path:?} to a loop device")))?;

        let device = ld.path().context("Unknown loop device path")?;
        tracing::debug!(file = ?self.path, ?device, "Attached loop device");

        self.device = Some(device);
        self.loop_device = Some(ld);
        Ok(())
    }

    /// Detaches the loop device if one is attached. Never fails, problems are logged.
    pub fn cleanup(&mut self) {
        if self.backing == DiskBacking::Raw {
            return;
        }

        if let Some(ld) = self.loop_device.take() {
            if let Err(e) = ld
                .detach()
                .with_context(|| format!("Failed to detach loop device {:?}", self.device))
            {
                tracing::warn!("{e:#}")
            } else {
                tracing::debug!(device = ?self.device, "Detached loop device");
            }
        }
        self.device = None;
    }

    /// Length of the backing file as it is on disk, which may still be short
    /// of [`Disk::size`]. Raw disks report their configured size.
    pub async fn stored_len(&self) -> Result<u64> {
        if self.fixed() {
            return Ok(self.size);
        }
        Ok(tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to stat image file {:?}", self.path))?
            .len())
    }

    /// Grows the backing file to `size` bytes without allocating blocks.
    pub async fn expand(&mut self, size: u64) -> Result<()> {
        if self.fixed() {
            return Ok(());
        }
        expand_file(&self.path, size, false).await?;
        self.size = self.size.max(size);
        Ok(())
    }

    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        truncate_file(&self.path, size).await?;
        self.size = size;
        Ok(())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Makes `path` at least `size` bytes long by writing a single zero byte at the end.
pub async fn expand_file(path: &Path, size: u64, create: bool) -> Result<()> {
    if create {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {parent:?}"))?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(create)
        .mode(0o644)
        .open(path)
        .await
        .with_context(|| format!("Failed to open image file {path:?}"))?;

    let current = file.metadata().await?.len();
    if size == 0 || current >= size {
        return Ok(());
    }

    file.seek(std::io::SeekFrom::Start(size - 1)).await?;
    file.write_all(&[0]).await?;
    file.flush().await?;

    tracing::debug!(file = ?path, size, "Expanded sparse file");
    Ok(())
}

pub async fn truncate_file(path: &Path, size: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open image file {path:?}"))?;
    file.set_len(size)
        .await
        .with_context(|| format!("Failed to truncate {path:?} to {size} bytes"))?;
    Ok(())
}

#[cfg(test)]
pub mod tests {

    use std::os::linux::fs::MetadataExt;

    use super::*;
    use anyhow::Result;

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_expand_creates_sparse_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("disk.raw");
        let size = 1024 * 1024 * 1024;

        expand_file(&path, size, true).await?;

        let metadata = tokio::fs::metadata(&path).await?;
        assert_eq!(metadata.len(), size);
        assert!(metadata.st_blocks() * 512 < size);
        assert_eq!(metadata.st_mode() & 0o777, 0o644);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_expand_never_shrinks_and_truncate_does() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.raw");

        let mut disk = Disk::sparse_loopback(&path, 4096);
        expand_file(&path, 8192, true).await?;
        disk.expand(4096).await?;
        assert_eq!(tokio::fs::metadata(&path).await?.len(), 8192);

        disk.truncate(1024).await?;
        assert_eq!(tokio::fs::metadata(&path).await?.len(), 1024);
        assert_eq!(disk.size(), 1024);

        // An image reused at a larger nominal size is short until expanded
        disk.set_size(16384);
        assert_eq!(disk.stored_len().await?, 1024);
        disk.expand(16384).await?;
        assert_eq!(disk.stored_len().await?, 16384);

        Ok(())
    }

    #[test]
    fn test_raw_disk_is_fixed_and_cleanup_is_noop() {
        let mut disk = Disk::raw("/dev/sdz", 1 << 30);
        assert!(disk.fixed());
        assert_eq!(disk.device(), Some(Path::new("/dev/sdz")));
        disk.cleanup();
        disk.cleanup();
        assert_eq!(disk.device(), Some(Path::new("/dev/sdz")));
    }

    #[test]
    fn test_cleanup_without_create_is_noop() {
        let mut disk = Disk::sparse_loopback("/nonexistent/disk.raw", 4096);
        disk.cleanup();
        assert!(disk.device().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    #[ignore = "requires root and the loop module"]
    async fn test_create_attaches_loop_device() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut disk = Disk::sparse_loopback(dir.path().join("disk.raw"), 64 * 1024 * 1024);

        disk.create().await?;
        let device = disk.device().map(Path::to_path_buf);
        assert!(device.is_some());

        // Second create is a no-op
        disk.create().await?;
        assert_eq!(disk.device().map(Path::to_path_buf), device);

        disk.cleanup();
        assert!(disk.device().is_none());
        Ok(())
    }
}
