use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::{
    context::BuildContext,
    error::SnapshotError,
    fs::{
        block::{
            disk::{truncate_file, Disk},
            snapshot::DeviceMapperSnapshot,
        },
        driver::ext::{e2fsck, resize2fs},
        squash::mksquashfs,
    },
};

pub const DEFAULT_COW_SIZE: u64 = 64 * 1024 * 1024;

/// Name of the scratch COW file, placed next to the output artifact.
const COW_FILE_NAME: &str = "osmin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimizedDelta {
    pub path: PathBuf,
    /// Bytes of the COW store the shrink touched.
    pub cow_used: u64,
}

/// Shrinks an ext filesystem image without touching it: the resize runs on a
/// device-mapper snapshot and only the copy-on-write delta is kept.
pub struct ImageMinimizer {
    ctx: BuildContext,
    cow_size: u64,
    compressor: Option<String>,
}

impl ImageMinimizer {
    pub fn new(ctx: BuildContext) -> Self {
        Self {
            ctx,
            cow_size: DEFAULT_COW_SIZE,
            compressor: None,
        }
    }

    pub fn with_cow_size(mut self, cow_size: u64) -> Self {
        self.cow_size = cow_size;
        self
    }

    pub fn with_compressor(mut self, compressor: Option<String>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn cow_path(output: &Path) -> PathBuf {
        output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(COW_FILE_NAME)
    }

    async fn shrink_in_snapshot(
        &self,
        snapshot: &mut DeviceMapperSnapshot,
        minimal_size: u64,
    ) -> Result<u64> {
        snapshot.create().await?;
        let device = snapshot
            .path()
            .context(SnapshotError::new("Snapshot device vanished"))?;

        e2fsck(&self.ctx, &device).await?;
        resize2fs(&self.ctx, &device, minimal_size).await?;
        snapshot.cow_used()
    }

    pub async fn minimize(
        &self,
        image: &Path,
        minimal_size: u64,
        output: &Path,
    ) -> Result<MinimizedDelta> {
        let cow_path = Self::cow_path(output);
        let result = self
            .minimize_with_cow(image, minimal_size, output, &cow_path)
            .await;

        if cow_path.exists() {
            if let Err(error) = tokio::fs::remove_file(&cow_path).await {
                tracing::warn!(?error, "Failed to remove COW file {cow_path:?}");
            }
        }
        result
    }

    async fn minimize_with_cow(
        &self,
        image: &Path,
        minimal_size: u64,
        output: &Path,
        cow_path: &Path,
    ) -> Result<MinimizedDelta> {
        let base = Disk::loopback(image)?;
        let cow = Disk::sparse_loopback(cow_path, self.cow_size);
        let mut snapshot = DeviceMapperSnapshot::new(self.ctx.clone(), base, cow);

        tracing::info!(?image, minimal_size, "Shrinking filesystem in a snapshot");
        let shrunk = self.shrink_in_snapshot(&mut snapshot, minimal_size).await;
        let removed = snapshot.remove().await;
        let cow_used = match (shrunk, removed) {
            (Ok(cow_used), Ok(())) => cow_used,
            (Ok(_), Err(error)) => return Err(error),
            (Err(error), Ok(())) => return Err(error),
            (Err(error), Err(remove_error)) => {
                tracing::warn!("{remove_error:#}");
                return Err(error);
            }
        };
        drop(snapshot);

        tracing::debug!(cow_used, "Measured COW usage");
        truncate_file(cow_path, cow_used).await?;
        mksquashfs(&self.ctx, cow_path, output, self.compressor.as_deref()).await?;

        Ok(MinimizedDelta {
            path: output.to_path_buf(),
            cow_used,
        })
    }
}
