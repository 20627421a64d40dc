use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{
    async_defer, context::BuildContext, error::MountError, fs::cmd::CheckCommandOutput as _,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPartition {
    pub num: u32,
    /// `/dev/mapper/<name>`.
    pub device: PathBuf,
    /// `<disk device><num>`, pointing at `device`.
    pub link: PathBuf,
}

/// Parses `kpartx -l -v` lines such as `loop0p1 : 0 204799 /dev/loop0 1` into
/// `(mapper name, partition number)`.
pub fn parse_kpartx_list(output: &str) -> Result<Vec<(String, u32)>> {
    output
        .lines()
        .filter(|line| line.contains(" : "))
        .map(|line| {
            let name = line.split_whitespace().next().unwrap_or_default();
            let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
            name[name.len() - digits..]
                .parse::<u32>()
                .map(|num| (name.to_owned(), num))
                .map_err(|_| {
                    anyhow::Error::from(MountError::new(format!(
                        "Unexpected kpartx output line: {line}"
                    )))
                })
        })
        .collect()
}

const MAPPER_DIR: &str = "/dev/mapper";

fn link_path(disk_device: &Path, num: u32) -> PathBuf {
    let mut link = disk_device.as_os_str().to_owned();
    link.push(num.to_string());
    PathBuf::from(link)
}

/// Whether `path` is a symlink into `/dev/mapper`. Device nodes and regular
/// files that happen to share the `<disk><num>` name are never ours.
async fn is_mapper_link(path: &Path) -> bool {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.file_type().is_symlink() => tokio::fs::read_link(path)
            .await
            .is_ok_and(|target| target.starts_with(MAPPER_DIR)),
        _ => false,
    }
}

/// Points `link` at `device`, replacing a stale mapper link but nothing else.
async fn install_link(link: &Path, device: &Path) -> Result<()> {
    if is_mapper_link(link).await {
        tokio::fs::remove_file(link)
            .await
            .with_context(|| MountError::new(format!("Failed to remove stale symlink {link:?}")))?;
    } else if tokio::fs::symlink_metadata(link).await.is_ok() {
        return Err(MountError::new(format!(
            "Refusing to replace {link:?} with a link to {device:?}: it is not a device-mapper link"
        ))
        .into());
    }

    tokio::fs::symlink(device, link)
        .await
        .with_context(|| MountError::new(format!("Failed to create symlink {link:?}")))
}

/// Device-mapper nodes for the partitions of one disk, created with kpartx.
pub struct PartitionMapping {
    ctx: BuildContext,
    kpartx: PathBuf,
    disk_device: PathBuf,
    partitions: Vec<MappedPartition>,
    mapped: bool,
}

impl PartitionMapping {
    /// Maps the partitions of `disk_device`, which must hold exactly
    /// `expected` table entries.
    pub async fn map(ctx: &BuildContext, disk_device: &Path, expected: usize) -> Result<Self> {
        Self::map_with(ctx, Path::new("kpartx"), disk_device, expected).await
    }

    async fn map_with(
        ctx: &BuildContext,
        kpartx: &Path,
        disk_device: &Path,
        expected: usize,
    ) -> Result<Self> {
        let stdout = Command::new(kpartx)
            .arg("-l")
            .arg("-v")
            .arg(disk_device)
            .run_in(ctx)
            .await
            .with_context(|| {
                MountError::new(format!("Failed to query partition mapping of {disk_device:?}"))
            })?;
        let listed = parse_kpartx_list(&String::from_utf8_lossy(&stdout))?;

        if listed.len() != expected {
            return Err(MountError::new(format!(
                "Unexpected number of partitions on {disk_device:?}: kpartx lists {} but {expected} were created",
                listed.len()
            ))
            .into());
        }

        let mut mapping = Self {
            ctx: ctx.clone(),
            kpartx: kpartx.to_path_buf(),
            disk_device: disk_device.to_path_buf(),
            partitions: listed
                .into_iter()
                .map(|(name, num)| MappedPartition {
                    num,
                    device: Path::new(MAPPER_DIR).join(name),
                    link: link_path(disk_device, num),
                })
                .collect(),
            mapped: false,
        };

        if let Err(error) = mapping.activate().await {
            // kpartx may fail after creating some of the nodes
            if let Err(cleanup_error) = mapping.unmap().await {
                tracing::warn!("{cleanup_error:#}");
                mapping.mapped = false;
            }
            mapping.remove_links().await;
            return Err(error);
        }
        Ok(mapping)
    }

    async fn activate(&mut self) -> Result<()> {
        for partition in &self.partitions {
            install_link(&partition.link, &partition.device).await?;
        }

        self.mapped = true;
        Command::new(&self.kpartx)
            .arg("-a")
            .arg("-v")
            .arg(&self.disk_device)
            .run_in(&self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!("Failed to map partitions of {:?}", self.disk_device))
            })?;
        tracing::debug!(disk = ?self.disk_device, partitions = ?self.partitions, "Mapped partitions");

        if let Ok(udevadm) = which::which("udevadm") {
            if let Err(error) = Command::new(udevadm).arg("settle").run_in(&self.ctx).await {
                tracing::warn!("{error:#}");
            }
        }
        Ok(())
    }

    pub fn partitions(&self) -> &[MappedPartition] {
        &self.partitions
    }

    pub fn device_for(&self, num: u32) -> Option<&Path> {
        self.partitions
            .iter()
            .find(|partition| partition.num == num)
            .map(|partition| partition.device.as_path())
    }

    async fn remove_links(&self) {
        for partition in &self.partitions {
            if !is_mapper_link(&partition.link).await {
                continue;
            }
            if let Err(error) = tokio::fs::remove_file(&partition.link).await {
                tracing::warn!(?error, "Failed to remove symlink {:?}", partition.link);
            }
        }
    }

    /// Removes the compatibility links, then the mapper nodes.
    pub async fn unmap(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }

        self.remove_links().await;
        Command::new(&self.kpartx)
            .arg("-d")
            .arg("-v")
            .arg(&self.disk_device)
            .run_in(&self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!("Failed to unmap partitions of {:?}", self.disk_device))
            })?;
        self.mapped = false;
        tracing::debug!(disk = ?self.disk_device, "Unmapped partitions");
        Ok(())
    }
}

impl Drop for PartitionMapping {
    fn drop(&mut self) {
        if !self.mapped {
            return;
        }

        async_defer! {
            async {
                if let Err(error) = self.unmap().await {
                    tracing::warn!("{error:#}");
                }
            }
        }
    }
}
