pub mod chroot;
pub mod global;
pub mod layout;

use std::{collections::HashSet, path::Path};

use anyhow::{Context as _, Result};
use chroot::ChrootConfig;
use global::GlobalConfig;
use indexmap::IndexMap;
use layout::{DiskConfig, PartitionConfig};
use serde::{Deserialize, Serialize};

use crate::{
    context::BuildContext,
    error::CreatorError,
    image::DiskTarget,
    partition::{PartitionLayout, PartitionPlanner, PartitionRequest},
    types::FsType,
};

/// The whole image description, read from one TOML file.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalConfig>,

    #[serde(default = "Default::default")]
    pub disk: Vec<DiskConfig>,

    /// Partitions in the order they are placed on their disks.
    #[serde(default = "Default::default")]
    pub partition: Vec<PartitionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chroot: Option<ChrootConfig>,
}

impl ImageConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        tracing::debug!("Loading image config from: {path:?}");
        let config = tokio::fs::read_to_string(path)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|content| Self::from_toml(&content))
            .with_context(|| format!("Failed to load image config from: {path:?}"))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config =
            toml::from_str::<ImageConfig>(content).context("Failed to parse content as TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.partition.is_empty() {
            return Err(CreatorError::InvalidConfig("No partitions defined".into()).into());
        }

        let mut disks = HashSet::new();
        for disk in &self.disk {
            if !disks.insert(disk.name.as_str()) {
                return Err(CreatorError::InvalidConfig(format!(
                    "Disk `{}` is defined more than once",
                    disk.name
                ))
                .into());
            }
        }

        let mut mountpoints = HashSet::new();
        for partition in &self.partition {
            if partition.fstype != FsType::Swap && !partition.mountpoint.starts_with('/') {
                return Err(CreatorError::InvalidConfig(format!(
                    "Mountpoint `{}` must be an absolute path",
                    partition.mountpoint
                ))
                .into());
            }
            if partition.size_mb == 0 {
                return Err(CreatorError::InvalidConfig(format!(
                    "Partition `{}` has no size",
                    partition.mountpoint
                ))
                .into());
            }
            if partition.fstype != FsType::Swap
                && !mountpoints.insert(partition.mountpoint.as_str())
            {
                return Err(CreatorError::InvalidConfig(format!(
                    "Mountpoint `{}` is used more than once",
                    partition.mountpoint
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn context(&self) -> BuildContext {
        BuildContext::from_global(self.global.as_ref())
    }

    pub fn chroot(&self) -> ChrootConfig {
        self.chroot.clone().unwrap_or_default()
    }

    pub fn planner(&self) -> Result<PartitionPlanner> {
        let mut planner = PartitionPlanner::new();
        for disk in &self.disk {
            planner.add_disk(disk.name.clone());
        }
        for partition in &self.partition {
            planner.add_partition(PartitionRequest::from(partition))?;
        }
        Ok(planner)
    }

    pub fn layout(&self) -> Result<PartitionLayout> {
        self.planner()?.plan()
    }

    pub fn disk_targets(&self) -> IndexMap<String, DiskTarget> {
        self.disk
            .iter()
            .map(|disk| {
                (
                    disk.name.clone(),
                    DiskTarget {
                        device: disk.device.clone(),
                        size: disk.size_mb.map(|size_mb| size_mb * 1024 * 1024),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    const RAW: &str = r#"
[global]
verbose = true
skip_format = false

[[disk]]
name = "sda"
size_mb = 512

[[disk]]
name = "sdb"
device = "/dev/sdb"

[[partition]]
disk = "sda"
mountpoint = "/"
size_mb = 100
fstype = "ext3"
fsopts = "defaults"

[[partition]]
disk = "sda"
mountpoint = "/boot"
size_mb = 50
fstype = "vfat"
boot = true

[[partition]]
disk = "sdb"
mountpoint = "swap"
size_mb = 16
fstype = "swap"

[chroot]
bind_mounts = ["/srv/cache:/var/cache/pkgs:ro"]
"#;

    #[test]
    fn test_load_full_config() -> Result<()> {
        let config = ImageConfig::from_toml(RAW)?;
        assert!(config.global.as_ref().is_some_and(|global| global.verbose));
        assert!(config.chroot().mount_parent);

        let layout = config.layout()?;
        assert_eq!(layout.partitions.len(), 3);
        assert_eq!(layout.partitions[0].label, "platform");
        assert_eq!(layout.partitions[1].start, 204800);
        assert_eq!(layout.partitions[2].label, "swap");

        let targets = config.disk_targets();
        assert_eq!(targets["sda"].size, Some(512 * 1024 * 1024));
        assert_eq!(targets["sdb"].device.as_deref(), Some(Path::new("/dev/sdb")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.toml");
        tokio::fs::write(&path, RAW).await?;
        let config = ImageConfig::load(&path).await?;
        assert_eq!(config.partition.len(), 3);

        assert!(ImageConfig::load(&dir.path().join("missing.toml")).await.is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_configs() {
        let invalid = [
            // No partitions
            "[[disk]]\nname = \"sda\"\n",
            // Unknown field
            "[global]\nverbose = true\nfoo = 1\n",
            // Duplicate mountpoint
            r#"
[[disk]]
name = "sda"
[[partition]]
disk = "sda"
mountpoint = "/"
size_mb = 10
fstype = "ext4"
[[partition]]
disk = "sda"
mountpoint = "/"
size_mb = 10
fstype = "ext4"
"#,
            // Relative mountpoint
            r#"
[[disk]]
name = "sda"
[[partition]]
disk = "sda"
mountpoint = "boot"
size_mb = 10
fstype = "ext4"
"#,
        ];
        for raw in invalid {
            assert!(ImageConfig::from_toml(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_partition_on_missing_disk() -> Result<()> {
        let raw = r#"
[[disk]]
name = "sda"
[[partition]]
disk = "sdc"
mountpoint = "/"
size_mb = 10
fstype = "ext4"
"#;
        let config = ImageConfig::from_toml(raw)?;
        let error = config.layout().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CreatorError>(),
            Some(CreatorError::MissingDisk { .. })
        ));
        Ok(())
    }
}
