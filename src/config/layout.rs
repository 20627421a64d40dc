use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{partition::PartitionRequest, types::{mb_to_sectors, FsType}};

/// One disk of the image.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub name: String,

    /// Grow the image file beyond what the partitions need.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<u64>,

    /// Use this block device instead of an image file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub disk: String,

    pub mountpoint: String,

    pub size_mb: u64,

    pub fstype: FsType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fsopts: Option<String>,

    /// Defaults to `platform` for `/`, the last path component otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Start the partition on a multiple of this many KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub align_kb: Option<u64>,

    #[serde(default = "Default::default")]
    pub boot: bool,
}

impl From<&PartitionConfig> for PartitionRequest {
    fn from(config: &PartitionConfig) -> Self {
        PartitionRequest {
            size: mb_to_sectors(config.size_mb),
            disk: config.disk.clone(),
            mountpoint: config.mountpoint.clone(),
            fstype: config.fstype,
            fsopts: config.fsopts.clone(),
            label: config.label.clone(),
            boot: config.boot,
            align_kb: config.align_kb,
        }
    }
}
