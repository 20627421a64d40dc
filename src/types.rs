use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Size of a sector as used by parted, kpartx and device-mapper tables.
pub const SECTOR_SIZE: u64 = 512;

pub fn mb_to_sectors(size_mb: u64) -> u64 {
    size_mb * 1024 * 1024 / SECTOR_SIZE
}

pub fn kb_to_sectors(size_kb: u64) -> u64 {
    size_kb * 1024 / SECTOR_SIZE
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[serde(deny_unknown_fields)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Vfat,
    Msdos,
    Btrfs,
    Swap,
}

impl FsType {
    pub fn is_ext(&self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }

    pub fn is_fat(&self) -> bool {
        matches!(self, FsType::Vfat | FsType::Msdos)
    }

    /// The filesystem type hint passed to `parted mkpart`.
    pub fn parted_fs_type(&self) -> &'static str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Vfat | FsType::Msdos => "fat32",
            FsType::Btrfs => "btrfs",
            FsType::Swap => "linux-swap",
        }
    }
}

impl Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(serde_variant::to_variant_name(self).unwrap_or("<unknown>"))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PartitionType {
    Primary,
    Extended,
    Logical,
}

impl Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionType::Primary => write!(f, "primary"),
            PartitionType::Extended => write!(f, "extended"),
            PartitionType::Logical => write!(f, "logical"),
        }
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_size_conversion() {
        assert_eq!(mb_to_sectors(100), 204800);
        assert_eq!(kb_to_sectors(1024), 2048);
        assert_eq!(kb_to_sectors(4), 8);
    }

    #[test]
    fn test_fstype_display() {
        assert_eq!(FsType::Ext4.to_string(), "ext4");
        assert_eq!(FsType::Msdos.to_string(), "msdos");
        assert_eq!(FsType::Swap.parted_fs_type(), "linux-swap");
        assert!(FsType::Vfat.is_fat());
        assert!(!FsType::Btrfs.is_ext());
    }
}
