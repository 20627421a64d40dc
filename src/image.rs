//! Builds a partitioned image from a planned layout: disks, partition tables,
//! device mappings, then one filesystem per partition mounted below a root
//! directory in mount order.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use indexmap::IndexMap;

use crate::{
    btrfs::BtrfsSubvolumeManager,
    context::BuildContext,
    error::MountError,
    fs::{block::disk::Disk, driver::swap::mkswap, fsmount::FsMount},
    partition::{PartitionLayout, PartitionMapping, PartitionTable},
    types::{FsType, SECTOR_SIZE},
};

/// How one named disk of the layout is backed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskTarget {
    /// A pre-existing block device. When unset an image file is created.
    pub device: Option<PathBuf>,
    /// Bytes; the layout minimum wins when it is larger.
    pub size: Option<u64>,
}

/// `<output_dir>/<name>-<disk>.raw`
pub fn disk_image_path(output_dir: &Path, name: &str, disk: &str) -> PathBuf {
    output_dir.join(format!("{name}-{disk}.raw"))
}

fn mountpoint_under(root: &Path, mountpoint: &str) -> PathBuf {
    root.join(mountpoint.trim_start_matches('/'))
}

/// Keeps the first error and logs the rest.
fn keep_first(result: &mut Result<()>, outcome: Result<()>) {
    if let Err(error) = outcome {
        tracing::warn!("{error:#}");
        if result.is_ok() {
            *result = Err(error);
        }
    }
}

/// Fields drop in declaration order: subvolume mounts, then partition mounts,
/// then device mappings, then loop devices.
pub struct PartitionedImage {
    subvolumes: BtrfsSubvolumeManager,
    /// `(partition index, mount)` in mount order.
    mounts: Vec<(usize, FsMount)>,
    mappings: IndexMap<String, PartitionMapping>,
    disks: IndexMap<String, Disk>,
    ctx: BuildContext,
    name: String,
    output_dir: PathBuf,
    root: PathBuf,
    layout: PartitionLayout,
    targets: IndexMap<String, DiskTarget>,
    uuids: Vec<Option<String>>,
}

impl PartitionedImage {
    pub fn new(
        ctx: BuildContext,
        name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        layout: PartitionLayout,
        targets: IndexMap<String, DiskTarget>,
    ) -> Self {
        let subvolumes = BtrfsSubvolumeManager::new(ctx.clone(), layout.subvolumes.clone());
        let uuids = vec![None; layout.partitions.len()];
        Self {
            subvolumes,
            mounts: Vec::new(),
            mappings: IndexMap::new(),
            disks: IndexMap::new(),
            ctx,
            name: name.into(),
            output_dir: output_dir.into(),
            root: root.into(),
            layout,
            targets,
            uuids,
        }
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem UUID of the partition mounted at `mountpoint`, once created.
    pub fn uuid_of(&self, mountpoint: &str) -> Option<&str> {
        self.layout
            .partitions
            .iter()
            .position(|partition| partition.mountpoint == mountpoint)
            .and_then(|index| self.uuids[index].as_deref())
    }

    /// The image files this build writes. Raw disks are not listed.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.layout
            .disks
            .keys()
            .filter(|disk| {
                self.targets
                    .get(*disk)
                    .map_or(true, |target| target.device.is_none())
            })
            .map(|disk| disk_image_path(&self.output_dir, &self.name, disk))
            .collect()
    }

    async fn attach_disks(&mut self) -> Result<()> {
        for (name, disk_layout) in &self.layout.disks {
            let target = self.targets.get(name).cloned().unwrap_or_default();
            let size = target.size.unwrap_or_default().max(disk_layout.min_size());
            let mut disk = match &target.device {
                Some(device) => Disk::raw(device, size),
                None => Disk::sparse_loopback(
                    disk_image_path(&self.output_dir, &self.name, name),
                    size,
                ),
            };
            disk.create().await?;
            let device = disk
                .device()
                .map(Path::to_path_buf)
                .context(MountError::new("Disk has no device node"))?;
            self.disks.insert(name.clone(), disk);

            let partitions: Vec<_> = self.layout.partitions_on(name).collect();
            if self.ctx.skip_format {
                tracing::info!(disk = %name, "Reusing existing partition table");
            } else {
                PartitionTable::new(&self.ctx, &device)
                    .write(disk_layout, &partitions)
                    .await?;
            }

            let mapping =
                PartitionMapping::map(&self.ctx, &device, disk_layout.table_entries()).await?;
            self.mappings.insert(name.clone(), mapping);
        }
        Ok(())
    }

    fn partition_device(&self, index: usize) -> Result<PathBuf> {
        let partition = &self.layout.partitions[index];
        self.mappings
            .get(&partition.disk)
            .and_then(|mapping| mapping.device_for(partition.num))
            .map(Path::to_path_buf)
            .with_context(|| {
                MountError::new(format!(
                    "No device node for partition {} of disk {}",
                    partition.num, partition.disk
                ))
            })
    }

    async fn format_swap(&mut self) -> Result<()> {
        if self.ctx.skip_format {
            return Ok(());
        }
        for index in 0..self.layout.partitions.len() {
            if !self.layout.partitions[index].is_swap() {
                continue;
            }
            let device = self.partition_device(index)?;
            let uuid = mkswap(&self.ctx, &device, &self.layout.partitions[index].label).await?;
            self.uuids[index] = Some(uuid);
        }
        Ok(())
    }

    async fn mount_partition(&mut self, index: usize) -> Result<()> {
        let device = self.partition_device(index)?;
        let partition = self.layout.partitions[index].clone();
        let mountdir = mountpoint_under(&self.root, &partition.mountpoint);
        tracing::info!(mountpoint = %partition.mountpoint, ?device, fstype = %partition.fstype, "Mounting partition");

        let mut fs = FsMount::new(
            self.ctx.clone(),
            Disk::raw(device, partition.size * SECTOR_SIZE),
            partition.fstype,
            mountdir,
            partition.label.clone(),
            partition.fsopts.clone(),
        )?;

        let with_subvolumes = partition.fstype == FsType::Btrfs
            && partition.mountpoint == "/"
            && self.subvolumes.has_subvolumes(&partition.disk);
        let result = if with_subvolumes {
            self.mount_btrfs_root(&mut fs, &partition.disk).await
        } else {
            fs.mount(None).await
        };

        self.uuids[index] = fs.uuid().map(str::to_owned);
        // Tracked even on failure so teardown covers a half-mounted root
        self.mounts.push((index, fs));
        result
    }

    async fn mount_btrfs_root(&mut self, fs: &mut FsMount, disk: &str) -> Result<()> {
        if self.ctx.skip_format {
            self.subvolumes.load_subvolumes(fs, disk).await?;
        } else {
            self.subvolumes.create_subvolumes(fs, disk).await?;
        }
        self.subvolumes.mount_subvolumes(fs, disk, &self.root).await
    }

    /// Creates or reuses every disk, table and filesystem, and mounts the
    /// partitions below the root directory in mount order.
    pub async fn mount(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {:?}", self.root))?;
        if !self.artifacts().is_empty() {
            tokio::fs::create_dir_all(&self.output_dir)
                .await
                .with_context(|| format!("Failed to create {:?}", self.output_dir))?;
        }

        self.attach_disks().await?;
        self.format_swap().await?;
        for index in self.layout.mount_order() {
            self.mount_partition(index).await?;
        }
        Ok(())
    }

    /// Unmounts subvolumes, snapshots them, then unmounts the partitions in
    /// reverse mount order. Every step is attempted; the first error is
    /// returned.
    pub async fn unmount(&mut self) -> Result<()> {
        let mut result = Ok(());
        keep_first(&mut result, self.subvolumes.unmount_subvolumes().await);

        for (index, fs) in self.mounts.iter_mut() {
            let partition = &self.layout.partitions[*index];
            if partition.fstype == FsType::Btrfs
                && partition.mountpoint == "/"
                && self.subvolumes.has_subvolumes(&partition.disk)
            {
                let outcome = self.subvolumes.snapshot_subvolumes(fs, &partition.disk).await;
                keep_first(&mut result, outcome);
            }
        }

        while let Some((index, mut fs)) = self.mounts.pop() {
            tracing::debug!(mountpoint = %self.layout.partitions[index].mountpoint, "Unmounting partition");
            keep_first(&mut result, fs.unmount().await);
        }
        result
    }

    /// Unmounts, removes the device mappings and detaches the disks.
    pub async fn cleanup(&mut self) -> Result<()> {
        let mut result = self.unmount().await;

        while let Some((_, mut mapping)) = self.mappings.pop() {
            keep_first(&mut result, mapping.unmap().await);
        }
        while let Some((_, mut disk)) = self.disks.pop() {
            disk.cleanup();
        }
        result
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::{
        partition::{PartitionPlanner, PartitionRequest},
        types::mb_to_sectors,
    };

    fn request(disk: &str, mountpoint: &str, size_mb: u64, fstype: FsType) -> PartitionRequest {
        PartitionRequest {
            size: mb_to_sectors(size_mb),
            disk: disk.into(),
            mountpoint: mountpoint.into(),
            fstype,
            fsopts: None,
            label: None,
            boot: false,
            align_kb: None,
        }
    }

    #[test]
    fn test_artifacts_skip_raw_disks() -> Result<()> {
        let mut planner = PartitionPlanner::new();
        planner.add_disk("sda");
        planner.add_disk("sdb");
        planner.add_partition(request("sda", "/", 64, FsType::Ext4))?;
        planner.add_partition(request("sdb", "/data", 64, FsType::Ext4))?;
        let layout = planner.plan()?;

        let mut targets = IndexMap::new();
        targets.insert(
            "sdb".to_owned(),
            DiskTarget {
                device: Some("/dev/sdb".into()),
                size: None,
            },
        );
        let image = PartitionedImage::new(
            BuildContext::default(),
            "fedora",
            "/var/tmp/out",
            "/var/tmp/out/root",
            layout,
            targets,
        );
        assert_eq!(
            image.artifacts(),
            vec![PathBuf::from("/var/tmp/out/fedora-sda.raw")]
        );
        assert_eq!(image.uuid_of("/"), None);
        Ok(())
    }

    #[test]
    fn test_mountpoint_under() {
        let root = Path::new("/var/tmp/root");
        assert_eq!(mountpoint_under(root, "/"), root);
        assert_eq!(mountpoint_under(root, "/boot/efi"), root.join("boot/efi"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    #[ignore = "requires root, the loop module, parted, kpartx and e2fsprogs"]
    async fn test_mount_and_cleanup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut planner = PartitionPlanner::new();
        planner.add_disk("sda");
        planner.add_partition(request("sda", "/", 32, FsType::Ext4))?;
        planner.add_partition(request("sda", "/boot", 16, FsType::Ext2))?;
        planner.add_partition(request("sda", "swap", 8, FsType::Swap))?;
        let layout = planner.plan()?;

        let root = dir.path().join("root");
        let mut image = PartitionedImage::new(
            BuildContext::default(),
            "test",
            dir.path(),
            &root,
            layout,
            IndexMap::new(),
        );
        let result = image.mount().await;
        if result.is_ok() {
            assert!(crate::fs::mount::is_mounted(&root)?);
            assert!(crate::fs::mount::is_mounted(&root.join("boot"))?);
            assert!(image.uuid_of("/").is_some());
            assert!(image.uuid_of("swap").is_some());
        }
        image.cleanup().await?;
        result?;

        assert!(crate::fs::mount::mounts_under(&root)?.is_empty());
        assert!(dir.path().join("test-sda.raw").exists());
        Ok(())
    }
}
