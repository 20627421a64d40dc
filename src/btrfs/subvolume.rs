use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{
    context::BuildContext,
    error::MountError,
    fs::{cmd::CheckCommandOutput as _, fsmount::FsMount, mount::MountPoint},
};

use super::{
    format_metadata_line, join_options, parse_metadata, parse_subvolume_id, strip_subvol_options,
    SubvolumeSpec, METADATA_FILE,
};

/// Options the filesystem root is mounted with while subvolumes are created
/// and snapshotted.
const TOP_LEVEL_OPTIONS: &str = "subvolid=0";

/// Creates, mounts and snapshots the subvolumes of btrfs root partitions.
///
/// Every operation takes the [`FsMount`] of the root partition of one disk;
/// subvolumes of other disks are left alone.
pub struct BtrfsSubvolumeManager {
    ctx: BuildContext,
    subvolumes: Vec<SubvolumeSpec>,
    /// Non-root subvolume mounts, in mount order.
    mounts: Vec<(usize, MountPoint)>,
    snapshot_created: bool,
}

impl BtrfsSubvolumeManager {
    pub fn new(ctx: BuildContext, subvolumes: Vec<SubvolumeSpec>) -> Self {
        Self {
            ctx,
            subvolumes,
            mounts: Vec::new(),
            snapshot_created: false,
        }
    }

    pub fn subvolumes(&self) -> &[SubvolumeSpec] {
        &self.subvolumes
    }

    pub fn has_subvolumes(&self, disk: &str) -> bool {
        self.subvolumes.iter().any(|s| s.disk == disk)
    }

    fn indices_on(&self, disk: &str) -> Vec<usize> {
        (0..self.subvolumes.len())
            .filter(|i| self.subvolumes[*i].disk == disk)
            .collect()
    }

    async fn mount_top_level(root: &mut FsMount) -> Result<()> {
        if root.is_mounted() {
            root.remount(Some(TOP_LEVEL_OPTIONS)).await
        } else {
            root.mount(Some(TOP_LEVEL_OPTIONS)).await
        }
    }

    /// The root partition's own options: its `subvol=` is dropped because the
    /// default subvolume already points there.
    pub fn root_options(root: &FsMount) -> Option<String> {
        root.fsopts()
            .map(strip_subvol_options)
            .filter(|opts| !opts.is_empty())
    }

    /// Mounts the top level of a freshly formatted root partition, creates all
    /// subvolumes of `disk`, selects the default one and writes the metadata.
    pub async fn create_subvolumes(&mut self, root: &mut FsMount, disk: &str) -> Result<()> {
        Self::mount_top_level(root).await?;
        let mountdir = root.mountdir().to_path_buf();
        let indices = self.indices_on(disk);

        for i in &indices {
            let path = mountdir.join(&self.subvolumes[*i].name);
            tracing::debug!(?path, "Creating subvolume");
            Command::new("btrfs")
                .arg("subvolume")
                .arg("create")
                .arg(&path)
                .run_in(&self.ctx)
                .await
                .with_context(|| MountError::new(format!("Failed to create subvolume {path:?}")))?;
        }

        let list = Command::new("btrfs")
            .arg("subvolume")
            .arg("list")
            .arg(&mountdir)
            .run_in(&self.ctx)
            .await
            .context(MountError::new("Failed to list subvolumes"))?;
        let list = String::from_utf8_lossy(&list);
        for i in &indices {
            let id = parse_subvolume_id(&list, &self.subvolumes[*i].name)?;
            self.subvolumes[*i].id = Some(id);
        }

        if let Some(default) = indices
            .iter()
            .map(|i| &self.subvolumes[*i])
            .find(|subvolume| subvolume.is_root())
        {
            let id = default.id.unwrap_or_default().to_string();
            tracing::info!(name = %default.name, %id, "Setting default subvolume");
            Command::new("btrfs")
                .arg("subvolume")
                .arg("set-default")
                .arg(&id)
                .arg(&mountdir)
                .run_in(&self.ctx)
                .await
                .context(MountError::new("Failed to set default subvolume"))?;
        }

        let metadata: String = indices
            .iter()
            .map(|i| format_metadata_line(&self.subvolumes[*i]) + "\n")
            .collect();
        tokio::fs::write(mountdir.join(METADATA_FILE), metadata)
            .await
            .context(MountError::new("Failed to write subvolume metadata"))?;
        Ok(())
    }

    /// Reuse path: replaces the subvolumes of `disk` with what the metadata
    /// file of an existing image says.
    pub async fn load_subvolumes(&mut self, root: &mut FsMount, disk: &str) -> Result<()> {
        Self::mount_top_level(root).await?;
        let path = root.mountdir().join(METADATA_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| MountError::new(format!("Failed to read {path:?}")))?;

        let size = self
            .subvolumes
            .iter()
            .find(|s| s.disk == disk)
            .map(|s| s.size)
            .unwrap_or_default();
        let loaded = parse_metadata(&content, disk, size)?;
        tracing::debug!(disk, count = loaded.len(), "Loaded subvolume metadata");

        self.subvolumes.retain(|s| s.disk != disk);
        self.subvolumes.extend(loaded);
        Ok(())
    }

    /// Remounts the root with its real options so the default subvolume is
    /// what shows up at `chroot_root`, then mounts every other subvolume of
    /// `disk` below it.
    pub async fn mount_subvolumes(
        &mut self,
        root: &mut FsMount,
        disk: &str,
        chroot_root: &Path,
    ) -> Result<()> {
        let root_options = Self::root_options(root);
        root.set_fsopts(root_options.clone());
        root.remount(root_options.as_deref()).await?;

        let device = root
            .device()
            .map(Path::to_path_buf)
            .context(MountError::new("Btrfs root has no device node"))?;

        let mut indices: Vec<usize> = self
            .indices_on(disk)
            .into_iter()
            .filter(|i| !self.subvolumes[*i].is_root())
            .collect();
        indices.sort_by(|a, b| {
            self.subvolumes[*a]
                .mountpoint
                .cmp(&self.subvolumes[*b].mountpoint)
        });

        for i in indices {
            let subvolume = &self.subvolumes[i];
            let options = join_options(
                &strip_subvol_options(&subvolume.fsopts),
                &format!("subvolrootid=0,subvol={}", subvolume.name),
            );
            let mountdir = mountpoint_under(chroot_root, &subvolume.mountpoint);

            let mut mount =
                MountPoint::new(self.ctx.clone(), &device, mountdir, Some("btrfs"), true);
            mount.mount(Some(&options)).await?;
            self.subvolumes[i].mounted = true;
            self.mounts.push((i, mount));
        }
        Ok(())
    }

    /// Unmounts the subvolume mounts in reverse order. Failures are returned
    /// only after every mount was attempted.
    pub async fn unmount_subvolumes(&mut self) -> Result<()> {
        let mut result = Ok(());
        while let Some((i, mut mount)) = self.mounts.pop() {
            match mount.unmount().await {
                Ok(()) => self.subvolumes[i].mounted = false,
                Err(error) => {
                    tracing::warn!("{error:#}");
                    if result.is_ok() {
                        result = Err(error);
                    }
                }
            }
        }
        result
    }

    /// Takes a timestamped snapshot of every subvolume of `disk`, once per
    /// manager. The root is left mounted at its top level.
    pub async fn snapshot_subvolumes(&mut self, root: &mut FsMount, disk: &str) -> Result<()> {
        if self.snapshot_created {
            return Ok(());
        }

        let base = Self::root_options(root).unwrap_or_default();
        root.remount(Some(&join_options(&base, TOP_LEVEL_OPTIONS))).await?;
        let mountdir = root.mountdir().to_path_buf();
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M").to_string();

        for i in self.indices_on(disk) {
            let name = &self.subvolumes[i].name;
            let source = mountdir.join(name);
            let target = mountdir.join(snapshot_name(name, &timestamp));
            tracing::info!(?source, ?target, "Snapshotting subvolume");
            Command::new("btrfs")
                .arg("subvolume")
                .arg("snapshot")
                .arg(&source)
                .arg(&target)
                .run_in(&self.ctx)
                .await
                .with_context(|| MountError::new(format!("Failed to snapshot {source:?}")))?;
        }

        self.snapshot_created = true;
        Ok(())
    }
}

pub fn snapshot_name(name: &str, timestamp: &str) -> String {
    format!("{name}_{timestamp}-1")
}

fn mountpoint_under(root: &Path, mountpoint: &str) -> PathBuf {
    root.join(mountpoint.trim_start_matches('/'))
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::{fs::block::disk::Disk, types::FsType};

    fn subvolume(disk: &str, mountpoint: &str, name: &str) -> SubvolumeSpec {
        SubvolumeSpec {
            size: 2048,
            disk: disk.into(),
            mountpoint: mountpoint.into(),
            fsopts: format!("subvol={name}"),
            name: name.into(),
            boot: false,
            mounted: false,
            id: None,
        }
    }

    #[test]
    fn test_snapshot_name() {
        assert_eq!(snapshot_name("home", "20240102-0304"), "home_20240102-0304-1");
    }

    #[test]
    fn test_mountpoint_under() {
        assert_eq!(
            mountpoint_under(Path::new("/var/tmp/root"), "/home"),
            PathBuf::from("/var/tmp/root/home")
        );
        assert_eq!(
            mountpoint_under(Path::new("/var/tmp/root"), "/"),
            PathBuf::from("/var/tmp/root/")
        );
    }

    #[test]
    fn test_root_options_drop_subvol() -> Result<()> {
        let root = FsMount::new(
            BuildContext::default(),
            Disk::raw("/dev/null", 0),
            FsType::Btrfs,
            "/mnt",
            "platform",
            Some("compress=zlib,subvol=root".into()),
        )?;
        assert_eq!(
            BtrfsSubvolumeManager::root_options(&root),
            Some("compress=zlib".to_owned())
        );

        let root = FsMount::new(
            BuildContext::default(),
            Disk::raw("/dev/null", 0),
            FsType::Btrfs,
            "/mnt",
            "platform",
            Some("subvol=root".into()),
        )?;
        assert_eq!(BtrfsSubvolumeManager::root_options(&root), None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_unmount_without_mounts_is_noop() -> Result<()> {
        let mut manager = BtrfsSubvolumeManager::new(
            BuildContext::default(),
            vec![subvolume("sda", "/", "root"), subvolume("sdb", "/data", "data")],
        );
        assert!(manager.has_subvolumes("sda"));
        assert!(!manager.has_subvolumes("sdc"));
        assert_eq!(manager.indices_on("sdb"), vec![1]);

        manager.unmount_subvolumes().await?;
        manager.unmount_subvolumes().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    #[ignore = "requires root, the loop module and btrfs-progs"]
    async fn test_subvolume_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chroot_root = dir.path().join("root");
        let ctx = BuildContext::default();
        let mut root = FsMount::new(
            ctx.clone(),
            Disk::sparse_loopback(dir.path().join("btrfs.img"), 512 << 20),
            FsType::Btrfs,
            &chroot_root,
            "platform",
            Some("subvol=root".into()),
        )?;
        let mut manager = BtrfsSubvolumeManager::new(
            ctx,
            vec![subvolume("sda", "/", "root"), subvolume("sda", "/home", "home")],
        );

        manager.create_subvolumes(&mut root, "sda").await?;
        let created = manager.subvolumes().to_vec();
        assert!(created.iter().all(|s| s.id.is_some()));

        manager.mount_subvolumes(&mut root, "sda", &chroot_root).await?;
        assert!(crate::fs::mount::is_mounted(&chroot_root.join("home"))?);
        manager.unmount_subvolumes().await?;

        // Reading the metadata back gives the same subvolumes
        manager.load_subvolumes(&mut root, "sda").await?;
        assert_eq!(manager.subvolumes(), &created[..]);

        manager.snapshot_subvolumes(&mut root, "sda").await?;
        manager.snapshot_subvolumes(&mut root, "sda").await?;
        root.cleanup().await;
        Ok(())
    }
}
