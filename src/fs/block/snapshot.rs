use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use again::RetryPolicy;
use anyhow::{Context as _, Result};
use devicemapper::{DevId, DmFlags, DmName, DmOptions, DM};
use rand::{distributions::Alphanumeric, Rng as _};

use crate::{
    async_defer,
    context::BuildContext,
    error::SnapshotError,
    fs::{block::disk::Disk, kmod},
    types::SECTOR_SIZE,
};

/// Chunk size of the persistent snapshot, in sectors.
const SNAPSHOT_CHUNK_SECTORS: u64 = 8;

type TargetLine = (u64, u64, String, String);

/// A device-mapper snapshot pairing an unmodified base image with a sparse
/// copy-on-write file. Reads fall through to the base, writes land in the COW.
pub struct DeviceMapperSnapshot {
    ctx: BuildContext,
    base: Disk,
    cow: Disk,
    name: Option<String>,
}

fn generate_mapper_name() -> String {
    let random_part: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("imgcreate-{}-{}", std::process::id(), random_part)
}

fn snapshot_table(base_sectors: u64, base_dev: &Path, cow_dev: &Path) -> TargetLine {
    (
        0,
        base_sectors,
        "snapshot".into(),
        format!(
            "{} {} p {SNAPSHOT_CHUNK_SECTORS}",
            base_dev.display(),
            cow_dev.display()
        ),
    )
}

/// Parses the status of a snapshot target, `"A B snapshot C/D ..."`, returning
/// the bytes used in the COW store (`C` sectors).
pub fn parse_cow_used(status: &str) -> Result<u64> {
    status
        .split_whitespace()
        .nth(3)
        .and_then(|field| field.split('/').next())
        .and_then(|used| used.parse::<u64>().ok())
        .map(|sectors| sectors * SECTOR_SIZE)
        .ok_or_else(|| {
            anyhow::Error::from(SnapshotError::new(format!(
                "Failed to parse dmsetup status: {status}"
            )))
        })
}

fn open_dm() -> Result<DM> {
    DM::new().context("Failed to open the device-mapper control device")
}

fn create_dm_device(name: &str, table: &[TargetLine]) -> Result<()> {
    let dm = open_dm()?;
    let dm_name =
        DmName::new(name).with_context(|| format!("{name} is not a valid device name"))?;
    dm.device_create(dm_name, None, DmOptions::default())
        .context("Failed to create device-mapper device")?;

    let dm_id = DevId::Name(dm_name);
    let loaded = dm
        .table_load(
            &dm_id,
            table,
            DmOptions::default().set_flags(DmFlags::DM_PERSISTENT_DEV),
        )
        .context("Failed to load device-mapper table")
        .and_then(|_| {
            dm.device_suspend(&dm_id, DmOptions::default())
                .context("Failed to resume device-mapper device")
        });

    if let Err(error) = loaded {
        if let Err(remove_error) = dm.device_remove(&dm_id, DmOptions::default()) {
            tracing::warn!(?remove_error, "Failed to remove half-created device {name}");
        }
        return Err(error);
    }

    Ok(())
}

fn remove_dm_device(name: &str) -> Result<()> {
    let dm = open_dm()?;
    let dm_name =
        DmName::new(name).with_context(|| format!("{name} is not a valid device name"))?;
    dm.device_remove(&DevId::Name(dm_name), DmOptions::default())
        .context("Failed to remove device-mapper device")?;
    Ok(())
}

impl DeviceMapperSnapshot {
    pub fn new(ctx: BuildContext, base: Disk, cow: Disk) -> Self {
        Self {
            ctx,
            base,
            cow,
            name: None,
        }
    }

    pub fn is_created(&self) -> bool {
        self.name.is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.name
            .as_ref()
            .map(|name| Path::new("/dev/mapper").join(name))
    }

    pub fn cow_path(&self) -> &Path {
        self.cow.path()
    }

    pub async fn create(&mut self) -> Result<()> {
        if self.name.is_some() {
            return Ok(());
        }

        kmod::load_module(&self.ctx, "dm_snapshot")
            .await
            .context(SnapshotError::new("Snapshot target is not available"))?;

        self.base
            .create()
            .await
            .context(SnapshotError::new("Failed to attach base image"))?;
        if let Err(error) = self.cow.create().await {
            self.base.cleanup();
            return Err(error.context(SnapshotError::new("Failed to attach COW file")));
        }

        let name = generate_mapper_name();
        let created = match (self.base.device(), self.cow.device()) {
            (Some(base_dev), Some(cow_dev)) => {
                let table = [snapshot_table(
                    self.base.size() / SECTOR_SIZE,
                    base_dev,
                    cow_dev,
                )];
                tracing::debug!(%name, ?table, "Creating snapshot device");
                create_dm_device(&name, &table)
            }
            _ => Err(anyhow::anyhow!("Loop devices are not attached")),
        };

        if let Err(error) = created {
            self.cow.cleanup();
            self.base.cleanup();
            return Err(error.context(SnapshotError::new(format!(
                "Could not create snapshot device {name}"
            ))));
        }

        self.name = Some(name);
        Ok(())
    }

    /// Removes the snapshot device and detaches both loop devices. Calling this
    /// on a snapshot that was never created, or twice, does nothing.
    pub async fn remove(&mut self) -> Result<()> {
        let Some(name) = self.name.clone() else {
            return Ok(());
        };

        // The device stays busy for a moment after the last writer is gone
        RetryPolicy::fixed(Duration::from_millis(500))
            .with_max_retries(10)
            .retry(|| async { remove_dm_device(&name) })
            .await
            .with_context(|| {
                SnapshotError::new(format!("Could not remove snapshot device {name}"))
            })?;

        tracing::debug!(%name, "Removed snapshot device");
        self.name = None;
        self.cow.cleanup();
        self.base.cleanup();
        Ok(())
    }

    /// Bytes currently used in the COW store.
    pub fn cow_used(&self) -> Result<u64> {
        let Some(name) = &self.name else {
            return Ok(0);
        };

        let dm = open_dm()?;
        let dm_name =
            DmName::new(name).with_context(|| format!("{name} is not a valid device name"))?;
        let (_, lines) = dm
            .table_status(&DevId::Name(dm_name), DmOptions::default())
            .with_context(|| SnapshotError::new(format!("Failed to query status of {name}")))?;

        let (start, length, target_type, params) = lines
            .first()
            .ok_or_else(|| SnapshotError::new(format!("Empty status for {name}")))?;
        parse_cow_used(&format!("{start} {length} {target_type} {params}"))
    }
}

impl Drop for DeviceMapperSnapshot {
    fn drop(&mut self) {
        if self.name.is_none() {
            return;
        }

        async_defer! {
            async {
                if let Err(error) = self.remove().await {
                    tracing::warn!("{error:#}");
                }
            }
        }
    }
}
