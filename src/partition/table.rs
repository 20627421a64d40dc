use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{
    context::BuildContext,
    error::MountError,
    fs::cmd::CheckCommandOutput as _,
    types::PartitionType,
};

use super::layout::{DiskLayout, PlannedPartition};

/// A partition the table must contain after writing: `(num, start, end)`.
pub type TableEntry = (u32, u64, u64);

/// Arguments for each `parted -s <device> ...` call that writes the table of
/// one disk, in execution order.
pub fn table_commands(disk: &DiskLayout, partitions: &[&PlannedPartition]) -> Vec<Vec<String>> {
    let mut commands = vec![vec!["mklabel".to_owned(), "msdos".to_owned()]];

    let mkpart = |ptype: PartitionType, fstype: Option<&str>, start: u64, end: u64| {
        let mut args = vec!["unit".to_owned(), "s".to_owned(), "mkpart".to_owned()];
        args.push(ptype.to_string());
        args.extend(fstype.map(str::to_owned));
        args.push(start.to_string());
        args.push(end.to_string());
        args
    };

    let mut extended_written = false;
    for partition in partitions {
        if partition.ptype == PartitionType::Logical && !extended_written {
            if let Some(extended) = &disk.extended {
                commands.push(mkpart(
                    PartitionType::Extended,
                    None,
                    extended.start,
                    extended.end,
                ));
                extended_written = true;
            }
        }
        commands.push(mkpart(
            partition.ptype,
            Some(partition.fstype.parted_fs_type()),
            partition.start,
            partition.end(),
        ));
    }

    for partition in partitions.iter().filter(|partition| partition.boot) {
        commands.push(vec![
            "set".to_owned(),
            partition.num.to_string(),
            "boot".to_owned(),
            "on".to_owned(),
        ]);
    }

    commands
}

pub fn expected_entries(disk: &DiskLayout, partitions: &[&PlannedPartition]) -> Vec<TableEntry> {
    let mut entries: Vec<TableEntry> = partitions
        .iter()
        .map(|partition| (partition.num, partition.start, partition.end()))
        .collect();
    if let Some(extended) = &disk.extended {
        entries.push((extended.num, extended.start, extended.end));
    }
    entries.sort();
    entries
}

/// Parses `parted -s -m <device> unit s print`, returning the partition lines.
///
/// ```text
/// BYT;
/// /dev/loop0:307200s:loopback:512:512:msdos:Loopback device:;
/// 1:1s:204799s:204799s:ext3::;
/// ```
pub fn parse_parted_print(output: &str) -> Vec<TableEntry> {
    let sector = |field: &str| field.strip_suffix('s').and_then(|v| v.parse::<u64>().ok());

    let mut entries: Vec<TableEntry> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let num = fields.next()?.parse::<u32>().ok()?;
            let start = sector(fields.next()?)?;
            let end = sector(fields.next()?)?;
            Some((num, start, end))
        })
        .collect();
    entries.sort();
    entries
}

/// Writes the msdos partition table of one disk with parted.
pub struct PartitionTable<'a> {
    ctx: &'a BuildContext,
    device: &'a Path,
}

impl<'a> PartitionTable<'a> {
    pub fn new(ctx: &'a BuildContext, device: &'a Path) -> Self {
        Self { ctx, device }
    }

    async fn parted(&self, args: &[String]) -> Result<i32> {
        Command::new("parted")
            .arg("-s")
            .arg(self.device)
            .args(args)
            .run_for_exit_code(self.ctx)
            .await
    }

    pub async fn read(&self) -> Result<Vec<TableEntry>> {
        let stdout = Command::new("parted")
            .arg("-s")
            .arg("-m")
            .arg(self.device)
            .arg("unit")
            .arg("s")
            .arg("print")
            .run_in(self.ctx)
            .await
            .with_context(|| {
                MountError::new(format!("Failed to read partition table of {:?}", self.device))
            })?;
        Ok(parse_parted_print(&String::from_utf8_lossy(&stdout)))
    }

    /// Runs every parted call, then reads the table back. A non-zero exit
    /// from parted is accepted when the table it left matches the layout:
    /// parted often fails to make the kernel re-read loop device tables even
    /// though the write itself went through.
    pub async fn write(&self, disk: &DiskLayout, partitions: &[&PlannedPartition]) -> Result<()> {
        tracing::info!(disk = %disk.name, device = ?self.device, "Writing partition table");

        let mut failures = Vec::new();
        for args in table_commands(disk, partitions) {
            let code = self.parted(&args).await?;
            if code != 0 {
                failures.push((args.join(" "), code));
            }
        }

        let expected = expected_entries(disk, partitions);
        let actual = self.read().await?;
        if actual != expected {
            return Err(MountError::new(format!(
                "Partition table of {:?} does not match the layout, expected {expected:?} but found {actual:?} (failed parted calls: {failures:?})",
                self.device
            ))
            .into());
        }

        for (args, code) in failures {
            tracing::debug!(
                device = ?self.device,
                "Tolerating parted exit code {code} for '{args}', table verified"
            );
        }
        Ok(())
    }
}
