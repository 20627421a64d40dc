use anyhow::Result;
use async_trait::async_trait;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, ContentArrangement, Table,
};

use crate::{config::ImageConfig, partition::PartitionLayout, types::SECTOR_SIZE};

pub struct PlanCommand {
    pub plan_options: crate::cli::PlanOptions,
}

#[async_trait]
impl super::Command for PlanCommand {
    async fn run(&self) -> Result<()> {
        let config = ImageConfig::load(&self.plan_options.config).await?;
        let layout = config.layout()?;
        println!("{}", layout_table(&layout));
        for (name, disk) in &layout.disks {
            println!("{name}: at least {} bytes", disk.min_sectors * SECTOR_SIZE);
        }
        Ok(())
    }
}

pub fn layout_table(layout: &PartitionLayout) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Disk",
            "Number",
            "Type",
            "Start",
            "End",
            "Size (sectors)",
            "Mountpoint",
            "Filesystem",
            "Label",
            "Boot",
        ]);

    for (name, disk) in &layout.disks {
        let mut rows: Vec<(u32, Vec<Cell>)> = layout
            .partitions_on(name)
            .map(|partition| {
                (
                    partition.num,
                    vec![
                        Cell::new(name),
                        Cell::new(partition.num),
                        Cell::new(partition.ptype),
                        Cell::new(partition.start),
                        Cell::new(partition.end()),
                        Cell::new(partition.size),
                        Cell::new(&partition.mountpoint),
                        Cell::new(partition.fstype),
                        Cell::new(&partition.label),
                        if partition.boot {
                            Cell::new("True").fg(Color::Green)
                        } else {
                            Cell::new("False").fg(Color::DarkGrey)
                        },
                    ],
                )
            })
            .collect();

        if let Some(extended) = &disk.extended {
            rows.push((
                extended.num,
                vec![
                    Cell::new(name),
                    Cell::new(extended.num),
                    Cell::new("extended"),
                    Cell::new(extended.start),
                    Cell::new(extended.end),
                    Cell::new(extended.size),
                    Cell::new("<none>").fg(Color::DarkGrey),
                    Cell::new("<none>").fg(Color::DarkGrey),
                    Cell::new("<none>").fg(Color::DarkGrey),
                    Cell::new("False").fg(Color::DarkGrey),
                ],
            ));
        }
        rows.sort_by_key(|(num, _)| *num);
        for (_, row) in rows {
            table.add_row(row);
        }
    }

    for subvolume in &layout.subvolumes {
        table.add_row(vec![
            Cell::new(&subvolume.disk),
            Cell::new("-"),
            Cell::new("subvolume"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new(&subvolume.mountpoint),
            Cell::new(format!("btrfs ({})", subvolume.name)),
            Cell::new("-"),
            Cell::new(if subvolume.boot { "True" } else { "False" }),
        ]);
    }

    table
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_layout_table() -> Result<()> {
        let config = ImageConfig::from_toml(
            r#"
[[disk]]
name = "sda"

[[partition]]
disk = "sda"
mountpoint = "/"
size_mb = 100
fstype = "ext4"

[[partition]]
disk = "sda"
mountpoint = "/boot"
size_mb = 50
fstype = "vfat"
boot = true
"#,
        )?;
        let table = layout_table(&config.layout()?).to_string();
        assert!(table.contains("/boot"));
        assert!(table.contains("platform"));
        assert!(table.contains("204800"));
        Ok(())
    }
}
