use anyhow::Result;
use indexmap::IndexMap;

use crate::{
    btrfs::{subvolume_name, SubvolumeSpec},
    error::CreatorError,
    types::{kb_to_sectors, FsType, PartitionType, SECTOR_SIZE},
};

/// Primary partitions available before an extended container is needed.
const MAX_PRIMARY: usize = 4;
/// Partition number of the extended container.
const EXTENDED_NUM: u32 = 4;
/// Sectors between two logical partitions holding the EBR.
const EBR_SECTORS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    /// In sectors.
    pub size: u64,
    pub disk: String,
    pub mountpoint: String,
    pub fstype: FsType,
    pub fsopts: Option<String>,
    pub label: Option<String>,
    pub boot: bool,
    pub align_kb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub disk: String,
    pub mountpoint: String,
    pub fstype: FsType,
    pub fsopts: Option<String>,
    pub label: String,
    pub boot: bool,
    pub num: u32,
    pub ptype: PartitionType,
    pub start: u64,
    /// In sectors, after alignment and reserves were taken out.
    pub size: u64,
}

impl PlannedPartition {
    /// Last sector, inclusive.
    pub fn end(&self) -> u64 {
        self.start + self.size - 1
    }

    pub fn is_swap(&self) -> bool {
        self.fstype == FsType::Swap
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPartition {
    pub num: u32,
    /// First EBR sector.
    pub start: u64,
    /// Last sector of the last logical partition.
    pub end: u64,
    /// Sum of the logical partition sizes.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub name: String,
    /// Sectors the partition table needs.
    pub min_sectors: u64,
    pub extended: Option<ExtendedPartition>,
    /// Indices into [`PartitionLayout::partitions`].
    pub partitions: Vec<usize>,
}

impl DiskLayout {
    pub fn min_size(&self) -> u64 {
        self.min_sectors * SECTOR_SIZE
    }

    /// Partitions the table tool creates on this disk, extended container included.
    pub fn table_entries(&self) -> usize {
        self.partitions.len() + usize::from(self.extended.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionLayout {
    pub disks: IndexMap<String, DiskLayout>,
    /// All partitions in submission order.
    pub partitions: Vec<PlannedPartition>,
    pub subvolumes: Vec<SubvolumeSpec>,
}

/// Default filesystem label for a mountpoint.
pub fn default_label(mountpoint: &str, fstype: FsType) -> String {
    if fstype == FsType::Swap {
        return "swap".into();
    }
    match mountpoint.trim_end_matches('/').rsplit('/').next() {
        Some("") | None => "platform".into(),
        Some(last) => last.into(),
    }
}

/// Collects partition requests per disk and computes their placement.
#[derive(Debug, Default)]
pub struct PartitionPlanner {
    disks: IndexMap<String, Vec<PartitionRequest>>,
    subvolumes: Vec<PartitionRequest>,
}

impl PartitionPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk(&mut self, name: impl Into<String>) {
        self.disks.entry(name.into()).or_default();
    }

    /// Btrfs requests with a `subvol=` option and a mountpoint other than `/`
    /// become subvolumes instead of partitions.
    pub fn add_partition(&mut self, request: PartitionRequest) -> Result<()> {
        let Some(requests) = self.disks.get_mut(&request.disk) else {
            return Err(CreatorError::MissingDisk {
                disk: request.disk,
                mountpoint: request.mountpoint,
            }
            .into());
        };

        let subvol = match (&request.fstype, &request.fsopts) {
            (FsType::Btrfs, Some(fsopts)) => subvolume_name(fsopts).is_some(),
            _ => false,
        };
        if subvol {
            self.subvolumes.push(request.clone());
            if request.mountpoint != "/" {
                return Ok(());
            }
        }

        requests.push(request);
        Ok(())
    }

    pub fn plan(&self) -> Result<PartitionLayout> {
        let mut layout = PartitionLayout::default();

        for (name, requests) in &self.disks {
            let disk = plan_disk(name, requests, &mut layout.partitions)?;
            layout.disks.insert(name.clone(), disk);
        }

        for request in &self.subvolumes {
            let root_is_btrfs = layout
                .partitions
                .iter()
                .any(|p| p.disk == request.disk && p.fstype == FsType::Btrfs);
            if !root_is_btrfs {
                return Err(CreatorError::InvalidConfig(format!(
                    "Subvolume {} needs a btrfs partition on disk {}",
                    request.mountpoint, request.disk
                ))
                .into());
            }

            let fsopts = request.fsopts.clone().unwrap_or_default();
            let name = subvolume_name(&fsopts).unwrap_or_default().to_owned();
            layout.subvolumes.push(SubvolumeSpec {
                size: request.size,
                disk: request.disk.clone(),
                mountpoint: request.mountpoint.clone(),
                fsopts,
                name,
                boot: request.boot,
                mounted: false,
                id: None,
            });
        }

        Ok(layout)
    }
}

fn plan_disk(
    name: &str,
    requests: &[PartitionRequest],
    partitions: &mut Vec<PlannedPartition>,
) -> Result<DiskLayout> {
    let use_extended = requests.len() > MAX_PRIMARY;
    let mut offset = 0u64;
    let mut numpart = 0u32;
    let mut extended = 0u64;
    let mut extended_start = None;
    let mut indices = Vec::with_capacity(requests.len());

    let too_small =
        |request: &PartitionRequest, size: u64, reserved: u64| CreatorError::PartitionTooSmall {
            mountpoint: request.mountpoint.clone(),
            size,
            reserved,
        };

    for (i, request) in requests.iter().enumerate() {
        let align = request.align_kb.map(kb_to_sectors).filter(|a| *a > 0);
        let mut size = request.size;

        let ptype = if use_extended && i >= MAX_PRIMARY - 1 {
            PartitionType::Logical
        } else {
            PartitionType::Primary
        };

        if i == 0 {
            // MBR, or the whole first alignment unit
            let reserve = align.unwrap_or(1).max(1);
            if size <= reserve {
                return Err(too_small(request, size, reserve).into());
            }
            offset = reserve;
            size -= reserve;
        }

        if ptype == PartitionType::Logical {
            if size <= EBR_SECTORS {
                return Err(too_small(request, size, EBR_SECTORS).into());
            }
            extended_start.get_or_insert(offset);
            offset += EBR_SECTORS;
            size -= EBR_SECTORS;
        }

        if let Some(align) = align.filter(|_| i > 0) {
            let shortfall = (align - offset % align) % align;
            if size <= shortfall {
                return Err(too_small(request, size, shortfall).into());
            }
            offset += shortfall;
            size -= shortfall;
        }

        // Boot ROMs want an even sector count on FAT boot partitions
        if request.mountpoint == "/boot" && request.fstype.is_fat() && size % 2 == 1 {
            size -= 1;
        }

        let num = match ptype {
            PartitionType::Logical => {
                extended += size;
                EXTENDED_NUM + 1 + (i - (MAX_PRIMARY - 1)) as u32
            }
            _ => {
                numpart += 1;
                numpart
            }
        };

        let planned = PlannedPartition {
            disk: name.to_owned(),
            mountpoint: request.mountpoint.clone(),
            fstype: request.fstype,
            fsopts: request.fsopts.clone(),
            label: request
                .label
                .clone()
                .unwrap_or_else(|| default_label(&request.mountpoint, request.fstype)),
            boot: request.boot,
            num,
            ptype,
            start: offset,
            size,
        };
        tracing::debug!(
            disk = name,
            mountpoint = %planned.mountpoint,
            num,
            %ptype,
            start = planned.start,
            size,
            "Planned partition"
        );

        offset += size;
        indices.push(partitions.len());
        partitions.push(planned);
    }

    Ok(DiskLayout {
        name: name.to_owned(),
        min_sectors: offset,
        extended: extended_start.map(|start| ExtendedPartition {
            num: EXTENDED_NUM,
            start,
            end: offset - 1,
            size: extended,
        }),
        partitions: indices,
    })
}

impl PartitionLayout {
    pub fn partitions_on<'a>(&'a self, disk: &'a str) -> impl Iterator<Item = &'a PlannedPartition> {
        self.disks
            .get(disk)
            .into_iter()
            .flat_map(|layout| layout.partitions.iter())
            .map(|index| &self.partitions[*index])
    }

    /// Indices of the mountable partitions sorted by mountpoint, so parents
    /// come before their children.
    pub fn mount_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.partitions.len())
            .filter(|index| !self.partitions[*index].is_swap())
            .collect();
        order.sort_by(|a, b| {
            self.partitions[*a]
                .mountpoint
                .cmp(&self.partitions[*b].mountpoint)
        });
        order
    }

    pub fn unmount_order(&self) -> Vec<usize> {
        let mut order = self.mount_order();
        order.reverse();
        order
    }

    pub fn mount_orders(&self) -> (Vec<usize>, Vec<usize>) {
        (self.mount_order(), self.unmount_order())
    }
}
