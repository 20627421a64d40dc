//! Partition planning: sector layout, msdos tables written with parted and
//! per-partition device nodes from kpartx.

pub mod layout;
pub mod mapper;
pub mod table;

pub use layout::{
    default_label, DiskLayout, ExtendedPartition, PartitionLayout, PartitionPlanner,
    PartitionRequest, PlannedPartition,
};
pub use mapper::{MappedPartition, PartitionMapping};
pub use table::PartitionTable;
