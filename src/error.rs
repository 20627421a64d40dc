//! Error kinds raised by the image assembly core.
//!
//! Everything is propagated as [`anyhow::Error`]; these types are attached as
//! context (or raised directly) so callers can classify a failure with
//! `error.downcast_ref::<MountError>()`.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a block-device level operation: loop attach, partition table,
/// kpartx mapping, format, fsck, mount or resize.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct MountError(pub String);

/// Failure while creating, querying or removing a device-mapper snapshot.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SnapshotError(pub String);

/// Orchestration failure that is not caused by a single external tool.
#[derive(Error, Debug)]
pub enum CreatorError {
    #[error("Unsupported filesystem type: {0}")]
    UnsupportedFsType(String),

    #[error("No disk {disk} for partition {mountpoint}")]
    MissingDisk { disk: String, mountpoint: String },

    #[error(
        "Partition {mountpoint} has {size} sectors, which does not cover the {reserved} sectors needed for alignment"
    )]
    PartitionTooSmall {
        mountpoint: String,
        size: u64,
        reserved: u64,
    },

    #[error("Failed to get architecture from any of {probes:?} in chroot {root:?}")]
    UnknownArchitecture { root: PathBuf, probes: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MountError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl SnapshotError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
