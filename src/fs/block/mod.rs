pub mod disk;
pub mod snapshot;
