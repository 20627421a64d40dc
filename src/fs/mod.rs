pub mod block;
pub mod cmd;
pub mod driver;
pub mod fsmount;
pub mod kmod;
pub mod minimize;
pub mod mount;
pub mod squash;
