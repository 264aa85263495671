//! Library crate for netcrawl-rs: the task orchestration and distribution core.
pub mod address;
pub mod blacklist;
pub mod error;
pub mod master;
pub mod orchestration;
pub mod persistence;
pub mod result;
pub mod router;
pub mod scans;
pub mod server;
pub mod slave;
pub mod types;
