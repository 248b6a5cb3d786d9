//! Disk tier: a relational metadata index plus an external blob store,
//! combined behind the same count/cost/age trimming contract as the memory
//! tier.

pub mod file_store;
pub mod sql_index;
pub mod tier;

pub use tier::{DiskConfig, DiskStats, DiskTier, DiskValue};
