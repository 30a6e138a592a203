//! Data models shared across Mydia crates.

pub mod claim;
pub mod device;
pub mod user;
