// dbbackup/src/backup/mod.rs
pub mod cleanup;
pub mod driver;
pub mod dumper;
pub mod limiter;
pub mod naming;
pub mod pipeline;
pub mod rotation;

pub use driver::{JobDriver, RunReport};
