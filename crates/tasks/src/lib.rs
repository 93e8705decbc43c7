//! Recurring background jobs for the Mezzo media server.
//!
//! Library scans, metadata refreshes, and image extraction passes run on
//! operator-configured triggers (daily, weekly, interval, startup). Trigger
//! configuration and the most recent execution record persist as flat JSON
//! files under the scheduler root.

pub mod error;
pub mod job;
pub mod manager;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod trigger;
pub mod types;
pub mod worker;

pub use error::{Error, Result};
