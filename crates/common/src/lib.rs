//! Shared error scaffolding used across mezzo crates.

pub mod error;

pub use error::{Error, FromMessage, Result};
