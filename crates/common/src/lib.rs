//! Common utilities and types shared across the L3 agent components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
