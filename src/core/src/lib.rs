//! A3S Store Core - Foundational Types
//!
//! Error taxonomy and configuration shared by the layer store, the image
//! catalog and the command line front end.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::StoreConfig;
pub use error::{Result, StoreError};

/// A3S Store version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
