//! A3S Store CLI - Manage layers and images in a local store.

pub mod commands;
pub mod output;
