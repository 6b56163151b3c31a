//! Crucible Core
//!
//! Core domain types, traits, and error handling for the Crucible build
//! orchestrator. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod build;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod state;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
