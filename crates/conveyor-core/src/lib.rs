//! Conveyor Core
//!
//! Core domain types, traits, and error handling for Conveyor.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the step runners, and the CLI.

pub mod error;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
