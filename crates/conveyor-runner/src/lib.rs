//! Step execution engine for Conveyor.

pub mod interpolation;
pub mod runner;
pub mod shell;

pub use interpolation::InterpolationContext;
pub use runner::{OutputLine, OutputStream, RunnerConfig};
pub use shell::ShellRunner;
