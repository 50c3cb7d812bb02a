#[macro_use]
mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
