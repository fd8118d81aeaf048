pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::{Cli, Commands};

pub use config::{bootstrap_plan::BootstrapPlan, AppConfig, DatabaseConfig, DatabaseEngine};
pub use core::{steps::sequence_from_plan, BootstrapSequence, BootstrapState, StepContext};
pub use store::Store;
pub use utils::error::{Result, StallbookError};
