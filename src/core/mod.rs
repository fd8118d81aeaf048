pub mod bootstrap;
pub mod platform;
pub mod probe;
pub mod process;
pub mod steps;

pub use bootstrap::{BootstrapSequence, BootstrapState, StepContext, StepResult};
pub use platform::Platform;
