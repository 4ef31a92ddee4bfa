//! Controller manager of the ironcore-metal provider extension
//!
//! # Modules
//!
//! - [`options`] - Command line option groups and their aggregation
//! - [`app`] - Lifecycle runner taking the process from options to shutdown

#![deny(missing_docs)]

pub mod app;
pub mod options;

pub use app::{LifecycleRunner, LifecycleState, StartupError};
pub use options::{ExtensionOptions, OptionAggregator, OptionGroup, OptionsError};
