//! Shared plumbing for atomkit: error taxonomy, configuration, logging
//! bootstrap, the value-sharing hook and the pool error-sink contract.

pub mod config;
pub mod error;
pub mod logging;
pub mod share;
pub mod sink;

pub use config::{ConfigManager, LoggingConfig, PoolSettings, Settings};
pub use error::*;
pub use logging::init_logging;
pub use share::{check_shareable, install_share_hook, ShareHook, ValueInfo};
pub use sink::{ErrorSink, TracingErrorSink, WorkFailure};
