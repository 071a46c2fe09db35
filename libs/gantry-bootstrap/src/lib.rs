//! Process bootstrap for gantry applications.
//!
//! Everything a host binary needs before the kernel takes over: layered
//! application configuration (defaults → YAML → environment overlay →
//! `APP__*` environment variables → CLI overrides), logging initialization
//! and shutdown signal handling.

pub mod config;
pub mod logging;
pub mod signals;

pub use config::{current_env, AppConfig, CliArgs, LoggingConfig, ServerConfig};
pub use logging::init_logging;
pub use signals::wait_for_shutdown;
