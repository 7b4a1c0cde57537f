//! Host-side glue for tickbot.
//!
//! [`HostDriver`] owns the per-frame ordering: refresh the entity cache, tick
//! every bot, then report worker trouble. Configuration and logging live here
//! too so binaries only have to wire things together.

pub mod config;
pub mod driver;
pub mod logging;
pub mod sim;

pub use config::{ConfigLoadError, TickbotConfig};
pub use driver::{DriverError, FrameReport, HostDriver, HostDriverBuilder};
pub use logging::{init_logging, init_logging_with_level};
