pub mod paths;
pub mod tickbot_config;

pub use tickbot_config::{
    CacheConfig, ConfigLoadError, LoggingConfig, SchedulerConfig, StepFailureMode, ThreadsConfig,
    TickbotConfig,
};
