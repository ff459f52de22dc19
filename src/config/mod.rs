pub mod app_config;
pub mod loader;
pub mod planner_config;

// Re-export commonly used types
pub use app_config::{AppConfig, LoggingSettings};
pub use loader::ConfigLoader;
pub use planner_config::PlannerConfig;

pub use app_config::{CONFIG_FILE_NAME, USER_CONFIG_PATH};
