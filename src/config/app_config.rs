use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};
use tracing::Level;

use super::loader::ConfigLoader;
use super::planner_config::{PartialPlannerConfig, PlannerConfig};
use crate::errors::ConfigError;
use crate::logging::LogFormat;

// Configuration location constants
pub const USER_CONFIG_PATH: &str = "~/.config/layercake";
pub const CONFIG_FILE_NAME: &str = "config.toml";

// Environment overrides
pub const ENV_BUILD_TIMEOUT_MS: &str = "LAYERCAKE_BUILD_TIMEOUT_MS";
pub const ENV_FINALIZER_TIMEOUT_MS: &str = "LAYERCAKE_FINALIZER_TIMEOUT_MS";
pub const ENV_MAX_CONCURRENCY: &str = "LAYERCAKE_MAX_CONCURRENCY";
pub const ENV_LOG_LEVEL: &str = "LAYERCAKE_LOG_LEVEL";

/// 主应用配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub planner: PlannerConfig,
    pub logging: LoggingSettings,
}

/// 配置文件中的日志部分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// 用于从文件加载的部分配置
#[derive(Deserialize, Debug, Default)]
pub struct PartialAppConfig {
    pub planner: Option<PartialPlannerConfig>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl AppConfig {
    /// 从文件和环境变量加载配置
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load_config()
    }

    /// 使用自定义基础路径加载配置（用于测试）
    pub fn load_with_base_path(base_path: PathBuf) -> Result<Self, ConfigError> {
        ConfigLoader::with_base_path(base_path).load_config()
    }

    /// 从部分配置和环境变量创建 AppConfig
    ///
    /// 环境变量优先于文件中的值。
    pub fn from_partial_and_env(
        partial: Option<PartialAppConfig>,
        env_map: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut partial = partial.unwrap_or_default();

        let planner_partial = partial.planner.get_or_insert_with(PartialPlannerConfig::default);
        if let Some(value) = env_map.get(ENV_BUILD_TIMEOUT_MS) {
            planner_partial.build_timeout_ms = Some(parse_env(ENV_BUILD_TIMEOUT_MS, value)?);
        }
        if let Some(value) = env_map.get(ENV_FINALIZER_TIMEOUT_MS) {
            planner_partial.finalizer_timeout_ms =
                Some(parse_env(ENV_FINALIZER_TIMEOUT_MS, value)?);
        }
        if let Some(value) = env_map.get(ENV_MAX_CONCURRENCY) {
            planner_partial.max_concurrency = Some(parse_env(ENV_MAX_CONCURRENCY, value)?);
        }
        let planner = PlannerConfig::from_partial(partial.planner)?;

        let logging_partial = partial.logging.unwrap_or_default();
        let format = match logging_partial.format {
            Some(raw) => raw.parse::<LogFormat>().map_err(|reason| ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                value: raw.clone(),
                reason,
            })?,
            None => LogFormat::Pretty,
        };
        let level = match env_map.get(ENV_LOG_LEVEL).cloned().or(logging_partial.level) {
            Some(raw) => {
                let field = if env_map.contains_key(ENV_LOG_LEVEL) {
                    ENV_LOG_LEVEL
                } else {
                    "logging.level"
                };
                raw.trim()
                    .parse::<Level>()
                    .map_err(|e| ConfigError::InvalidValue {
                        field: field.to_string(),
                        value: raw.clone(),
                        reason: e.to_string(),
                    })?;
                raw.trim().to_ascii_lowercase()
            }
            None => LoggingSettings::default().level,
        };

        Ok(Self {
            planner,
            logging: LoggingSettings { level, format },
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        field: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
