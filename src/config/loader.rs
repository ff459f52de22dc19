use std::{collections::HashMap, env, fs, path::Path, path::PathBuf};

use super::app_config::{AppConfig, PartialAppConfig, CONFIG_FILE_NAME, USER_CONFIG_PATH};
use crate::errors::ConfigError;

/// 覆盖文件配置的环境变量前缀
const ENV_PREFIX: &str = "LAYERCAKE_";

/// 配置加载器，负责从文件和环境变量加载配置
pub struct ConfigLoader {
    base_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// 使用默认路径创建配置加载器
    pub fn new() -> Self {
        Self { base_path: None }
    }

    /// 使用自定义基础路径创建配置加载器（用于测试）
    pub fn with_base_path(base_path: PathBuf) -> Self {
        Self {
            base_path: Some(base_path),
        }
    }

    /// 加载完整的应用配置
    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let config_path = self.config_path();
        let partial_config = self.load_partial_config(&config_path)?;
        let env_map = self.collect_env_vars();
        AppConfig::from_partial_and_env(partial_config, env_map)
    }

    /// 配置文件位置
    pub fn config_path(&self) -> PathBuf {
        let base = if let Some(base_path) = &self.base_path {
            // For testing: use custom base path
            base_path.join(USER_CONFIG_PATH.trim_start_matches("~/"))
        } else {
            // Normal operation: expand tilde
            let expanded = shellexpand::tilde(USER_CONFIG_PATH);
            PathBuf::from(expanded.as_ref())
        };
        base.join(CONFIG_FILE_NAME)
    }

    /// 从文件加载部分配置；文件不存在时使用默认值
    fn load_partial_config(
        &self,
        config_path: &Path,
    ) -> Result<Option<PartialAppConfig>, ConfigError> {
        if !config_path.exists() {
            tracing::debug!("配置文件 {:?} 不存在，使用默认配置", config_path);
            return Ok(None);
        }

        let content = fs::read_to_string(config_path)
            .map_err(|e| ConfigError::FileRead(config_path.to_string_lossy().to_string(), e))?;

        let partial = toml::from_str::<PartialAppConfig>(&content)
            .map_err(|e| ConfigError::TomlParse(config_path.to_string_lossy().to_string(), e))?;

        tracing::debug!("已加载配置文件: {:?}", config_path);
        Ok(Some(partial))
    }

    /// 收集相关环境变量
    fn collect_env_vars(&self) -> HashMap<String, String> {
        env::vars().filter(|(key, _)| key.starts_with(ENV_PREFIX)).collect()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
