use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::errors::ConfigError;

/// 规划器配置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannerConfig {
    /// 单个叶子构建的超时；`None` 表示不限
    pub build_timeout: Option<Duration>,
    /// 单个终结器的超时
    pub finalizer_timeout: Option<Duration>,
    /// 同时运行的叶子构建数上限
    pub max_concurrency: Option<usize>,
}

/// TOML 文件中的部分规划器配置
#[derive(Deserialize, Debug, Default)]
pub struct PartialPlannerConfig {
    pub build_timeout_ms: Option<u64>,
    pub finalizer_timeout_ms: Option<u64>,
    pub max_concurrency: Option<usize>,
}

impl PlannerConfig {
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = Some(timeout);
        self
    }

    pub fn with_finalizer_timeout(mut self, timeout: Duration) -> Self {
        self.finalizer_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// 从部分配置创建 PlannerConfig，缺省项取默认值
    pub fn from_partial(partial: Option<PartialPlannerConfig>) -> Result<Self, ConfigError> {
        let partial = partial.unwrap_or_default();

        if let Some(limit) = partial.max_concurrency {
            if limit == 0 || limit > Semaphore::MAX_PERMITS {
                return Err(ConfigError::InvalidValue {
                    field: "planner.max_concurrency".to_string(),
                    value: limit.to_string(),
                    reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
                });
            }
        }

        Ok(Self {
            build_timeout: partial.build_timeout_ms.map(Duration::from_millis),
            finalizer_timeout: partial.finalizer_timeout_ms.map(Duration::from_millis),
            max_concurrency: partial.max_concurrency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unbounded() {
        let config = PlannerConfig::from_partial(None).unwrap();
        assert_eq!(config, PlannerConfig::default());
        assert!(config.build_timeout.is_none());
    }

    #[test]
    fn test_partial_values_are_converted() {
        let partial = PartialPlannerConfig {
            build_timeout_ms: Some(1500),
            finalizer_timeout_ms: None,
            max_concurrency: Some(4),
        };
        let config = PlannerConfig::from_partial(Some(partial)).unwrap();
        assert_eq!(config.build_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_concurrency, Some(4));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let partial = PartialPlannerConfig {
            max_concurrency: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            PlannerConfig::from_partial(Some(partial)),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_concurrency_above_semaphore_limit_is_rejected() {
        let partial = PartialPlannerConfig {
            max_concurrency: Some(usize::MAX),
            ..Default::default()
        };
        assert!(matches!(
            PlannerConfig::from_partial(Some(partial)),
            Err(ConfigError::InvalidValue { field, .. }) if field == "planner.max_concurrency"
        ));

        let partial = PartialPlannerConfig {
            max_concurrency: Some(Semaphore::MAX_PERMITS),
            ..Default::default()
        };
        assert!(PlannerConfig::from_partial(Some(partial)).is_ok());
    }
}
