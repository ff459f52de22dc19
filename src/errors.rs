use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::infrastructure::key::TypeKey;

/// 装配、构建与读取环境时的错误
///
/// 失败的 memo 构建会被每个请求方看到，因此需要 Clone。
#[derive(Debug, Clone, Error)]
pub enum LayerError {
    #[error("Service '{0}' is not present in the environment")]
    MissingService(TypeKey),
    #[error("Binding for '{key}' does not hold a value of type '{expected}'")]
    TypeMismatch { key: TypeKey, expected: &'static str },
    #[error("Ambiguous binding: '{0}' is produced by more than one layer")]
    AmbiguousBinding(TypeKey),
    #[error("Cyclic dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
    #[error("Layer '{layer}' requires inputs nobody provides: {}", join_keys(.missing))]
    UnsatisfiedInput { layer: String, missing: Vec<TypeKey> },
    #[error("Layer '{layer}' did not produce its declared outputs: {}", join_keys(.missing))]
    IncompleteOutput { layer: String, missing: Vec<TypeKey> },
    #[error("Layer '{layer}' failed to build: {cause}")]
    LayerBuild { layer: String, cause: Arc<anyhow::Error> },
    #[error("Layer '{layer}' did not finish building within {timeout:?}")]
    BuildTimeout { layer: String, timeout: Duration },
    #[error("Build of layer '{layer}' was cancelled")]
    Cancelled { layer: String },
    #[error("Scope '{scope}' is already closed")]
    ScopeClosed { scope: String },
    #[error("Resources were acquired but could not be released: {0}")]
    ResourceRelease(AggregatedFinalizerError),
    #[error("{primary}; additionally {releases}")]
    Aggregated {
        primary: Box<LayerError>,
        releases: AggregatedFinalizerError,
    },
}

impl LayerError {
    /// 包装层构建函数返回的应用错误
    pub fn build(layer: impl Into<String>, cause: anyhow::Error) -> Self {
        LayerError::LayerBuild {
            layer: layer.into(),
            cause: Arc::new(cause),
        }
    }

    /// 是否为构建开始前在装配阶段发现的错误
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            LayerError::AmbiguousBinding(_)
                | LayerError::CyclicDependency(_)
                | LayerError::UnsatisfiedInput { .. }
        )
    }

    /// 取出背后的构建错误（穿透聚合）
    pub fn primary(&self) -> &LayerError {
        match self {
            LayerError::Aggregated { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// 与该错误一并报告的释放失败
    pub fn release_errors(&self) -> &[ReleaseError] {
        match self {
            LayerError::ResourceRelease(releases) => releases.errors(),
            LayerError::Aggregated { releases, .. } => releases.errors(),
            _ => &[],
        }
    }

    /// 附加回滚时收集到的释放失败，两者都保留
    pub(crate) fn with_releases(self, releases: Option<AggregatedFinalizerError>) -> Self {
        match releases {
            None => self,
            Some(releases) => LayerError::Aggregated {
                primary: Box::new(self),
                releases,
            },
        }
    }
}

/// 单个终结器失败
#[derive(Debug, Clone, Error)]
#[error("finalizer '{finalizer}' failed: {cause}")]
pub struct ReleaseError {
    pub finalizer: String,
    pub cause: Arc<anyhow::Error>,
}

impl ReleaseError {
    pub fn new(finalizer: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            finalizer: finalizer.into(),
            cause: Arc::new(cause),
        }
    }
}

/// 一次作用域关闭中的全部终结器失败，按执行顺序
#[derive(Debug, Clone)]
pub struct AggregatedFinalizerError(Vec<ReleaseError>);

impl AggregatedFinalizerError {
    pub(crate) fn from_errors(errors: Vec<ReleaseError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    pub fn errors(&self) -> &[ReleaseError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregatedFinalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} finalizer(s) failed", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            let sep = if idx == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedFinalizerError {}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("Failed to parse TOML from file '{0}': {1}")]
    TomlParse(String, #[source] toml::de::Error),
    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

fn join_keys(keys: &[TypeKey]) -> String {
    keys.iter()
        .map(|key| key.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
