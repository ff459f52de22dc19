//! 可组合的依赖注入引擎
//!
//! 服务由 [`Layer`] 产出。层可以用 [`Layer::zip`] 并列组合，用
//! [`Layer::and_then`] 串联，用 [`Layer::memo`] 共享。[`Planner`] 把层构建成
//! [`Environment`]，并返回释放全部资源的 [`ScopeHandle`]。

pub mod config;
pub mod errors;
pub mod infrastructure;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{AppConfig, PlannerConfig};
pub use errors::{AggregatedFinalizerError, ConfigError, LayerError, ReleaseError};
pub use infrastructure::{
    provide, BuildPlan, Environment, KeySet, Layer, LayerBuild, LayerGraph, MemoKey, Planner,
    PlannerStats, Scope, ScopeHandle, Tag, TypeKey,
};
