//! 基础设施层
//!
//! 层的组合与构建：
//! - 类型键与环境
//! - 作用域与资源释放
//! - 层的组合、构建计划与规划器
//! - 按键自动装配

pub mod environment;
pub mod graph;
pub mod key;
pub mod layer;
pub mod plan;
pub mod planner;
pub mod scope;

// 重新导出API
pub use environment::{Environment, Instance};
pub use graph::LayerGraph;
pub use key::{KeySet, Tag, TypeKey};
pub use layer::{Layer, LayerBuild, MemoKey};
pub use plan::{BuildPlan, PlanNode, PlanNodeKind};
pub use planner::{provide, MemoState, Planner, PlannerStats};
pub use scope::{Scope, ScopeHandle};
