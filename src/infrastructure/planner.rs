//! 规划器：把层图构建成环境
//!
//! [`Planner::provide`] 校验层图，编译成 [`BuildPlan`]，执行构建，
//! 返回目标服务以及持有其资源的作用域。构建失败时，已注册的
//! 终结器会在错误返回调用方之前全部执行。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::environment::Environment;
use super::key::KeySet;
use super::layer::{Layer, LayerBuild, LayerKind, MemoKey};
use super::plan::BuildPlan;
use super::scope::{Scope, ScopeHandle};
use crate::config::PlannerConfig;
use crate::errors::{AggregatedFinalizerError, LayerError};
use crate::logging::OperationTimer;

const NOT_STARTED: u8 = 0;
const BUILDING: u8 = 1;
const BUILT: u8 = 2;
const FAILED: u8 = 3;

/// 单次 provide 中 memo 节点的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoState {
    NotStarted,
    Building,
    Built,
    Failed,
}

type MemoOutcome = Option<Result<Environment, LayerError>>;

/// memo 节点的槽位
///
/// 第一个请求方通过 CAS 抢占槽位并构建，其余请求方等待共享的完成信号。
struct MemoSlot {
    state: AtomicU8,
    outcome: watch::Sender<MemoOutcome>,
}

impl MemoSlot {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            state: AtomicU8::new(NOT_STARTED),
            outcome,
        }
    }

    fn state(&self) -> MemoState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => MemoState::NotStarted,
            BUILDING => MemoState::Building,
            BUILT => MemoState::Built,
            _ => MemoState::Failed,
        }
    }

    /// 返回构建结果，以及本次调用是否亲自执行了构建
    async fn get_or_build<F, Fut>(
        &self,
        layer: &str,
        build: F,
    ) -> (Result<Environment, LayerError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Environment, LayerError>>,
    {
        let claimed = self
            .state
            .compare_exchange(NOT_STARTED, BUILDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if claimed {
            let guard = BuildingGuard {
                slot: self,
                layer,
                finished: false,
            };
            let result = build().await;
            guard.finish(result.clone());
            return (result, true);
        }

        let mut receiver = self.outcome.subscribe();
        let result = match receiver.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(cancelled(layer))),
            Err(_) => Err(cancelled(layer)),
        };
        (result, false)
    }
}

/// 发布构建结果；构建 future 被丢弃时发布 `Cancelled`
struct BuildingGuard<'a> {
    slot: &'a MemoSlot,
    layer: &'a str,
    finished: bool,
}

impl BuildingGuard<'_> {
    fn finish(mut self, result: Result<Environment, LayerError>) {
        self.publish(result);
    }

    fn publish(&mut self, result: Result<Environment, LayerError>) {
        let state = if result.is_ok() { BUILT } else { FAILED };
        self.slot.outcome.send_replace(Some(result));
        self.slot.state.store(state, Ordering::Release);
        self.finished = true;
    }
}

impl Drop for BuildingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(layer = %self.layer, "memoized build cancelled");
            let layer = self.layer;
            self.publish(Err(cancelled(layer)));
        }
    }
}

fn cancelled(layer: &str) -> LayerError {
    LayerError::Cancelled {
        layer: layer.to_string(),
    }
}

/// 内部统计（原子计数器）
#[derive(Default)]
struct InnerStats {
    provides: AtomicU64,
    provides_failed: AtomicU64,
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    memo_builds: AtomicU64,
    memo_hits: AtomicU64,
    release_failures: AtomicU64,
}

/// 规划器统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannerStats {
    pub provides: u64,
    pub provides_failed: u64,
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub memo_builds: u64,
    pub memo_hits: u64,
    pub release_failures: u64,
}

impl PlannerStats {
    /// memo 命中率：未经构建直接拿到结果的请求占比
    pub fn memo_hit_rate(&self) -> f64 {
        let total = self.memo_builds + self.memo_hits;
        if total == 0 {
            0.0
        } else {
            self.memo_hits as f64 / total as f64
        }
    }
}

/// 单次 provide 的执行上下文
struct RunContext<'a> {
    planner: &'a Planner,
    scope: Scope,
    memo: HashMap<MemoKey, Arc<MemoSlot>>,
}

/// 规划器 - 把层构建成环境
#[derive(Clone)]
pub struct Planner {
    config: PlannerConfig,
    limiter: Option<Arc<Semaphore>>,
    stats: Arc<InnerStats>,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        let limiter = config
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS))));
        Self {
            config,
            limiter,
            stats: Arc::new(InnerStats::default()),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// 构建 `layer` 并返回 `targets` 中的服务
    ///
    /// 返回的句柄持有构建期间获取的全部资源，关闭时按获取的逆序释放。
    pub async fn provide(
        &self,
        targets: &KeySet,
        layer: &Layer,
    ) -> Result<(Environment, ScopeHandle), LayerError> {
        self.provide_with(Environment::empty(), targets, layer).await
    }

    /// 同 [`provide`](Self::provide)，外部输入由 `base` 提供
    pub async fn provide_with(
        &self,
        base: Environment,
        targets: &KeySet,
        layer: &Layer,
    ) -> Result<(Environment, ScopeHandle), LayerError> {
        let plan = self.prepare(&base, targets, layer)?;
        let scope = Scope::with_timeout(
            format!("provide:{}", layer.name()),
            self.config.finalizer_timeout,
        );
        let env = self.run(&plan, scope.clone(), base, targets, layer).await?;
        Ok((env, ScopeHandle::new(scope)))
    }

    /// 嵌套构建，资源随 `parent` 关闭而释放
    pub async fn provide_in(
        &self,
        parent: &Scope,
        base: Environment,
        targets: &KeySet,
        layer: &Layer,
    ) -> Result<Environment, LayerError> {
        let plan = self.prepare(&base, targets, layer)?;
        let scope = parent.child(format!("provide:{}", layer.name()))?;
        self.run(&plan, scope, base, targets, layer).await
    }

    /// 构建、交给 `consumer` 使用，然后释放全部资源
    ///
    /// consumer 成功而释放失败时报告释放错误；consumer 失败时两者一并报告。
    pub async fn run_with<F, Fut, R>(
        &self,
        targets: &KeySet,
        layer: &Layer,
        consumer: F,
    ) -> Result<R, LayerError>
    where
        F: FnOnce(Environment) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let (env, handle) = self.provide(targets, layer).await?;
        let outcome = consumer(env).await;
        let releases = self.close_counted(handle.scope()).await;

        match (outcome, releases) {
            (Ok(value), None) => Ok(value),
            (Ok(_), Some(releases)) => Err(LayerError::ResourceRelease(releases)),
            (Err(cause), releases) => {
                Err(LayerError::build("consumer", cause).with_releases(releases))
            }
        }
    }

    pub fn stats(&self) -> PlannerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PlannerStats {
            provides: load(&self.stats.provides),
            provides_failed: load(&self.stats.provides_failed),
            builds_started: load(&self.stats.builds_started),
            builds_succeeded: load(&self.stats.builds_succeeded),
            builds_failed: load(&self.stats.builds_failed),
            memo_builds: load(&self.stats.memo_builds),
            memo_hits: load(&self.stats.memo_hits),
            release_failures: load(&self.stats.release_failures),
        }
    }

    /// 所有副作用之前的校验
    fn prepare(
        &self,
        base: &Environment,
        targets: &KeySet,
        layer: &Layer,
    ) -> Result<BuildPlan, LayerError> {
        if let Some(key) = targets.difference(layer.outputs()).next() {
            return Err(LayerError::MissingService(*key));
        }
        // 环先于缺失输入报告：环上的键必然也表现为未满足的输入
        let plan = BuildPlan::compile(layer)?;
        let missing = base.missing(layer.inputs());
        if !missing.is_empty() {
            return Err(LayerError::UnsatisfiedInput {
                layer: layer.name().to_string(),
                missing,
            });
        }
        debug!(layer = %layer.name(), order = ?plan.order(), "compiled build plan");
        Ok(plan)
    }

    async fn run(
        &self,
        plan: &BuildPlan,
        scope: Scope,
        base: Environment,
        targets: &KeySet,
        layer: &Layer,
    ) -> Result<Environment, LayerError> {
        self.stats.provides.fetch_add(1, Ordering::Relaxed);
        let timer = OperationTimer::new(&format!("provide {}", layer.name()));

        let ctx = RunContext {
            planner: self,
            scope: scope.clone(),
            memo: plan
                .memo_keys()
                .map(|key| (key.clone(), Arc::new(MemoSlot::new())))
                .collect(),
        };

        match ctx.execute(layer, base).await {
            Ok(env) => {
                info!(
                    layer = %layer.name(),
                    nodes = plan.len(),
                    elapsed_ms = timer.elapsed().as_millis() as u64,
                    "environment built"
                );
                timer.finish(true);
                Ok(env.restrict(targets))
            }
            Err(err) => {
                warn!(
                    layer = %layer.name(),
                    error = %err,
                    "build failed, releasing acquired resources"
                );
                self.stats.provides_failed.fetch_add(1, Ordering::Relaxed);
                let releases = self.close_counted(&scope).await;
                timer.finish(false);
                Err(err.with_releases(releases))
            }
        }
    }

    async fn close_counted(&self, scope: &Scope) -> Option<AggregatedFinalizerError> {
        let releases = scope.close().await.err();
        if let Some(releases) = &releases {
            self.stats
                .release_failures
                .fetch_add(releases.len() as u64, Ordering::Relaxed);
        }
        releases
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

impl RunContext<'_> {
    fn execute<'a>(
        &'a self,
        layer: &'a Layer,
        input: Environment,
    ) -> BoxFuture<'a, Result<Environment, LayerError>> {
        async move {
            match layer.kind() {
                LayerKind::Leaf(build) => self.build_leaf(layer, build.as_ref(), input).await,
                LayerKind::Zip(left, right) => {
                    // 任一分支失败时另一分支的 future 被丢弃，即取消
                    let (left_out, right_out) = future::try_join(
                        self.execute(left, input.clone()),
                        self.execute(right, input),
                    )
                    .await?;
                    Ok(left_out.union(&right_out))
                }
                LayerKind::AndThen(first, next) => {
                    let first_out = self.execute(first, input.clone()).await?;
                    self.execute(next, input.union(&first_out)).await
                }
                LayerKind::AndThenKeep(first, next) => {
                    let first_out = self.execute(first, input.clone()).await?;
                    let next_out = self.execute(next, input.union(&first_out)).await?;
                    Ok(first_out.union(&next_out))
                }
                LayerKind::Memo(key, inner) => self.build_memo(layer, key, inner, input).await,
            }
        }
        .boxed()
    }

    async fn build_memo(
        &self,
        layer: &Layer,
        key: &MemoKey,
        inner: &Layer,
        input: Environment,
    ) -> Result<Environment, LayerError> {
        let slot = self
            .memo
            .get(key)
            .cloned()
            .ok_or_else(|| cancelled(layer.name()))?;

        if slot.state() != MemoState::NotStarted {
            debug!(layer = %layer.name(), state = ?slot.state(), "awaiting memoized layer");
        }
        let (result, built_here) = slot
            .get_or_build(layer.name(), || self.execute(inner, input))
            .await;

        let stats = &self.planner.stats;
        if built_here {
            stats.memo_builds.fetch_add(1, Ordering::Relaxed);
        } else if result.is_ok() {
            // 等到失败或取消结果的请求不算命中
            stats.memo_hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn build_leaf(
        &self,
        layer: &Layer,
        build: &dyn LayerBuild,
        input: Environment,
    ) -> Result<Environment, LayerError> {
        let missing = input.missing(layer.inputs());
        if !missing.is_empty() {
            return Err(LayerError::UnsatisfiedInput {
                layer: layer.name().to_string(),
                missing,
            });
        }
        let input = input.restrict(layer.inputs());

        let _permit = match &self.planner.limiter {
            Some(limiter) => Some(limiter.acquire().await.map_err(|_| cancelled(layer.name()))?),
            None => None,
        };

        let stats = &self.planner.stats;
        stats.builds_started.fetch_add(1, Ordering::Relaxed);
        debug!(layer = %layer.name(), "building layer");

        let result = match self.planner.config.build_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, build.build(input, &self.scope)).await {
                    Ok(result) => result.map_err(|cause| LayerError::build(layer.name(), cause)),
                    Err(_) => Err(LayerError::BuildTimeout {
                        layer: layer.name().to_string(),
                        timeout: limit,
                    }),
                }
            }
            None => build
                .build(input, &self.scope)
                .await
                .map_err(|cause| LayerError::build(layer.name(), cause)),
        };

        let output = result.and_then(|output| {
            let missing = output.missing(layer.outputs());
            if missing.is_empty() {
                Ok(output.restrict(layer.outputs()))
            } else {
                Err(LayerError::IncompleteOutput {
                    layer: layer.name().to_string(),
                    missing,
                })
            }
        });

        match &output {
            Ok(_) => {
                stats.builds_succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(layer = %layer.name(), "layer built");
            }
            Err(err) => {
                stats.builds_failed.fetch_add(1, Ordering::Relaxed);
                debug!(layer = %layer.name(), error = %err, "layer failed");
            }
        }
        output
    }
}

/// 使用默认规划器构建 `layer`
pub async fn provide(
    targets: &KeySet,
    layer: &Layer,
) -> Result<(Environment, ScopeHandle), LayerError> {
    Planner::default().provide(targets, layer).await
}
