//! 资源作用域
//!
//! [`Scope`] 在构建期间收集终结器，关闭时按注册的逆序执行。
//! 关闭通过对关闭标志的 CAS 抢占，多个调用方同时关闭时每个终结器也只执行一次。

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{AggregatedFinalizerError, LayerError, ReleaseError};

type FinalizerFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Finalizer {
    label: String,
    action: FinalizerFn,
}

struct ScopeInner {
    id: uuid::Uuid,
    name: String,
    closed: AtomicBool,
    finalizers: Mutex<Vec<Finalizer>>,
    finalizer_timeout: Option<Duration>,
    /// 已执行的终结器数量（含失败）
    finalizers_run: AtomicUsize,
}

/// 资源生命周期边界
///
/// 克隆得到的是同一终结器列表的另一个句柄。
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, None)
    }

    /// 每个终结器受 `finalizer_timeout` 限制的作用域
    pub fn with_timeout(name: impl Into<String>, finalizer_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: uuid::Uuid::new_v4(),
                name: name.into(),
                closed: AtomicBool::new(false),
                finalizers: Mutex::new(Vec::new()),
                finalizer_timeout,
                finalizers_run: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 等待执行的终结器数量
    pub fn pending(&self) -> usize {
        self.inner.finalizers.lock().len()
    }

    /// 已执行的终结器数量（含失败）
    pub fn finalizers_run(&self) -> usize {
        self.inner.finalizers_run.load(Ordering::Acquire)
    }

    /// 注册终结器，作用域关闭时执行
    ///
    /// 作用域开始关闭后返回 `ScopeClosed`，此时资源仍归调用方，需自行释放。
    pub fn add_finalizer<F, Fut>(
        &self,
        label: impl Into<String>,
        release: F,
    ) -> Result<(), LayerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut finalizers = self.inner.finalizers.lock();
        if self.is_closed() {
            return Err(LayerError::ScopeClosed {
                scope: self.inner.name.clone(),
            });
        }
        let label = label.into();
        debug!(scope = %self.inner.name, finalizer = %label, "registered finalizer");
        finalizers.push(Finalizer {
            label,
            action: Box::new(move || release().boxed()),
        });
        Ok(())
    }

    /// 派生子作用域，其关闭作为 `self` 的一个终结器执行
    pub fn child(&self, name: impl Into<String>) -> Result<Scope, LayerError> {
        let child = Scope::with_timeout(name, self.inner.finalizer_timeout);
        let closer = child.clone();
        self.add_finalizer(format!("scope:{}", child.name()), move || async move {
            closer.close().await.map_err(anyhow::Error::new)
        })?;
        Ok(child)
    }

    /// 按注册的逆序执行全部终结器
    ///
    /// 部分失败也会继续执行其余终结器，失败一并返回。重复关闭不做任何事。
    pub async fn close(&self) -> Result<(), AggregatedFinalizerError> {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let finalizers = std::mem::take(&mut *self.inner.finalizers.lock());
        debug!(scope = %self.inner.name, count = finalizers.len(), "closing scope");

        let mut errors = Vec::new();
        for finalizer in finalizers.into_iter().rev() {
            if let Err(err) = self.run_finalizer(finalizer).await {
                warn!(scope = %self.inner.name, "{}", err);
                errors.push(err);
            }
        }

        match AggregatedFinalizerError::from_errors(errors) {
            Some(aggregated) => Err(aggregated),
            None => Ok(()),
        }
    }

    async fn run_finalizer(&self, finalizer: Finalizer) -> Result<(), ReleaseError> {
        let Finalizer { label, action } = finalizer;
        debug!(scope = %self.inner.name, finalizer = %label, "running finalizer");

        let outcome = match self.inner.finalizer_timeout {
            Some(limit) => match tokio::time::timeout(limit, action()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {:?}", limit)),
            },
            None => action().await,
        };
        self.inner.finalizers_run.fetch_add(1, Ordering::AcqRel);

        outcome.map_err(|cause| ReleaseError::new(label, cause))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let pending = self.finalizers.get_mut().len();
        if pending > 0 && !*self.closed.get_mut() {
            warn!(
                scope = %self.name,
                pending,
                "scope dropped without close; finalizers will not run"
            );
        }
    }
}

/// provide 成功后返回的句柄
///
/// 关闭时按获取的逆序释放构建期间获取的全部资源。
#[derive(Debug, Clone)]
pub struct ScopeHandle {
    scope: Scope,
}

impl ScopeHandle {
    pub(crate) fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub async fn close(&self) -> Result<(), AggregatedFinalizerError> {
        self.scope.close().await
    }

    /// 底层作用域，可用于嵌套 provide
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_closed()
    }
}
