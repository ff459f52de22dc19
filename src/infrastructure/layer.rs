//! 层：可组合的构建配方
//!
//! [`Layer`] 声明所需的键、产出的键以及构建方式。层是不可变的值，
//! 组合两个层得到新层，原来的层不变。
//!
//! - [`Layer::zip`]：并行构建，合并输出
//! - [`Layer::and_then`]：前一层的输出作为后一层的输入
//! - [`Layer::memo`]：每次 provide 至多构建一次

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::environment::Environment;
use super::key::{KeySet, TypeKey};
use super::scope::Scope;
use crate::errors::LayerError;

/// 叶子层的构建步骤
///
/// `input` 只包含声明过的输入。需要清理的资源必须在返回前注册到 `scope`。
#[async_trait]
pub trait LayerBuild: Send + Sync {
    async fn build(&self, input: Environment, scope: &Scope) -> anyhow::Result<Environment>;
}

/// 基于闭包的构建步骤
struct FnBuild<F> {
    build_fn: F,
}

#[async_trait]
impl<F, Fut> LayerBuild for FnBuild<F>
where
    F: Fn(Environment, Scope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Environment>> + Send + 'static,
{
    async fn build(&self, input: Environment, scope: &Scope) -> anyhow::Result<Environment> {
        (self.build_fn)(input, scope.clone()).await
    }
}

/// 构建单个 `T` 服务的步骤
struct ServiceBuild<T, F> {
    factory: F,
    _phantom: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> LayerBuild for ServiceBuild<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(Environment) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn build(&self, input: Environment, _scope: &Scope) -> anyhow::Result<Environment> {
        let service = (self.factory)(input).await?;
        Ok(Environment::single(service))
    }
}

/// 获取/释放对；值对外可见之前先注册释放
struct ScopedBuild<T, A, R> {
    label: String,
    acquire: A,
    release: Arc<R>,
    _phantom: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, A, AFut, R, RFut> LayerBuild for ScopedBuild<T, A, R>
where
    T: Send + Sync + 'static,
    A: Fn(Environment) -> AFut + Send + Sync,
    AFut: Future<Output = anyhow::Result<T>> + Send + 'static,
    R: Fn(Arc<T>) -> RFut + Send + Sync + 'static,
    RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn build(&self, input: Environment, scope: &Scope) -> anyhow::Result<Environment> {
        let service = Arc::new((self.acquire)(input).await?);

        let release = self.release.clone();
        let resource = service.clone();
        if let Err(err) = scope.add_finalizer(self.label.clone(), move || (*release)(resource)) {
            // 作用域已关闭，资源无人接管，立即释放
            (*self.release)(service).await?;
            return Err(err.into());
        }

        let mut output = Environment::empty();
        output.insert(TypeKey::of::<T>(), service);
        Ok(output)
    }
}

/// memo 层的标识，所有使用处共享
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoKey(Arc<str>);

impl MemoKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemoKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for MemoKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoKey({})", self.0)
    }
}

pub(crate) enum LayerKind {
    Leaf(Arc<dyn LayerBuild>),
    Zip(Layer, Layer),
    AndThen(Layer, Layer),
    AndThenKeep(Layer, Layer),
    Memo(MemoKey, Layer),
}

pub(crate) struct LayerNode {
    name: String,
    inputs: KeySet,
    outputs: KeySet,
    kind: LayerKind,
}

/// 可组合的构建配方
#[derive(Clone)]
pub struct Layer {
    node: Arc<LayerNode>,
}

impl Layer {
    fn from_node(name: String, inputs: KeySet, outputs: KeySet, kind: LayerKind) -> Self {
        Self {
            node: Arc::new(LayerNode {
                name,
                inputs,
                outputs,
                kind,
            }),
        }
    }

    /// 由 [`LayerBuild`] 实现支撑的叶子层
    pub fn from_build<B>(name: impl Into<String>, inputs: KeySet, outputs: KeySet, build: B) -> Self
    where
        B: LayerBuild + 'static,
    {
        Self::from_node(name.into(), inputs, outputs, LayerKind::Leaf(Arc::new(build)))
    }

    /// 由异步闭包支撑的叶子层
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        inputs: KeySet,
        outputs: KeySet,
        build_fn: F,
    ) -> Self
    where
        F: Fn(Environment, Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Environment>> + Send + 'static,
    {
        Self::from_build(name, inputs, outputs, FnBuild { build_fn })
    }

    /// 无输入、始终提供 `value` 的层
    pub fn succeed<T: Send + Sync + 'static>(value: T) -> Self {
        let key = TypeKey::of::<T>();
        let value = Arc::new(value);
        Self::from_fn(
            format!("succeed<{}>", key),
            KeySet::new(),
            KeySet::from([key]),
            move |_, _| {
                let value = value.clone();
                async move {
                    let mut output = Environment::empty();
                    output.insert(key, value);
                    Ok(output)
                }
            },
        )
    }

    /// 从输入构建一个 `T` 服务
    pub fn service<T, F, Fut>(name: impl Into<String>, inputs: KeySet, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Environment) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_build(
            name,
            inputs,
            KeySet::from([TypeKey::of::<T>()]),
            ServiceBuild {
                factory,
                _phantom: PhantomData,
            },
        )
    }

    /// 获取一个 `T`，作用域关闭时释放
    pub fn scoped<T, A, AFut, R, RFut>(
        name: impl Into<String>,
        inputs: KeySet,
        acquire: A,
        release: R,
    ) -> Self
    where
        T: Send + Sync + 'static,
        A: Fn(Environment) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = anyhow::Result<T>> + Send + 'static,
        R: Fn(Arc<T>) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        Self::from_build(
            name.clone(),
            inputs,
            KeySet::from([TypeKey::of::<T>()]),
            ScopedBuild {
                label: name,
                acquire,
                release: Arc::new(release),
                _phantom: PhantomData,
            },
        )
    }

    /// 水平组合：并发构建两侧并合并输出
    ///
    /// 两侧产出同一个键时返回 `AmbiguousBinding`。
    pub fn zip(&self, other: &Layer) -> Result<Layer, LayerError> {
        if let Some(key) = self.outputs().intersection(other.outputs()).next() {
            return Err(LayerError::AmbiguousBinding(*key));
        }
        let inputs = self.inputs().union(other.inputs()).copied().collect();
        let outputs = self.outputs().union(other.outputs()).copied().collect();
        Ok(Self::from_node(
            format!("({} ++ {})", self.name(), other.name()),
            inputs,
            outputs,
            LayerKind::Zip(self.clone(), other.clone()),
        ))
    }

    /// 把 `layers` 全部水平组合
    pub fn zip_all<'a>(layers: impl IntoIterator<Item = &'a Layer>) -> Result<Layer, LayerError> {
        let mut iter = layers.into_iter();
        let first = match iter.next() {
            Some(layer) => layer.clone(),
            None => return Ok(Layer::unit()),
        };
        iter.try_fold(first, |acc, layer| acc.zip(layer))
    }

    /// 垂直组合：先构建 `self`，再用其输出构建 `next`
    ///
    /// `next` 能看到原始输入和 `self` 的输出；只对外暴露 `next` 的输出。
    pub fn and_then(&self, next: &Layer) -> Layer {
        Self::from_node(
            format!("{} >>> {}", self.name(), next.name()),
            self.sequenced_inputs(next),
            next.outputs().clone(),
            LayerKind::AndThen(self.clone(), next.clone()),
        )
    }

    /// 同 [`and_then`](Self::and_then)，但暴露两层的输出
    pub fn and_then_keep(&self, next: &Layer) -> Layer {
        Self::from_node(
            format!("{} +>> {}", self.name(), next.name()),
            self.sequenced_inputs(next),
            self.outputs().union(next.outputs()).copied().collect(),
            LayerKind::AndThenKeep(self.clone(), next.clone()),
        )
    }

    fn sequenced_inputs(&self, next: &Layer) -> KeySet {
        let mut inputs = self.inputs().clone();
        inputs.extend(next.inputs().difference(self.outputs()).copied());
        inputs
    }

    /// 每次 provide 至多构建一次，无论有多少条路径到达
    ///
    /// 返回值的克隆共享同一个 memo 标识。
    pub fn memo(&self) -> Layer {
        self.memo_as(MemoKey::generate())
    }

    /// 使用显式指定的标识进行 memo
    pub fn memo_as(&self, key: impl Into<MemoKey>) -> Layer {
        Self::from_node(
            self.name().to_string(),
            self.inputs().clone(),
            self.outputs().clone(),
            LayerKind::Memo(key.into(), self.clone()),
        )
    }

    /// 无输入无输出的层
    pub fn unit() -> Layer {
        Self::from_fn("unit", KeySet::new(), KeySet::new(), |_, _| async {
            Ok(Environment::empty())
        })
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn inputs(&self) -> &KeySet {
        &self.node.inputs
    }

    pub fn outputs(&self) -> &KeySet {
        &self.node.outputs
    }

    pub fn is_memoized(&self) -> bool {
        matches!(self.node.kind, LayerKind::Memo(..))
    }

    pub(crate) fn kind(&self) -> &LayerKind {
        &self.node.kind
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.node.name)
            .field("inputs", &self.node.inputs)
            .field("outputs", &self.node.outputs)
            .finish()
    }
}
