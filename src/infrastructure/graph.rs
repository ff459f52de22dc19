//! 自动装配：从一组层推导出组合方式
//!
//! 按键把生产者接到消费者上，分出依赖层级；同一层级水平组合，
//! 层级之间垂直串联。

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::environment::Environment;
use super::key::{KeySet, TypeKey};
use super::layer::Layer;
use super::planner::Planner;
use super::scope::ScopeHandle;
use crate::errors::LayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

/// 待按键装配的层集合（无序）
#[derive(Debug, Clone, Default)]
pub struct LayerGraph {
    layers: Vec<Layer>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn add(&mut self, layer: Layer) -> &mut Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// 把 `targets` 需要的层组合成一个层
    pub fn assemble(&self, targets: &KeySet) -> Result<Layer, LayerError> {
        self.assemble_with(targets, &KeySet::new())
    }

    /// 同 [`assemble`](Self::assemble)，`external` 中的键由调用方提供
    pub fn assemble_with(&self, targets: &KeySet, external: &KeySet) -> Result<Layer, LayerError> {
        let producers = self.producers()?;

        for target in targets {
            if !producers.contains_key(target) && !external.contains(target) {
                return Err(LayerError::MissingService(*target));
            }
        }

        let (deps, missing) = self.dependencies(&producers, external);
        let selected = Self::reachable(targets, &producers, &deps);
        // 未被用到的层即使输入不全也不影响
        if let Some(&index) = selected.iter().find(|&&index| !missing[index].is_empty()) {
            return Err(LayerError::UnsatisfiedInput {
                layer: self.layers[index].name().to_string(),
                missing: missing[index].clone(),
            });
        }
        let order = self.topological_order(&selected, &deps)?;

        // 层级 = 最长依赖链长度
        let mut levels: HashMap<usize, usize> = HashMap::new();
        for &index in &order {
            let level = deps[index]
                .iter()
                .filter_map(|dep| levels.get(dep))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            levels.insert(index, level);
        }

        let depth = levels.values().copied().max().map_or(0, |max| max + 1);
        let mut assembled: Option<Layer> = None;
        for level in 0..depth {
            let members: Vec<&Layer> = selected
                .iter()
                .filter(|index| levels.get(index) == Some(&level))
                .map(|&index| &self.layers[index])
                .collect();
            debug!(
                level,
                layers = ?members.iter().map(|layer| layer.name()).collect::<Vec<_>>(),
                "assembled dependency level"
            );
            let combined = Layer::zip_all(members)?;
            assembled = Some(match assembled {
                Some(previous) => previous.and_then_keep(&combined),
                None => combined,
            });
        }

        Ok(assembled.unwrap_or_else(Layer::unit))
    }

    /// 装配并构建
    pub async fn provide(
        &self,
        planner: &Planner,
        targets: &KeySet,
    ) -> Result<(Environment, ScopeHandle), LayerError> {
        let layer = self.assemble(targets)?;
        planner.provide(targets, &layer).await
    }

    /// 以 `base` 的键为外部输入装配，然后构建
    pub async fn provide_with(
        &self,
        planner: &Planner,
        base: Environment,
        targets: &KeySet,
    ) -> Result<(Environment, ScopeHandle), LayerError> {
        let layer = self.assemble_with(targets, &base.keys())?;
        let own_targets: KeySet = targets.intersection(layer.outputs()).copied().collect();
        let (env, handle) = planner.provide_with(base.clone(), &own_targets, &layer).await?;
        Ok((base.restrict(targets).union(&env), handle))
    }

    fn producers(&self) -> Result<HashMap<TypeKey, usize>, LayerError> {
        let mut producers = HashMap::new();
        for (index, layer) in self.layers.iter().enumerate() {
            for key in layer.outputs() {
                if producers.insert(*key, index).is_some() {
                    return Err(LayerError::AmbiguousBinding(*key));
                }
            }
        }
        Ok(producers)
    }

    /// 每层依赖的生产者下标，以及无人提供的输入
    fn dependencies(
        &self,
        producers: &HashMap<TypeKey, usize>,
        external: &KeySet,
    ) -> (Vec<BTreeSet<usize>>, Vec<Vec<TypeKey>>) {
        self.layers
            .iter()
            .map(|layer| {
                let mut layer_deps = BTreeSet::new();
                let mut missing = Vec::new();
                for key in layer.inputs() {
                    match producers.get(key) {
                        Some(&producer) => {
                            layer_deps.insert(producer);
                        }
                        None if external.contains(key) => {}
                        None => missing.push(*key),
                    }
                }
                (layer_deps, missing)
            })
            .unzip()
    }

    fn reachable(
        targets: &KeySet,
        producers: &HashMap<TypeKey, usize>,
        deps: &[BTreeSet<usize>],
    ) -> BTreeSet<usize> {
        let mut selected = BTreeSet::new();
        let mut pending: Vec<usize> = targets
            .iter()
            .filter_map(|key| producers.get(key).copied())
            .collect();
        while let Some(index) = pending.pop() {
            if selected.insert(index) {
                pending.extend(deps[index].iter().copied());
            }
        }
        selected
    }

    /// 依赖在前；有环时报告环上的层名
    fn topological_order(
        &self,
        selected: &BTreeSet<usize>,
        deps: &[BTreeSet<usize>],
    ) -> Result<Vec<usize>, LayerError> {
        let mut state = vec![Visit::New; self.layers.len()];
        let mut order = Vec::with_capacity(selected.len());
        let mut path = Vec::new();

        for &start in selected {
            self.visit(start, deps, &mut state, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        deps: &[BTreeSet<usize>],
        state: &mut [Visit],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), LayerError> {
        match state[index] {
            Visit::Done => return Ok(()),
            Visit::Active => {
                let start = path.iter().position(|&i| i == index).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.layers[i].name().to_string())
                    .collect();
                cycle.push(self.layers[index].name().to_string());
                return Err(LayerError::CyclicDependency(cycle));
            }
            Visit::New => {}
        }

        state[index] = Visit::Active;
        path.push(index);
        for &dep in &deps[index] {
            self.visit(dep, deps, state, path, order)?;
        }
        path.pop();
        state[index] = Visit::Done;
        order.push(index);
        Ok(())
    }
}
