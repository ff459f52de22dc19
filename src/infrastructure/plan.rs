//! 构建计划
//!
//! 把层树展开为计划节点，在任何构建开始前确认节点间的依赖无环，
//! 并检查键级依赖（某层的输入经由其他层依赖它自己的输出）。
//!
//! 每个叶子出现处各成一个节点，共享 [`MemoKey`] 的 memo 层合并为一个节点。边：
//! - memo 节点依赖它包含的每个节点
//! - `a.and_then(b)` 中首次经由 `b` 到达的节点依赖 `a` 的每个节点

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::key::TypeKey;
use super::layer::{Layer, LayerKind, MemoKey};
use crate::errors::LayerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanNodeKind {
    Leaf,
    Memo(MemoKey),
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub name: String,
    pub kind: PlanNodeKind,
    /// 必须先构建的节点
    pub depends_on: BTreeSet<usize>,
}

/// 已校验、按拓扑序排列的构建计划
#[derive(Debug, Clone)]
pub struct BuildPlan {
    nodes: Vec<PlanNode>,
    order: Vec<usize>,
}

impl BuildPlan {
    /// 展开层并拒绝带环的图
    pub fn compile(layer: &Layer) -> Result<Self, LayerError> {
        let mut builder = PlanBuilder::default();
        builder.visit(layer);

        let deps: Vec<BTreeSet<usize>> = builder
            .nodes
            .iter()
            .map(|node| node.depends_on.clone())
            .collect();
        let order = topological_order(&deps).map_err(|stuck| {
            let mut names: Vec<String> = find_cycle(&deps, &stuck)
                .into_iter()
                .map(|idx| builder.nodes[idx].name.clone())
                .collect();
            names.reverse();
            LayerError::CyclicDependency(names)
        })?;
        builder.check_key_cycles()?;

        Ok(Self {
            nodes: builder.nodes,
            order,
        })
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// 按合法构建顺序排列的节点名
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&idx| self.nodes[idx].name.as_str()).collect()
    }

    /// 不重复的 memo 标识，每次执行各占一个槽位
    pub fn memo_keys(&self) -> impl Iterator<Item = &MemoKey> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            PlanNodeKind::Memo(key) => Some(key),
            PlanNodeKind::Leaf => None,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Default)]
struct PlanBuilder {
    nodes: Vec<PlanNode>,
    memo_nodes: HashMap<MemoKey, usize>,
    /// (产出键, 输入键) -> 第一个产生这条边的叶子名
    key_edges: BTreeMap<(TypeKey, TypeKey), String>,
}

impl PlanBuilder {
    /// 返回 `layer` 的顶层节点
    fn visit(&mut self, layer: &Layer) -> Vec<usize> {
        match layer.kind() {
            LayerKind::Leaf(_) => {
                for input in layer.inputs() {
                    // 同一个键既读又写是装饰，不算环
                    for output in layer.outputs().iter().filter(|output| *output != input) {
                        self.key_edges
                            .entry((*output, *input))
                            .or_insert_with(|| layer.name().to_string());
                    }
                }
                vec![self.push(layer.name(), PlanNodeKind::Leaf)]
            }
            LayerKind::Zip(left, right) => {
                let mut nodes = self.visit(left);
                nodes.extend(self.visit(right));
                nodes
            }
            LayerKind::AndThen(first, next) | LayerKind::AndThenKeep(first, next) => {
                let before = self.visit(first);
                let first_new = self.nodes.len();
                let after = self.visit(next);
                // 复用的 memo 节点已在别处排好，只约束新出现的节点
                for &later in after.iter().filter(|&&idx| idx >= first_new) {
                    for &earlier in &before {
                        self.nodes[later].depends_on.insert(earlier);
                    }
                }
                before.into_iter().chain(after).collect()
            }
            LayerKind::Memo(key, inner) => {
                if let Some(&idx) = self.memo_nodes.get(key) {
                    return vec![idx];
                }
                let idx = self.push(layer.name(), PlanNodeKind::Memo(key.clone()));
                self.memo_nodes.insert(key.clone(), idx);
                // 包含自身时出现自环，构建会永远等待自己
                for contained in self.visit(inner) {
                    self.nodes[idx].depends_on.insert(contained);
                }
                vec![idx]
            }
        }
    }

    /// 键级依赖：某层的输入是否经由其他层依赖它自己的输出
    fn check_key_cycles(&self) -> Result<(), LayerError> {
        let index: BTreeMap<TypeKey, usize> = self
            .key_edges
            .keys()
            .flat_map(|(output, input)| [*output, *input])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .enumerate()
            .map(|(idx, key)| (key, idx))
            .collect();

        let mut deps = vec![BTreeSet::new(); index.len()];
        let mut labels: HashMap<(usize, usize), &str> = HashMap::new();
        for ((output, input), layer) in &self.key_edges {
            if let (Some(&from), Some(&to)) = (index.get(output), index.get(input)) {
                deps[from].insert(to);
                labels.entry((from, to)).or_insert(layer.as_str());
            }
        }

        let Err(stuck) = topological_order(&deps) else {
            return Ok(());
        };
        let mut names: Vec<String> = find_cycle(&deps, &stuck)
            .windows(2)
            .filter_map(|pair| labels.get(&(pair[0], pair[1])))
            .map(|name| name.to_string())
            .collect();
        names.reverse();
        if let Some(first) = names.first().cloned() {
            names.push(first);
        }
        Err(LayerError::CyclicDependency(names))
    }

    fn push(&mut self, name: &str, kind: PlanNodeKind) -> usize {
        self.nodes.push(PlanNode {
            name: name.to_string(),
            kind,
            depends_on: BTreeSet::new(),
        });
        self.nodes.len() - 1
    }
}

/// Kahn 算法；剩下的节点说明有环，返回这些节点
fn topological_order(deps: &[BTreeSet<usize>]) -> Result<Vec<usize>, BTreeSet<usize>> {
    let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (idx, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            dependents[dep].push(idx);
        }
    }

    let mut ready: VecDeque<usize> = (0..deps.len()).filter(|&idx| remaining[idx] == 0).collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(idx) = ready.pop_front() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() == deps.len() {
        Ok(order)
    } else {
        Err((0..deps.len()).filter(|&idx| remaining[idx] > 0).collect())
    }
}

/// 在卡住的节点里沿依赖边走，直到某个节点重复出现
///
/// 返回的路径首尾相同，方向为依赖方到被依赖方。
fn find_cycle(deps: &[BTreeSet<usize>], stuck: &BTreeSet<usize>) -> Vec<usize> {
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        // 卡住的节点至少有一个依赖也卡住，否则它的入度早已归零
        let next = deps[current]
            .iter()
            .copied()
            .find(|dep| stuck.contains(dep))
            .unwrap_or(start);
        if let Some(pos) = path.iter().position(|&idx| idx == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
