use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{Result, SynthError};
use crate::model::{ResourceNode, Stack};

/// Dependency graph over a finished stack. Holding it borrows the stack, so
/// nodes cannot change once the order has been computed.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    stack: &'a Stack,
    /// For each node (by declaration index), the distinct nodes it needs first.
    dependencies: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl<'a> DependencyGraph<'a> {
    pub fn stack(&self) -> &'a Stack {
        self.stack
    }

    /// Nodes in creation order: every node appears after all nodes it references.
    pub fn ordered(&self) -> impl Iterator<Item = &'a ResourceNode> + '_ {
        self.order
            .iter()
            .filter_map(|&index| self.stack.get_index(index))
    }

    pub fn order_ids(&self) -> Vec<&'a str> {
        self.ordered().map(|node| node.id.as_str()).collect()
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&'a str> {
        let Some(index) = self.stack.index_of(id) else {
            return Vec::new();
        };
        self.dependencies[index]
            .iter()
            .filter_map(|&dep| self.stack.get_index(dep))
            .map(|node| node.id.as_str())
            .collect()
    }
}

/// Derive a deterministic topological order from the references inside each
/// node's properties. Ties are broken by declaration order.
pub fn build_graph(stack: &Stack) -> Result<DependencyGraph<'_>> {
    let count = stack.len();
    let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(count);
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

    for (index, node) in stack.nodes().enumerate() {
        let mut needs = BTreeSet::new();
        for (property, reference) in node.references() {
            let target = stack.index_of(&reference.target).ok_or_else(|| {
                SynthError::UnknownReference {
                    resource: node.id.clone(),
                    property: property.to_string(),
                    target: reference.target.clone(),
                }
            })?;
            needs.insert(target);
        }
        for &target in &needs {
            dependents[target].push(index);
        }
        dependencies.push(needs.into_iter().collect());
    }

    let mut pending: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < count {
        let nodes = find_cycle(stack, &dependencies, &pending);
        return Err(SynthError::Cycle { nodes });
    }

    debug!(stack = stack.name(), nodes = count, "dependency order resolved");
    Ok(DependencyGraph {
        stack,
        dependencies,
        order,
    })
}

/// Every node left with unmet dependencies has at least one dependency that is
/// also unresolved, so walking those edges from any of them closes a loop.
fn find_cycle(stack: &Stack, dependencies: &[Vec<usize>], pending: &[usize]) -> Vec<String> {
    let unresolved = |index: usize| pending[index] > 0;
    let Some(start) = (0..pending.len()).find(|&i| unresolved(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current].iter().find(|&&dep| unresolved(dep)) else {
            break;
        };
        if let Some(position) = path.iter().position(|&seen| seen == next) {
            path.drain(..position);
            path.push(next);
            break;
        }
        path.push(next);
        current = next;
    }

    path.into_iter()
        .filter_map(|index| stack.get_index(index))
        .map(|node| node.id.clone())
        .collect()
}
