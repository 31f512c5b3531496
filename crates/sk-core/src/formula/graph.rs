//! Dependency graph over named scalars

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::expr::free_identifiers;
use super::{FormulaError, NamedScalar, ScalarKey};

/// A scalar in the dependency graph, built fresh per evaluation request
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub key: ScalarKey,
    /// Indices of the scalars this node's formula references
    pub references: BTreeSet<usize>,
    /// Referenced names not yet resolved during the topological sort
    pub unresolved: usize,
}

/// Graph of formula references, indexed like the scalar slice it was built from
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub nodes: Vec<DependencyNode>,
    index: HashMap<ScalarKey, usize>,
}

impl DependencyGraph {
    /// Build the graph. Names must already be unique.
    pub fn build(scalars: &[NamedScalar]) -> Result<Self, FormulaError> {
        let index: HashMap<ScalarKey, usize> = scalars
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key(), i))
            .collect();

        let mut graph = Self {
            nodes: Vec::with_capacity(scalars.len()),
            index,
        };

        for scalar in scalars {
            let references = graph.resolve_references(&scalar.formula, &scalar.scope, || {
                scalar.key().to_string()
            })?;
            graph.nodes.push(DependencyNode {
                key: scalar.key(),
                references,
                unresolved: 0,
            });
        }

        Ok(graph)
    }

    /// Build only the part of the graph reachable from `formula`.
    ///
    /// Scalars outside the formula's dependency subtree are never parsed; their
    /// nodes carry no references. Returns the graph and the subtree.
    pub fn build_reachable(
        scalars: &[NamedScalar],
        formula: &str,
        scope: &str,
        owner: impl Fn() -> String,
    ) -> Result<(Self, BTreeSet<usize>), FormulaError> {
        let index: HashMap<ScalarKey, usize> = scalars
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key(), i))
            .collect();
        let nodes = scalars
            .iter()
            .map(|s| DependencyNode {
                key: s.key(),
                references: BTreeSet::new(),
                unresolved: 0,
            })
            .collect();
        let mut graph = Self { nodes, index };

        let roots = graph.resolve_references(formula, scope, owner)?;
        let mut subtree = BTreeSet::new();
        let mut stack: Vec<usize> = roots.into_iter().collect();
        while let Some(i) = stack.pop() {
            if !subtree.insert(i) {
                continue;
            }
            let scalar = &scalars[i];
            let references = graph.resolve_references(&scalar.formula, &scalar.scope, || {
                scalar.key().to_string()
            })?;
            stack.extend(references.iter().copied());
            graph.nodes[i].references = references;
        }

        Ok((graph, subtree))
    }

    /// Resolve a name as seen from `scope`: own scope first, then global
    pub fn lookup(&self, name: &str, scope: &str) -> Option<usize> {
        if !scope.is_empty()
            && let Some(&i) = self.index.get(&ScalarKey::new(scope, name))
        {
            return Some(i);
        }
        self.index.get(&ScalarKey::global(name)).copied()
    }

    /// Indices referenced by `formula` evaluated in `scope`
    pub fn resolve_references(
        &self,
        formula: &str,
        scope: &str,
        owner: impl Fn() -> String,
    ) -> Result<BTreeSet<usize>, FormulaError> {
        free_identifiers(formula)
            .into_iter()
            .map(|name| {
                self.lookup(&name, scope)
                    .ok_or_else(|| FormulaError::UnknownVariable {
                        name,
                        referenced_by: owner(),
                    })
            })
            .collect()
    }

    /// Kahn's algorithm over `subset` (all nodes when `None`).
    ///
    /// The subset must be closed under references.
    pub fn topological_order(
        &mut self,
        subset: Option<&BTreeSet<usize>>,
    ) -> Result<Vec<usize>, FormulaError> {
        let members: Vec<usize> = match subset {
            Some(s) => s.iter().copied().collect(),
            None => (0..self.nodes.len()).collect(),
        };

        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &members {
            let node = &mut self.nodes[i];
            node.unresolved = node.references.len();
            for &r in &node.references {
                dependents.entry(r).or_default().push(i);
            }
        }

        let mut queue: VecDeque<usize> = members
            .iter()
            .copied()
            .filter(|&i| self.nodes[i].unresolved == 0)
            .collect();
        let mut order = Vec::with_capacity(members.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            if let Some(list) = dependents.get(&node) {
                for &d in list {
                    let dep = &mut self.nodes[d];
                    dep.unresolved -= 1;
                    if dep.unresolved == 0 {
                        queue.push_back(d);
                    }
                }
            }
        }

        if order.len() < members.len() {
            let remaining: BTreeSet<usize> = members
                .into_iter()
                .filter(|&i| self.nodes[i].unresolved > 0)
                .collect();
            let cycle = self
                .find_cycle(&remaining)
                .into_iter()
                .map(|i| self.nodes[i].key.to_string())
                .collect();
            return Err(FormulaError::CircularReference { cycle });
        }

        Ok(order)
    }

    /// Walk references inside `remaining` until a node repeats
    fn find_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<usize> {
        let Some(&start) = remaining.iter().next() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            // Every node left after Kahn has an unresolved reference inside `remaining`
            let Some(&next) = self.nodes[current]
                .references
                .iter()
                .find(|&&r| remaining.contains(&r))
            else {
                return path;
            };
            if let Some(pos) = path.iter().position(|&n| n == next) {
                let mut cycle = path[pos..].to_vec();
                cycle.push(next);
                return cycle;
            }
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalars(defs: &[(&str, &str)]) -> Vec<NamedScalar> {
        defs.iter()
            .map(|(n, f)| NamedScalar::new(*n, *f))
            .collect()
    }

    #[test]
    fn test_orders_dependencies_first() {
        let s = scalars(&[("c", "a + b"), ("b", "a * 2"), ("a", "1")]);
        let mut graph = DependencyGraph::build(&s).unwrap();
        let order = graph.topological_order(None).unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_reports_cycle_path() {
        let s = scalars(&[("a", "b + 1"), ("b", "a + 1"), ("c", "2")]);
        let mut graph = DependencyGraph::build(&s).unwrap();
        match graph.topological_order(None) {
            Err(FormulaError::CircularReference { cycle }) => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
                assert!(!cycle.contains(&"c".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_variable() {
        let s = scalars(&[("a", "missing * 2")]);
        let err = DependencyGraph::build(&s).unwrap_err();
        assert!(matches!(err, FormulaError::UnknownVariable { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_scoped_lookup_prefers_own_scope() {
        let s = vec![
            NamedScalar::new("k", "1"),
            NamedScalar::scoped("upright", "k", "2"),
            NamedScalar::scoped("upright", "h", "k * 10"),
        ];
        let graph = DependencyGraph::build(&s).unwrap();
        assert_eq!(graph.lookup("k", "upright"), Some(1));
        assert_eq!(graph.lookup("k", "frame"), Some(0));
        assert_eq!(graph.nodes[2].references.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_build_reachable_skips_unrelated_scalars() {
        let s = scalars(&[("a", "1"), ("b", "a * 2"), ("typo", "missing + 1"), ("c", "c")]);
        let (mut graph, subtree) =
            DependencyGraph::build_reachable(&s, "b + 1", "", || "<expression>".into()).unwrap();
        assert_eq!(subtree, BTreeSet::from([0, 1]));
        assert!(graph.nodes[2].references.is_empty());
        assert_eq!(graph.topological_order(Some(&subtree)).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_build_reachable_reports_unknown_in_subtree() {
        let s = scalars(&[("a", "missing"), ("b", "a")]);
        let err = DependencyGraph::build_reachable(&s, "b", "", || "<expression>".into())
            .unwrap_err();
        assert!(matches!(
            err,
            FormulaError::UnknownVariable { ref referenced_by, .. } if referenced_by == "a"
        ));
    }
}
