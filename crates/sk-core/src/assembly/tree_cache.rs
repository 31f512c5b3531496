//! Cached element tree for traversal

use std::collections::HashMap;
use uuid::Uuid;

use super::types::RigidElement;

/// Tree structure derived from the `parent` fields (computed on demand)
#[derive(Debug, Clone, Default)]
pub(super) struct TreeCache {
    /// Depth of each element (root = 0)
    pub depths: HashMap<Uuid, usize>,
    /// Chain from the root down to each element (inclusive)
    pub ancestors: HashMap<Uuid, Vec<Uuid>>,
    /// Children of each element, sorted by name
    pub children: HashMap<Uuid, Vec<Uuid>>,
    /// Root element IDs, sorted by name
    pub roots: Vec<Uuid>,
    /// Whether cache is valid
    pub valid: bool,
}

impl TreeCache {
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn rebuild(&mut self, elements: &HashMap<Uuid, RigidElement>) {
        self.depths.clear();
        self.ancestors.clear();
        self.children.clear();
        self.roots.clear();

        let by_name = |ids: &mut Vec<Uuid>| {
            ids.sort_by(|a, b| elements[a].name.cmp(&elements[b].name).then(a.cmp(b)));
        };

        for element in elements.values() {
            match element.parent {
                Some(parent) if elements.contains_key(&parent) => {
                    self.children.entry(parent).or_default().push(element.id);
                }
                _ => self.roots.push(element.id),
            }
        }
        by_name(&mut self.roots);
        for list in self.children.values_mut() {
            by_name(list);
        }

        for &root_id in &self.roots.clone() {
            self.build_recursive(root_id, 0, vec![root_id]);
        }

        self.valid = true;
    }

    fn build_recursive(&mut self, id: Uuid, depth: usize, chain: Vec<Uuid>) {
        self.depths.insert(id, depth);
        self.ancestors.insert(id, chain.clone());
        let children = self.children.get(&id).cloned().unwrap_or_default();
        for child in children {
            // skip parent cycles
            if chain.contains(&child) {
                continue;
            }
            let mut child_chain = chain.clone();
            child_chain.push(child);
            self.build_recursive(child, depth + 1, child_chain);
        }
    }

    /// All elements depth-first from the roots
    pub fn depth_first(&self) -> Vec<Uuid> {
        let mut result = Vec::with_capacity(self.depths.len());
        let mut stack: Vec<Uuid> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            result.push(id);
            if let Some(children) = self.children.get(&id) {
                stack.extend(children.iter().rev().copied());
            }
        }
        result
    }
}
