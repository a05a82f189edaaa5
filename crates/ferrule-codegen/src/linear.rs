//! Linear ownership tracking for structure values.
//!
//! Each structure-typed variable owns a tree of [`LinearId`] nodes mirroring
//! its declared shape. A node is *composable* when the value it describes is
//! fully defined and has not been moved out of since. Field writes define
//! subtrees in place, moves consume them, and the tree answers whether the
//! whole value may be used.
//!
//! Nodes without children are uniform: the whole subtree is defined,
//! consumed, or undefined. The first [`LinearArena::get`] on a uniform node
//! splits it into one child per declared field, each inheriting that state.

use std::collections::BTreeMap;
use std::rc::Rc;

use ferrule_types::Span;
use thiserror::Error;

/// Declared field structure of a value. Leaves have no fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape {
    fields: Rc<Vec<(String, Shape)>>,
}

impl Shape {
    pub fn leaf() -> Self {
        Self::default()
    }

    pub fn composite(fields: Vec<(String, Shape)>) -> Self {
        Self {
            fields: Rc::new(fields),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, Shape)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Shape> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, shape)| shape)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinearId(u32);

/// Who may do what with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    #[default]
    Owner,
    /// Readable only.
    ReadLoan,
    /// Fields may be (re)defined but nothing may be moved out.
    WriteLoan,
}

/// One offending part of a value that was required to be complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    /// The field was never defined.
    Missing { path: String },
    /// The field was moved out at `at`.
    Consumed { path: String, at: Span },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinearError {
    #[error("cannot move out of `{path}`, which is only borrowed here")]
    MoveOutOfLoan { path: String },

    #[error("cannot assign to `{path}`, which is only readable here")]
    WriteToReadLoan { path: String },
}

struct LinearNode {
    name: String,
    shape: Shape,
    composable: bool,
    consumed_at: Option<Span>,
    fields: BTreeMap<String, LinearId>,
    parent: Option<LinearId>,
    ownership: Ownership,
}

#[derive(Default)]
pub struct LinearArena {
    nodes: Vec<LinearNode>,
}

impl LinearArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, undefined root value named `name`.
    pub fn new_value(&mut self, name: &str, shape: Shape) -> LinearId {
        self.push(LinearNode {
            name: name.to_string(),
            shape,
            composable: false,
            consumed_at: None,
            fields: BTreeMap::new(),
            parent: None,
            ownership: Ownership::Owner,
        })
    }

    /// Child node for field `name`, or `None` if the shape has no such field.
    pub fn get(&mut self, id: LinearId, name: &str) -> Option<LinearId> {
        self.node(id).shape.field(name)?;
        self.split(id);
        self.node(id).fields.get(name).copied()
    }

    pub fn is_composable(&self, id: LinearId) -> bool {
        self.node(id).composable
    }

    pub fn consumed_at(&self, id: LinearId) -> Option<Span> {
        self.node(id).consumed_at
    }

    pub fn shape(&self, id: LinearId) -> &Shape {
        &self.node(id).shape
    }

    /// Dotted path from the root, e.g. `line.start.x`.
    pub fn path(&self, id: LinearId) -> String {
        let mut parts = vec![self.node(id).name.as_str()];
        let mut cursor = self.node(id).parent;
        while let Some(parent) = cursor {
            parts.push(self.node(parent).name.as_str());
            cursor = self.node(parent).parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Nearest loan on the way to the root, if any.
    pub fn loan(&self, id: LinearId) -> Option<Ownership> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current);
            if node.ownership != Ownership::Owner {
                return Some(node.ownership);
            }
            cursor = node.parent;
        }
        None
    }

    pub fn borrow(&mut self, id: LinearId, ownership: Ownership) {
        self.node_mut(id).ownership = ownership;
    }

    pub fn mark_defined(&mut self, id: LinearId) -> Result<(), LinearError> {
        if self.loan(id) == Some(Ownership::ReadLoan) {
            return Err(LinearError::WriteToReadLoan {
                path: self.path(id),
            });
        }
        let node = self.node_mut(id);
        node.consumed_at = None;
        node.fields.clear();
        node.composable = true;
        self.refresh_ancestors(id);
        Ok(())
    }

    pub fn mark_consumed(&mut self, id: LinearId, at: Span) -> Result<(), LinearError> {
        if self.loan(id).is_some() {
            return Err(LinearError::MoveOutOfLoan {
                path: self.path(id),
            });
        }
        let node = self.node_mut(id);
        node.consumed_at = Some(at);
        node.fields.clear();
        node.composable = false;
        self.refresh_ancestors(id);
        Ok(())
    }

    pub fn has_composition_errors(&self, id: LinearId) -> bool {
        !self.node(id).composable
    }

    /// Every missing or consumed part of the value, in declaration order.
    pub fn composition_errors(&self, id: LinearId) -> Vec<CompositionError> {
        let mut errors = Vec::new();
        let path = self.path(id);
        self.collect_errors(id, &path, &mut errors);
        errors
    }

    fn collect_errors(&self, id: LinearId, path: &str, errors: &mut Vec<CompositionError>) {
        let node = self.node(id);
        if node.composable {
            return;
        }
        if let Some(at) = node.consumed_at {
            errors.push(CompositionError::Consumed {
                path: path.to_string(),
                at,
            });
            return;
        }
        if node.fields.is_empty() {
            missing_leaves(&node.shape, path, errors);
            return;
        }
        for (field, _) in node.shape.fields() {
            if let Some(&child) = node.fields.get(field) {
                self.collect_errors(child, &format!("{path}.{field}"), errors);
            }
        }
    }

    /// Deep copy of the subtree rooted at `id`, detached from any parent.
    pub fn clone_value(&mut self, id: LinearId) -> LinearId {
        self.copy_subtree(id, None)
    }

    fn copy_subtree(&mut self, id: LinearId, parent: Option<LinearId>) -> LinearId {
        let (name, shape, composable, consumed_at, ownership, fields) = {
            let node = self.node(id);
            (
                node.name.clone(),
                node.shape.clone(),
                node.composable,
                node.consumed_at,
                node.ownership,
                node.fields.clone(),
            )
        };
        let copy = self.push(LinearNode {
            name,
            shape,
            composable,
            consumed_at,
            fields: BTreeMap::new(),
            parent,
            ownership,
        });
        for (field, child) in fields {
            let child_copy = self.copy_subtree(child, Some(copy));
            self.node_mut(copy).fields.insert(field, child_copy);
        }
        copy
    }

    /// Merge the state a branch left in `branch` back into `target`.
    ///
    /// A part stays defined only if it is defined in both; a move recorded
    /// by the branch replaces whatever the target had.
    pub fn infuse(&mut self, target: LinearId, branch: LinearId) {
        self.merge(target, branch);
        self.refresh_ancestors(target);
    }

    fn merge(&mut self, target: LinearId, branch: LinearId) {
        if let Some(at) = self.uniform_consumed(branch) {
            let node = self.node_mut(target);
            node.fields.clear();
            node.composable = false;
            node.consumed_at = Some(at);
            return;
        }
        if self.uniform_consumed(target).is_some() {
            return;
        }
        let target_uniform = self.node(target).fields.is_empty();
        let branch_uniform = self.node(branch).fields.is_empty();
        if target_uniform && branch_uniform {
            let composable = self.node(target).composable && self.node(branch).composable;
            self.node_mut(target).composable = composable;
            return;
        }

        self.split(target);
        self.split(branch);
        let pairs: Vec<(LinearId, LinearId)> = self
            .node(target)
            .fields
            .iter()
            .filter_map(|(field, &t)| self.node(branch).fields.get(field).map(|&b| (t, b)))
            .collect();
        for (t, b) in pairs {
            self.merge(t, b);
        }
        self.recompute(target);
    }

    fn uniform_consumed(&self, id: LinearId) -> Option<Span> {
        let node = self.node(id);
        if node.fields.is_empty() {
            node.consumed_at
        } else {
            None
        }
    }

    /// Give a uniform composite node one child per declared field.
    fn split(&mut self, id: LinearId) {
        let (shape, composable, consumed_at) = {
            let node = self.node(id);
            if !node.fields.is_empty() || node.shape.is_leaf() {
                return;
            }
            (node.shape.clone(), node.composable, node.consumed_at)
        };
        for (field, field_shape) in shape.fields() {
            let child = self.push(LinearNode {
                name: field.clone(),
                shape: field_shape.clone(),
                composable,
                consumed_at,
                fields: BTreeMap::new(),
                parent: Some(id),
                // Loans are inherited through `loan()`.
                ownership: Ownership::Owner,
            });
            self.node_mut(id).fields.insert(field.clone(), child);
        }
        self.node_mut(id).consumed_at = None;
    }

    fn recompute(&mut self, id: LinearId) {
        let composable = {
            let node = self.node(id);
            node.fields.values().all(|&child| self.node(child).composable)
        };
        self.node_mut(id).composable = composable;
    }

    fn refresh_ancestors(&mut self, id: LinearId) {
        let mut cursor = self.node(id).parent;
        while let Some(parent) = cursor {
            self.recompute(parent);
            cursor = self.node(parent).parent;
        }
    }

    fn push(&mut self, node: LinearNode) -> LinearId {
        let id = LinearId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn node(&self, id: LinearId) -> &LinearNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: LinearId) -> &mut LinearNode {
        &mut self.nodes[id.0 as usize]
    }
}

fn missing_leaves(shape: &Shape, path: &str, errors: &mut Vec<CompositionError>) {
    if shape.is_leaf() {
        errors.push(CompositionError::Missing {
            path: path.to_string(),
        });
        return;
    }
    for (field, field_shape) in shape.fields() {
        missing_leaves(field_shape, &format!("{path}.{field}"), errors);
    }
}
