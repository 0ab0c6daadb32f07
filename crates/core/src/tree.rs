//! Persistent, copy-on-write path tree.
//!
//! Nodes live in a single arena addressed by stable [`NodeId`]s instead of a
//! dictionary-of-dictionaries; a directory copy clones only the directory's
//! own node and shares children by id, giving O(1) subtree copy. Snapshots
//! form a DAG via copyfrom edges (copyfrom-rev is always < current-rev, so
//! the structure is acyclic by construction); nodes live for the process
//! lifetime, there is no garbage collection.

use std::collections::BTreeMap;

use crate::errors::TreeError;
use crate::model::{ContentRef, NodeId, NodeKind, Revnum, Snapshot, TreeNode};

/// A single change observed between two snapshots, as produced by
/// [`PathTree::diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChange {
    Added,
    Deleted,
    Modified,
    PropChanged,
}

pub struct PathTree {
    arena: Vec<TreeNode>,
    /// Closed, immutable snapshots indexed by revision.
    snapshots: BTreeMap<Revnum, Snapshot>,
    /// The snapshot currently under construction, if any.
    building: Option<(Revnum, NodeId)>,
    /// Touched paths recorded during construction of the current revision,
    /// used to drive `diff` without a full tree walk.
    touched: Vec<(String, PathChange)>,
}

impl PathTree {
    /// Creates a tree with an empty root directory at revision 0.
    pub fn new() -> Self {
        let mut arena = Vec::new();
        let root_id = NodeId(arena.len() as u32);
        arena.push(TreeNode::Dir {
            children: BTreeMap::new(),
            props: BTreeMap::new(),
        });
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Snapshot { rev: 0, root: root_id });
        Self {
            arena,
            snapshots,
            building: None,
            touched: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> &TreeNode {
        &self.arena[id.0 as usize]
    }

    fn push_node(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.arena.len() as u32);
        self.arena.push(node);
        id
    }

    fn latest_closed_rev(&self) -> Revnum {
        *self.snapshots.keys().next_back().unwrap_or(&0)
    }

    /// Begins construction of the next revision, copying the latest closed
    /// snapshot's root as the starting point.
    pub fn begin_revision(&mut self, rev: Revnum) {
        let root = self.snapshots[&self.latest_closed_rev()].root;
        self.building = Some((rev, root));
        self.touched.clear();
    }

    fn building_root(&self) -> NodeId {
        self.building.expect("no revision under construction").1
    }

    fn split_path(path: &str) -> Result<Vec<&str>, TreeError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        for part in &parts {
            if part.is_empty() || part.contains('/') {
                return Err(TreeError::InvalidComponent(path.to_string()));
            }
        }
        Ok(parts)
    }

    /// Looks up a node at a *closed* revision, O(path-depth).
    pub fn get(&self, rev: Revnum, path: &str) -> Result<NodeId, TreeError> {
        let snapshot = self
            .snapshots
            .get(&rev)
            .ok_or(TreeError::RevisionNotClosed(rev))?;
        self.resolve_from(snapshot.root, path)
    }

    /// Looks up a node in the snapshot currently under construction.
    pub fn get_building(&self, path: &str) -> Result<NodeId, TreeError> {
        self.resolve_from(self.building_root(), path)
    }

    fn resolve_from(&self, root: NodeId, path: &str) -> Result<NodeId, TreeError> {
        let parts = Self::split_path(path)?;
        let mut current = root;
        for part in parts {
            match self.node(current) {
                TreeNode::Dir { children, .. } => {
                    current = *children
                        .get(part)
                        .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
                }
                TreeNode::File { .. } => {
                    return Err(TreeError::NotFound(path.to_string()));
                }
            }
        }
        Ok(current)
    }

    /// Rebuilds the path from `building_root` down to `path`'s parent,
    /// cloning only the directory nodes along the way (structural sharing
    /// of every untouched sibling subtree), then calls `mutate` on the
    /// parent's child map to install the new child.
    fn rebuild_path<F>(&mut self, path: &str, mutate: F) -> Result<(), TreeError>
    where
        F: Fn(&mut BTreeMap<String, NodeId>, &str) -> Result<(), TreeError>,
    {
        let parts = Self::split_path(path)?;
        if parts.is_empty() {
            return Err(TreeError::InvalidComponent(path.to_string()));
        }
        let root = self.building_root();
        let new_root = self.rebuild_recursive(root, &parts, &mutate)?;
        self.building = Some((self.building.unwrap().0, new_root));
        Ok(())
    }

    fn rebuild_recursive<F>(
        &mut self,
        node_id: NodeId,
        remaining: &[&str],
        mutate: &F,
    ) -> Result<NodeId, TreeError>
    where
        F: Fn(&mut BTreeMap<String, NodeId>, &str) -> Result<(), TreeError>,
    {
        let (mut children, props) = match self.node(node_id) {
            TreeNode::Dir { children, props } => (children.clone(), props.clone()),
            TreeNode::File { .. } => return Err(TreeError::KindMismatch(remaining.join("/"))),
        };

        if remaining.len() == 1 {
            mutate(&mut children, remaining[0])?;
        } else {
            let name = remaining[0];
            let child_id = *children
                .get(name)
                .ok_or_else(|| TreeError::ParentMissing(remaining.join("/")))?;
            let new_child = self.rebuild_recursive(child_id, &remaining[1..], mutate)?;
            children.insert(name.to_string(), new_child);
        }

        Ok(self.push_node(TreeNode::Dir { children, props }))
    }

    /// Adds a new node at `path`. Fails if the parent is missing or the
    /// target already exists.
    pub fn add(&mut self, path: &str, node: TreeNode) -> Result<(), TreeError> {
        let new_id = self.push_node(node);
        let full_path = path.to_string();
        self.rebuild_path(path, move |children, name| {
            if children.contains_key(name) {
                return Err(TreeError::AlreadyExists(full_path.clone()));
            }
            children.insert(name.to_string(), new_id);
            Ok(())
        })?;
        self.touched.push((path.to_string(), PathChange::Added));
        Ok(())
    }

    /// Deletes the node at `path`, returning the removed node (and thus its
    /// subtree, reachable via shared child ids) for diff emission.
    pub fn delete(&mut self, path: &str) -> Result<TreeNode, TreeError> {
        let removed_id = self.get_building(path)?;
        let removed = self.node(removed_id).clone_shallow();
        let full_path = path.to_string();
        self.rebuild_path(path, move |children, name| {
            if children.remove(name).is_none() {
                return Err(TreeError::NotFound(full_path.clone()));
            }
            Ok(())
        })?;
        self.touched.push((path.to_string(), PathChange::Deleted));
        Ok(removed)
    }

    /// Replaces the node at `path` in place (content and/or props change).
    /// Fails if the path is absent or the replacement's kind differs from
    /// the existing node's kind.
    pub fn change(&mut self, path: &str, node: TreeNode) -> Result<(), TreeError> {
        let existing_id = self.get_building(path)?;
        if self.node(existing_id).kind() != node.kind() {
            return Err(TreeError::KindMismatch(path.to_string()));
        }
        let new_id = self.push_node(node);
        let full_path = path.to_string();
        self.rebuild_path(path, move |children, name| {
            if !children.contains_key(name) {
                return Err(TreeError::NotFound(full_path.clone()));
            }
            children.insert(name.to_string(), new_id);
            Ok(())
        })?;
        self.touched.push((path.to_string(), PathChange::Modified));
        Ok(())
    }

    /// O(1) structural copy: installs a reference to the historical subtree
    /// at `(src_rev, src_path)` as `dst_path`. No bytes are duplicated —
    /// `dst_path`'s new parent entry simply points at the same `NodeId`
    /// (and, transitively, the same children) as the historical subtree.
    pub fn copy(&mut self, src_path: &str, src_rev: Revnum, dst_path: &str) -> Result<(), TreeError> {
        let src_id = self
            .get(src_rev, src_path)
            .map_err(|_| TreeError::CopySourceMissing {
                src_path: src_path.to_string(),
                src_rev,
            })?;
        let full_path = dst_path.to_string();
        self.rebuild_path(dst_path, move |children, name| {
            if children.contains_key(name) {
                return Err(TreeError::AlreadyExists(full_path.clone()));
            }
            children.insert(name.to_string(), src_id);
            Ok(())
        })?;
        self.touched.push((dst_path.to_string(), PathChange::Added));
        Ok(())
    }

    /// Closes the snapshot under construction, making it immutable and
    /// addressable by revision number.
    pub fn close_revision(&mut self) -> Result<Snapshot, TreeError> {
        let (rev, root) = self
            .building
            .take()
            .ok_or(TreeError::RevisionNotClosed(0))?;
        let snapshot = Snapshot { rev, root };
        self.snapshots.insert(rev, snapshot.clone());
        Ok(snapshot)
    }

    /// Returns the touched paths recorded since `begin_revision`, in the
    /// order operations were applied — used by the history builder instead
    /// of a full tree compare.
    pub fn touched_paths(&self) -> &[(String, PathChange)] {
        &self.touched
    }

    pub fn node_kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    pub fn node_ref(&self, id: NodeId) -> &TreeNode {
        self.node(id)
    }

    /// Recursively lists every file beneath `id`, as `(relative-path,
    /// NodeId)` pairs in directory-sorted order — used by the object
    /// pipeline integration to walk a branch's subtree into blob writes
    /// without a full tree compare.
    pub fn walk_files(&self, id: NodeId) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        self.walk_files_into(id, String::new(), &mut out);
        out
    }

    /// Recursively lists every directory beneath (and including) `id`
    /// carrying a `svn:gitignore` property, as `(relative-dir-path, bytes)`
    /// — the raw material for the `.gitignore`-conversion overlay step.
    pub fn walk_gitignore_props(&self, id: NodeId) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        self.walk_gitignore_into(id, String::new(), &mut out);
        out
    }

    fn walk_gitignore_into(&self, id: NodeId, prefix: String, out: &mut Vec<(String, Vec<u8>)>) {
        if let TreeNode::Dir { children, props } = self.node(id) {
            if let Some(bytes) = props.get("svn:gitignore") {
                out.push((prefix.clone(), bytes.clone()));
            }
            for (name, child_id) in children {
                let child_path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                self.walk_gitignore_into(*child_id, child_path, out);
            }
        }
    }

    fn walk_files_into(&self, id: NodeId, prefix: String, out: &mut Vec<(String, NodeId)>) {
        match self.node(id) {
            TreeNode::File { .. } => out.push((prefix, id)),
            TreeNode::Dir { children, .. } => {
                for (name, child_id) in children {
                    let child_path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}/{name}")
                    };
                    self.walk_files_into(*child_id, child_path, out);
                }
            }
        }
    }

    /// Resolves a (possibly still-pending-delta) [`ContentRef`] to raw
    /// bytes, applying any svndiff0 delta chain against its source.
    pub fn materialize(&self, content: &ContentRef) -> Result<Vec<u8>, TreeError> {
        match content {
            ContentRef::Bytes(bytes) => Ok(bytes.clone()),
            ContentRef::Delta { source, delta_bytes } => {
                let source_bytes = self.materialize(source)?;
                Ok(crate::delta::apply(&source_bytes, delta_bytes)?)
            }
        }
    }
}

impl Default for PathTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeNode {
    /// A cheap clone that shares content/children by reference semantics of
    /// the arena (children map still holds `NodeId`s, so cloning it does not
    /// duplicate any subtree).
    fn clone_shallow(&self) -> TreeNode {
        self.clone()
    }
}

/// A content handle wrapping raw bytes directly, with no pending delta.
pub fn content_bytes(bytes: Vec<u8>) -> ContentRef {
    ContentRef::Bytes(bytes)
}
