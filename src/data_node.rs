// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The hierarchical data-node tree: a key -> Message database with
//! ordered-child indices and per-node subscriber reference counts. See
//! spec §3 ("Data node") and §4.6.
//!
//! Ownership is modeled as a slab (`Vec<Option<DataNode>>`) rather than
//! `Rc`/`RefCell` back-pointers, per the design notes on severing
//! parent/child cycles: a `NodeId` is just an index, naturally invalidated
//! when its slot is freed.
//!
//! Subscriber tables here are plain per-node `HashMap`s rather than the
//! hash-consed, structurally-shared pool the spec allows (§4.6,
//! "Subscribers-table sharing... the implementation MAY intern"); this
//! crate takes the simpler O(|subscribers|) representation and leaves the
//! optional sharing optimization undone (see DESIGN.md).

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{malformed, resource_exhausted, MuscleResult};
use crate::message::Message;
use crate::path::{self, path_clauses, QueryFilter};
use crate::session::SessionId;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, Default)]
pub struct SetDataNodeFlags {
    /// Skip building an "old data" notification; the caller already knows
    /// this is a fresh node.
    pub is_being_created: bool,
    /// Allow this update to coalesce with an earlier still-pending update
    /// to the same node within the same notification batch.
    pub enable_supercede: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// One entry in the tree's outgoing change log, consumed by the
/// storage-reflect layer to build `PR_RESULT_DATAITEMS` notifications.
#[derive(Debug, Clone)]
pub struct NodeChange {
    pub node: NodeId,
    pub path: String,
    pub kind: ChangeKind,
    pub payload: Option<Rc<Message>>,
    pub subscribers: Vec<SessionId>,
}

#[derive(Debug, Clone)]
pub enum IndexOp {
    Inserted { position: usize, name: String },
    Removed { position: usize, name: String },
    Cleared,
}

/// One entry in the tree's outgoing index-change log, consumed to build
/// `PR_RESULT_INDEXUPDATED` notifications.
#[derive(Debug, Clone)]
pub struct IndexChange {
    pub parent: NodeId,
    pub parent_path: String,
    pub op: IndexOp,
    pub subscribers: Vec<SessionId>,
}

pub struct DataNode {
    name: String,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    ordered_index: Option<Vec<NodeId>>,
    payload: Option<Rc<Message>>,
    subscribers: HashMap<SessionId, u32>,
    depth: u32,
}

impl DataNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn payload(&self) -> Option<&Rc<Message>> {
        self.payload.as_ref()
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(n, &id)| (n.as_str(), id))
    }

    pub fn ordered_index(&self) -> Option<&[NodeId]> {
        self.ordered_index.as_deref()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, session: SessionId) -> bool {
        self.subscribers.contains_key(&session)
    }
}

/// The hierarchical key/value database. Node 0 is always the root.
pub struct DataNodeTree {
    nodes: Vec<Option<DataNode>>,
    root: NodeId,
    max_depth: u32,
    max_children_per_node: u32,
    insert_counter: u32,
    changes: Vec<NodeChange>,
    index_changes: Vec<IndexChange>,
}

impl DataNodeTree {
    pub fn new(max_depth: u32, max_children_per_node: u32) -> DataNodeTree {
        let root = DataNode {
            name: String::new(),
            parent: None,
            children: HashMap::new(),
            ordered_index: None,
            payload: None,
            subscribers: HashMap::new(),
            depth: 0,
        };
        DataNodeTree {
            nodes: vec![Some(root)],
            root: 0,
            max_depth,
            max_children_per_node,
            insert_counter: 0,
            changes: Vec::new(),
            index_changes: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &DataNode {
        self.nodes[id].as_ref().expect("dangling NodeId")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut DataNode {
        self.nodes[id].as_mut().expect("dangling NodeId")
    }

    pub fn node_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            parts.push(self.node(current).name.clone());
            current = parent;
        }
        parts.reverse();
        parts.join("/")
    }

    pub fn take_pending_changes(&mut self) -> Vec<NodeChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn take_pending_index_changes(&mut self) -> Vec<IndexChange> {
        std::mem::take(&mut self.index_changes)
    }

    // --- subscribers -------------------------------------------------

    pub fn add_subscriber(&mut self, node: NodeId, session: SessionId) {
        *self.node_mut(node).subscribers.entry(session).or_insert(0) += 1;
    }

    pub fn remove_subscriber(&mut self, node: NodeId, session: SessionId) {
        let n = self.node_mut(node);
        if let Some(count) = n.subscribers.get_mut(&session) {
            *count -= 1;
            if *count == 0 {
                n.subscribers.remove(&session);
            }
        }
    }

    /// Drops every subscriber entry for `session` across the whole tree,
    /// e.g. when a session detaches.
    pub fn remove_subscriber_everywhere(&mut self, session: SessionId) {
        for slot in self.nodes.iter_mut().flatten() {
            slot.subscribers.remove(&session);
        }
    }

    fn subscribers_of(&self, node: NodeId) -> Vec<SessionId> {
        self.node(node).subscribers.keys().copied().collect()
    }

    // --- traversal / matching -----------------------------------------

    /// Walks the tree, descending one clause per level, and returns every
    /// existing node whose path matches `pattern`. Literal clauses use the
    /// O(1) child map; glob/regex clauses scan all children at that level.
    pub fn find_matching_node_ids(&self, pattern: &str, filter: Option<&QueryFilter>) -> Vec<NodeId> {
        let clauses = path_clauses(pattern);
        let mut frontier = vec![self.root];

        for clause in &clauses {
            let mut next = Vec::new();
            for &node in &frontier {
                if path::can_wildcard_string_match_multiple_values(clause) {
                    for (name, child) in self.node(node).children() {
                        if path::clause_matches(clause, name) {
                            next.push(child);
                        }
                    }
                } else if let Some(child) = self.node(node).child(clause) {
                    next.push(child);
                }
            }
            frontier = next;
        }

        frontier
            .into_iter()
            .filter(|&id| match filter {
                Some(f) => self.node(id).payload.as_deref().map(|m| f(m)).unwrap_or(false),
                None => true,
            })
            .collect()
    }

    /// Resolves a single literal (non-wildcard) path to an existing node,
    /// if any part along the way is missing returns `None`.
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for clause in path_clauses(path) {
            current = self.node(current).child(clause)?;
        }
        Some(current)
    }

    // --- mutation -------------------------------------------------------

    /// Creates or overwrites the node at `path` (every clause must be a
    /// literal name; wildcards are only meaningful for reads/removals).
    pub fn set_data_node(
        &mut self,
        path: &str,
        payload: Rc<Message>,
        flags: SetDataNodeFlags,
        max_nodes_remaining: Option<u32>,
    ) -> MuscleResult<NodeId> {
        let clauses = path_clauses(path);
        if clauses.iter().any(|c| path::can_wildcard_string_match_multiple_values(c)) {
            return Err(malformed("SetDataNode path must not contain wildcards"));
        }
        if clauses.len() as u32 > self.max_depth {
            return Err(resource_exhausted("path exceeds configured max node depth"));
        }

        let mut current = self.root;
        for (i, clause) in clauses.iter().enumerate() {
            if let Some(child) = self.node(current).child(clause) {
                current = child;
                continue;
            }
            let is_last = i == clauses.len() - 1;
            if !is_last {
                current = self.create_child(current, clause, None)?;
                continue;
            }
            if max_nodes_remaining == Some(0) {
                return Err(resource_exhausted("session has reached its max-nodes-per-session limit"));
            }
            current = self.create_child(current, clause, None)?;
        }

        let was_created = self.node(current).payload.is_none();
        self.node_mut(current).payload = Some(payload.clone());

        let kind = if was_created || flags.is_being_created { ChangeKind::Created } else { ChangeKind::Updated };
        self.record_change(current, kind, Some(payload));
        Ok(current)
    }

    /// Removes every node matching `pattern` (and its subtree). Returns
    /// the list of removed paths.
    pub fn remove_data_nodes(
        &mut self,
        pattern: &str,
        filter: Option<&QueryFilter>,
        quiet: bool,
    ) -> MuscleResult<Vec<String>> {
        let matches = self.find_matching_node_ids(pattern, filter);
        let mut removed_paths = Vec::new();
        for node in matches {
            if self.nodes[node].is_none() {
                continue; // already removed as part of an ancestor's subtree
            }
            removed_paths.extend(self.remove_subtree(node, quiet));
        }
        Ok(removed_paths)
    }

    fn remove_subtree(&mut self, node: NodeId, quiet: bool) -> Vec<String> {
        let children: Vec<NodeId> = self.node(node).children().map(|(_, id)| id).collect();
        let mut removed = Vec::new();
        for child in children {
            removed.extend(self.remove_subtree(child, quiet));
        }

        let path = self.node_path(node);
        if !quiet {
            self.record_change(node, ChangeKind::Removed, None);
        }

        if let Some(parent) = self.node(node).parent {
            let name = self.node(node).name.clone();
            self.node_mut(parent).children.remove(&name);
            if let Some(idx) = &mut self.node_mut(parent).ordered_index {
                if let Some(pos) = idx.iter().position(|&n| n == node) {
                    idx.remove(pos);
                    let subs = self.subscribers_of(parent);
                    let parent_path = self.node_path(parent);
                    self.index_changes.push(IndexChange {
                        parent,
                        parent_path,
                        op: IndexOp::Removed { position: pos, name },
                        subscribers: subs,
                    });
                }
            }
        }

        self.nodes[node] = None;
        removed.push(path);
        removed
    }

    fn create_child(&mut self, parent: NodeId, name: &str, _insert_before: Option<&str>) -> MuscleResult<NodeId> {
        if self.node(parent).children.len() as u32 >= self.max_children_per_node {
            return Err(resource_exhausted("parent node has reached its max-children limit"));
        }
        let depth = self.node(parent).depth + 1;
        if depth > self.max_depth {
            return Err(resource_exhausted("path exceeds configured max node depth"));
        }
        let id = self.nodes.len();
        self.nodes.push(Some(DataNode {
            name: name.to_owned(),
            parent: Some(parent),
            children: HashMap::new(),
            ordered_index: None,
            payload: None,
            subscribers: HashMap::new(),
            depth,
        }));
        self.node_mut(parent).children.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Appends or inserts `payload` as a new ordered child of `parent`.
    /// Falls back to an auto-generated `"I<counter>"` name on collision
    /// (or when no name was supplied).
    pub fn insert_ordered_child(
        &mut self,
        parent: NodeId,
        payload: Rc<Message>,
        insert_before: Option<&str>,
        name: Option<&str>,
    ) -> MuscleResult<(NodeId, String)> {
        let chosen_name = match name {
            Some(n) if self.node(parent).child(n).is_none() => n.to_owned(),
            _ => loop {
                let candidate = format!("I{}", self.insert_counter);
                self.insert_counter = self.insert_counter.wrapping_add(1);
                if self.node(parent).child(&candidate).is_none() {
                    break candidate;
                }
            },
        };

        let id = self.create_child(parent, &chosen_name, None)?;
        self.node_mut(id).payload = Some(payload);

        let index = self.node_mut(parent).ordered_index.get_or_insert_with(Vec::new);
        let position = match insert_before {
            Some(before) => {
                let idx = &self.nodes;
                index
                    .iter()
                    .position(|&n| idx[n].as_ref().map(|d| d.name.as_str()) == Some(before))
                    .unwrap_or(index.len())
            }
            None => index.len(),
        };
        index.insert(position, id);

        let subs = self.subscribers_of(parent);
        let parent_path = self.node_path(parent);
        self.index_changes.push(IndexChange {
            parent,
            parent_path,
            op: IndexOp::Inserted { position, name: chosen_name.clone() },
            subscribers: subs,
        });

        Ok((id, chosen_name))
    }

    /// Atomically removes then reinserts `child` within `parent`'s
    /// ordered-index, at the position just before `move_before` (or at the
    /// tail if `None`).
    pub fn reorder_child(&mut self, parent: NodeId, child: NodeId, move_before: Option<&str>) -> MuscleResult<usize> {
        let name = self.node(child).name.clone();
        let old_pos = {
            let idx = self.node_mut(parent).ordered_index.get_or_insert_with(Vec::new);
            match idx.iter().position(|&n| n == child) {
                Some(p) => {
                    idx.remove(p);
                    p
                }
                None => return Err(malformed("child is not part of the parent's ordered index")),
            }
        };

        let new_pos = {
            let idx = self.node(parent).ordered_index.as_ref().unwrap();
            match move_before {
                Some(before) => idx
                    .iter()
                    .position(|&n| self.node(n).name == before)
                    .unwrap_or(idx.len()),
                None => idx.len(),
            }
        };
        self.node_mut(parent).ordered_index.as_mut().unwrap().insert(new_pos, child);

        let subs = self.subscribers_of(parent);
        let parent_path = self.node_path(parent);
        self.index_changes.push(IndexChange {
            parent,
            parent_path: parent_path.clone(),
            op: IndexOp::Removed { position: old_pos, name: name.clone() },
            subscribers: subs.clone(),
        });
        self.index_changes.push(IndexChange {
            parent,
            parent_path,
            op: IndexOp::Inserted { position: new_pos, name },
            subscribers: subs,
        });

        Ok(new_pos)
    }

    /// Bulk reorder: every existing child of `parent` whose name matches
    /// `pattern`'s final clause is moved, in order, to just before
    /// `before`.
    pub fn move_index_entries(
        &mut self,
        parent: NodeId,
        pattern: &str,
        before: Option<&str>,
        filter: Option<&QueryFilter>,
    ) -> MuscleResult<()> {
        let last_clause = path_clauses(pattern).last().copied().unwrap_or("*").to_owned();
        let candidates: Vec<NodeId> = self
            .node(parent)
            .children()
            .filter(|(name, _)| path::clause_matches(&last_clause, name))
            .filter(|(_, id)| match filter {
                Some(f) => self.node(*id).payload.as_deref().map(|m| f(m)).unwrap_or(false),
                None => true,
            })
            .map(|(_, id)| id)
            .collect();

        for child in candidates {
            self.reorder_child(parent, child, before)?;
        }
        Ok(())
    }

    // --- snapshotting -----------------------------------------------------

    /// Serializes the subtree rooted at `node` into a Message: a `name`
    /// field, an optional `payload` sub-message, and a `children` field
    /// holding one sub-message per child that passes `pruner`.
    pub fn save_node_tree_to_message(&self, node: NodeId, pruner: Option<&dyn Fn(&DataNode) -> bool>) -> Message {
        let data = self.node(node);
        let mut out = Message::new(0);
        out.add_string("name", data.name.clone());
        if let Some(payload) = &data.payload {
            out.add_message("payload", payload.clone());
        }
        for (_, child_id) in data.children() {
            let child = self.node(child_id);
            if pruner.map(|p| p(child)).unwrap_or(true) {
                out.add_message("children", Rc::new(self.save_node_tree_to_message(child_id, pruner)));
            }
        }
        out
    }

    /// Inverse of [`save_node_tree_to_message`]: recreates the subtree
    /// under `parent`, returning the new root node's id.
    pub fn restore_node_tree_from_message(&mut self, parent: NodeId, msg: &Message) -> MuscleResult<NodeId> {
        let name = msg
            .find_string("name", 0)
            .ok_or_else(|| malformed("snapshot node is missing its name field"))?
            .to_owned();
        let node = self.create_child(parent, &name, None)?;
        if let Some(payload) = msg.find_message("payload", 0) {
            self.node_mut(node).payload = Some(payload.clone());
        }
        if let crate::message::Field::Message(children) = msg.field("children").cloned().unwrap_or(crate::message::Field::Message(Vec::new())) {
            for child_msg in children {
                self.restore_node_tree_from_message(node, &child_msg)?;
            }
        }
        Ok(node)
    }

    /// Deep-copies the subtree at `src` to a new child of `dest_parent`
    /// named `dest_name`.
    pub fn clone_data_node_subtree(
        &mut self,
        src: NodeId,
        dest_parent: NodeId,
        dest_name: &str,
        pruner: Option<&dyn Fn(&DataNode) -> bool>,
    ) -> MuscleResult<NodeId> {
        let snapshot = self.save_node_tree_to_message(src, pruner);
        let mut renamed = snapshot;
        renamed.set_field("name", crate::message::Field::String(vec![dest_name.to_owned()]));
        self.restore_node_tree_from_message(dest_parent, &renamed)
    }

    fn record_change(&mut self, node: NodeId, kind: ChangeKind, payload: Option<Rc<Message>>) {
        let path = self.node_path(node);
        let subscribers = self.subscribers_of(node);
        self.changes.push(NodeChange { node, path, kind, payload, subscribers });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn tree() -> DataNodeTree {
        DataNodeTree::new(100, u32::MAX)
    }

    #[test]
    fn set_data_node_creates_intermediate_nodes() {
        let mut t = tree();
        let id = t.set_data_node("a/b/c", Rc::new(Message::new(1)), SetDataNodeFlags::default(), None).unwrap();
        assert_eq!(t.node_path(id), "a/b/c");
        assert_eq!(t.node(id).depth(), 3);
    }

    #[test]
    fn overwrite_reports_updated_not_created() {
        let mut t = tree();
        t.set_data_node("foo", Rc::new(Message::new(1)), SetDataNodeFlags::default(), None).unwrap();
        t.take_pending_changes();
        t.set_data_node("foo", Rc::new(Message::new(2)), SetDataNodeFlags::default(), None).unwrap();
        let changes = t.take_pending_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Updated);
    }

    #[test]
    fn wildcard_pattern_matches_multiple_siblings() {
        let mut t = tree();
        t.set_data_node("foo/hello", Rc::new(Message::new(1)), SetDataNodeFlags::default(), None).unwrap();
        t.set_data_node("foo/world", Rc::new(Message::new(1)), SetDataNodeFlags::default(), None).unwrap();
        let matches = t.find_matching_node_ids("foo/*", None);
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn remove_data_nodes_drops_subtree_and_reports_paths() {
        let mut t = tree();
        t.set_data_node("foo/hello", Rc::new(Message::new(1)), SetDataNodeFlags::default(), None).unwrap();
        t.take_pending_changes();
        let removed = t.remove_data_nodes("foo/h*", None, false).unwrap();
        assert_eq!(removed, vec!["foo/hello".to_owned()]);
        assert!(t.resolve("foo/hello").is_none());
    }

    #[test]
    fn subscriber_refcounts_are_added_and_removed() {
        let mut t = tree();
        let node = t.set_data_node("foo", Rc::new(Message::new(1)), SetDataNodeFlags::default(), None).unwrap();
        let s = SessionId(1);
        t.add_subscriber(node, s);
        t.add_subscriber(node, s);
        assert!(t.node(node).has_subscriber(s));
        t.remove_subscriber(node, s);
        assert!(t.node(node).has_subscriber(s));
        t.remove_subscriber(node, s);
        assert!(!t.node(node).has_subscriber(s));
    }

    #[test]
    fn insert_ordered_child_auto_generates_name_on_collision() {
        let mut t = tree();
        let root = t.root();
        let (_, name1) = t.insert_ordered_child(root, Rc::new(Message::new(0)), None, Some("I0")).unwrap();
        let (_, name2) = t.insert_ordered_child(root, Rc::new(Message::new(0)), None, Some("I0")).unwrap();
        assert_eq!(name1, "I0");
        assert_ne!(name2, "I0");
    }

    #[test]
    fn insert_ordered_child_respects_insert_before() {
        let mut t = tree();
        let root = t.root();
        let (first, _) = t.insert_ordered_child(root, Rc::new(Message::new(0)), None, Some("first")).unwrap();
        let (second, _) = t.insert_ordered_child(root, Rc::new(Message::new(0)), Some("first"), Some("second")).unwrap();
        let order = t.node(root).ordered_index().unwrap().to_vec();
        assert_eq!(order, vec![second, first]);
    }

    #[test]
    fn clone_subtree_copies_payload_and_children() {
        let mut t = tree();
        t.set_data_node("src/child", Rc::new(Message::new(42)), SetDataNodeFlags::default(), None).unwrap();
        let src = t.resolve("src").unwrap();
        let root = t.root();
        let cloned = t.clone_data_node_subtree(src, root, "dst", None).unwrap();
        assert_eq!(t.node_path(cloned), "dst");
        let child = t.resolve("dst/child").unwrap();
        assert_eq!(t.node(child).payload().unwrap().what, 42);
    }

    #[test]
    fn depth_cap_rejects_overly_deep_paths() {
        let mut t = DataNodeTree::new(2, u32::MAX);
        assert!(t.set_data_node("a/b/c", Rc::new(Message::new(0)), SetDataNodeFlags::default(), None).is_err());
    }
}
