use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::LogicalClock;
use crate::delta::{Delta, DeltaOp};
use crate::error::{TypeError, TypeResult};
use crate::graph::{map_key_matches, tags, Fragment, Graph, Node, NodeData};
use crate::id::RecordId;
use crate::path::{display_path, PathSeg};
use crate::value::{NodeId, Scalar, Value};

/// Mutation-tracked instance of one record.
///
/// The root is a `reactive.object` node carrying the record id. Mutations
/// (`set`, `insert`, `delete`) change the graph and queue a [`Delta`];
/// [`apply`](Self::apply) replays a delta without queueing it. Queued deltas
/// are collected with [`drain_changes`](Self::drain_changes).
///
/// Replaced and removed values stay in the arena until it has doubled since
/// the last compaction, then unreachable nodes are dropped.
#[derive(Debug)]
pub struct Document {
    id: RecordId,
    graph: Graph,
    root: NodeId,
    deleted: bool,
    clock: LogicalClock,
    changes: Vec<Delta>,
    /// Arena size right after the last compaction.
    compacted_len: usize,
}

const MIN_COMPACT_LEN: usize = 64;

impl Document {
    /// Empty shell keyed by `id`.
    pub fn new(id: RecordId) -> Self {
        let mut graph = Graph::new();
        let root = graph.alloc(
            Node::new(tags::REACTIVE_OBJECT, NodeData::Object(Vec::new())).with_id(id.as_str()),
        );
        Self {
            id,
            graph,
            root,
            deleted: false,
            clock: LogicalClock::new(),
            changes: Vec::new(),
            compacted_len: 1,
        }
    }

    /// Adopt a decoded snapshot. The root must be an object-shaped node.
    pub fn from_fragment(id: RecordId, fragment: Fragment) -> TypeResult<Self> {
        let root = fragment.value.as_node().ok_or(TypeError::InvalidRoot)?;
        match fragment.graph.get(root).map(|n| &n.data) {
            Some(NodeData::Object(_)) => {}
            _ => return Err(TypeError::InvalidRoot),
        }
        let compacted_len = fragment.graph.len();
        Ok(Self {
            id,
            graph: fragment.graph,
            root,
            deleted: false,
            clock: LogicalClock::new(),
            changes: Vec::new(),
            compacted_len,
        })
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn root(&self) -> Value {
        Value::Node(self.root)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn get(&self, path: &[PathSeg]) -> Option<&Value> {
        let root = self.graph.get(self.root)?;
        let (first, rest) = match path.split_first() {
            Some(split) => split,
            None => return None,
        };
        let start = match (&root.data, first) {
            (NodeData::Object(fields), PathSeg::Key(k)) => {
                fields.iter().find(|(name, _)| name.as_ref() == k).map(|(_, v)| v)?
            }
            _ => return None,
        };
        self.graph.resolve(start, rest)
    }

    pub fn get_scalar(&self, path: &[PathSeg]) -> Option<Scalar> {
        self.get(path).and_then(Value::scalar)
    }

    /// JSON rendering of the whole record.
    pub fn to_json(&self) -> TypeResult<serde_json::Value> {
        self.graph.to_json(&self.root())
    }

    /// Set the value at `path`, queueing a Modify (or an Insert when the
    /// key or index does not exist yet).
    pub fn set(&mut self, path: &[PathSeg], value: impl Into<Fragment>) -> TypeResult<()> {
        let op = if self.get(path).is_some() {
            DeltaOp::Modify
        } else {
            DeltaOp::Insert
        };
        self.record(op, path, Some(value.into()))
    }

    /// Insert at `path`. On arrays this shifts later elements right; on
    /// objects and maps it behaves like `set`.
    pub fn insert(&mut self, path: &[PathSeg], value: impl Into<Fragment>) -> TypeResult<()> {
        self.record(DeltaOp::Insert, path, Some(value.into()))
    }

    /// Remove the value at `path`. The empty path deletes the record.
    pub fn delete(&mut self, path: &[PathSeg]) -> TypeResult<()> {
        self.record(DeltaOp::Delete, path, None)
    }

    /// Logically delete the whole record.
    pub fn mark_deleted(&mut self) -> TypeResult<()> {
        self.delete(&[])
    }

    fn record(
        &mut self,
        op: DeltaOp,
        path: &[PathSeg],
        value: Option<Fragment>,
    ) -> TypeResult<()> {
        self.apply_op(op, path, value.as_ref())?;
        let delta = Delta {
            target: self.id.clone(),
            op,
            path: path.to_vec(),
            value,
            time: self.clock.now(),
        };
        self.changes.push(delta);
        Ok(())
    }

    /// Replay a delta without queueing it.
    pub fn apply(&mut self, delta: &Delta) -> TypeResult<()> {
        if delta.target != self.id {
            return Err(TypeError::WrongTarget {
                expected: self.id.to_string(),
                actual: delta.target.to_string(),
            });
        }
        self.apply_op(delta.op, &delta.path, delta.value.as_ref())?;
        self.clock.observe(&delta.time);
        Ok(())
    }

    /// Replay a batch atomically: on error the document is left exactly as
    /// it was before the call.
    pub fn apply_batch(&mut self, deltas: &[Delta]) -> TypeResult<()> {
        let (graph, root, deleted, compacted_len) =
            (self.graph.clone(), self.root, self.deleted, self.compacted_len);
        for delta in deltas {
            if let Err(e) = self.apply(delta) {
                self.graph = graph;
                self.root = root;
                self.deleted = deleted;
                self.compacted_len = compacted_len;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop arena nodes no longer reachable from the root. Returns how many
    /// were freed.
    pub fn compact(&mut self) -> usize {
        let before = self.graph.len();
        let root = self.root();
        let root = self.graph.compact(&root);
        if let Some(id) = root.as_node() {
            self.root = id;
        }
        self.compacted_len = self.graph.len();
        before - self.compacted_len
    }

    fn maybe_compact(&mut self) {
        if self.graph.len() > (2 * self.compacted_len).max(MIN_COMPACT_LEN) {
            self.compact();
        }
    }

    pub fn drain_changes(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    fn apply_op(&mut self, op: DeltaOp, path: &[PathSeg], value: Option<&Fragment>) -> TypeResult<()> {
        let Some((last, parent_path)) = path.split_last() else {
            return match op {
                DeltaOp::Delete => {
                    self.deleted = true;
                    Ok(())
                }
                _ => Err(TypeError::InvalidDelta("only delete may target the root".into())),
            };
        };
        let parent = self.graph.resolve_node(self.root, parent_path)?;
        let new_value = match (op, value) {
            (DeltaOp::Delete, _) => Value::Null,
            (_, Some(fragment)) => self.graph.absorb(fragment),
            (_, None) => {
                return Err(TypeError::InvalidDelta(format!(
                    "{op:?} at {} carries no value",
                    display_path(path)
                )))
            }
        };
        let where_ = || display_path(path);
        let node = self
            .graph
            .get_mut(parent)
            .ok_or(TypeError::DanglingNode(parent.index()))?;

        match (&mut node.data, last) {
            (NodeData::Object(fields), PathSeg::Key(key)) => {
                let pos = fields.iter().position(|(k, _)| k.as_ref() == key);
                match (op, pos) {
                    (DeltaOp::Delete, Some(i)) => {
                        fields.remove(i);
                    }
                    (DeltaOp::Delete, None) => return Err(TypeError::PathNotFound(where_())),
                    (_, Some(i)) => fields[i].1 = new_value,
                    (_, None) => fields.push((Arc::from(key.as_str()), new_value)),
                }
            }
            (NodeData::Array(items), PathSeg::Index(index)) => {
                let (index, len) = (*index, items.len());
                match op {
                    DeltaOp::Insert if index <= len => items.insert(index, new_value),
                    DeltaOp::Modify if index < len => items[index] = new_value,
                    DeltaOp::Delete if index < len => {
                        items.remove(index);
                    }
                    _ => {
                        return Err(TypeError::OutOfBounds {
                            path: where_(),
                            index,
                            len,
                        })
                    }
                }
            }
            (NodeData::Map(entries), seg) => {
                let pos = entries.iter().position(|(k, _)| map_key_matches(k, seg));
                match (op, pos) {
                    (DeltaOp::Delete, Some(i)) => {
                        entries.remove(i);
                    }
                    (DeltaOp::Delete, None) => return Err(TypeError::PathNotFound(where_())),
                    (_, Some(i)) => entries[i].1 = new_value,
                    (_, None) => {
                        let key = match seg {
                            PathSeg::Key(k) => Value::str(k),
                            PathSeg::Index(i) => Value::Int(*i as i64),
                        };
                        entries.push((key, new_value));
                    }
                }
            }
            (NodeData::Fields(items), PathSeg::Index(index)) => {
                let len = items.len();
                let slot = items.get_mut(*index).ok_or(TypeError::OutOfBounds {
                    path: where_(),
                    index: *index,
                    len,
                })?;
                *slot = new_value;
            }
            (NodeData::Object(_), PathSeg::Index(_)) => {
                return Err(TypeError::TypeMismatch {
                    path: where_(),
                    expected: "array",
                })
            }
            _ => {
                return Err(TypeError::TypeMismatch {
                    path: where_(),
                    expected: "object",
                })
            }
        }
        self.maybe_compact();
        Ok(())
    }

    /// Every scalar leaf reachable from the root with its key path.
    ///
    /// Array and set elements inherit the path of their container, so a
    /// leaf inside `tags: ["a", "b"]` is reported twice under `["tags"]`.
    /// Shared nodes are visited once.
    pub fn scalars(&self) -> Vec<(Vec<Arc<str>>, Scalar)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(Vec<Arc<str>>, Value)> = vec![(Vec::new(), self.root())];
        while let Some((path, value)) = stack.pop() {
            let id = match value {
                Value::Node(id) => id,
                primitive => {
                    if let (false, Some(s)) = (path.is_empty(), primitive.scalar()) {
                        out.push((path, s));
                    }
                    continue;
                }
            };
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.graph.get(id) else {
                continue;
            };
            match &node.data {
                NodeData::Object(fields) => {
                    for (k, v) in fields.iter().rev() {
                        let mut p = path.clone();
                        p.push(k.clone());
                        stack.push((p, v.clone()));
                    }
                }
                NodeData::Array(items) | NodeData::Set(items) => {
                    for v in items.iter().rev() {
                        stack.push((path.clone(), v.clone()));
                    }
                }
                NodeData::Map(entries) => {
                    for (k, v) in entries.iter().rev() {
                        if let Value::Str(k) = k {
                            let mut p = path.clone();
                            p.push(k.clone());
                            stack.push((p, v.clone()));
                        }
                    }
                }
                NodeData::Fields(_) | NodeData::Pending => {}
            }
        }
        out
    }
}

impl Clone for Document {
    fn clone(&self) -> Self {
        let clock = LogicalClock::new();
        clock.observe(&self.clock.last());
        Self {
            id: self.id.clone(),
            graph: self.graph.clone(),
            root: self.root,
            deleted: self.deleted,
            clock,
            changes: self.changes.clone(),
            compacted_len: self.compacted_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::path::parse_path;

    fn doc() -> Document {
        Document::new(RecordId::from("rec-1"))
    }

    #[test]
    fn new_document_is_keyed_shell() {
        let d = doc();
        let root = &d.graph()[d.root().as_node().unwrap()];
        assert_eq!(root.tag.as_ref(), tags::REACTIVE_OBJECT);
        assert_eq!(root.id.as_deref(), Some("rec-1"));
        assert_eq!(d.to_json().unwrap(), json!({}));
    }

    #[test]
    fn set_queues_insert_then_modify() {
        let mut d = doc();
        d.set(&parse_path("name"), "ada").unwrap();
        d.set(&parse_path("name"), "bob").unwrap();
        let changes = d.drain_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].op, DeltaOp::Insert);
        assert_eq!(changes[1].op, DeltaOp::Modify);
        assert!(changes[1].time > changes[0].time);
        assert!(!d.has_changes());
        assert_eq!(d.get_scalar(&parse_path("name")), Some(Scalar::from("bob")));
    }

    #[test]
    fn array_insert_and_delete_shift() {
        let mut d = doc();
        d.set(&parse_path("xs"), json!([1, 3])).unwrap();
        d.insert(&parse_path("xs.1"), 2).unwrap();
        assert_eq!(d.to_json().unwrap(), json!({"xs": [1, 2, 3]}));
        d.delete(&parse_path("xs.0")).unwrap();
        assert_eq!(d.to_json().unwrap(), json!({"xs": [2, 3]}));
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut d = doc();
        d.set(&parse_path("xs"), json!([])).unwrap();
        let err = d.set(&parse_path("xs.3"), 1).unwrap_err();
        assert!(matches!(err, TypeError::OutOfBounds { index: 3, .. }));
    }

    #[test]
    fn replaying_changes_reproduces_state() {
        let mut d = doc();
        d.set(&parse_path("a"), json!({"b": [1, 2]})).unwrap();
        d.insert(&parse_path("a.b.2"), 3).unwrap();
        d.delete(&parse_path("a.b.0")).unwrap();
        d.set(&parse_path("c"), "x").unwrap();
        let changes = d.drain_changes();

        let mut replica = doc();
        for delta in &changes {
            replica.apply(delta).unwrap();
        }
        assert!(!replica.has_changes());
        assert_eq!(replica.to_json().unwrap(), d.to_json().unwrap());
    }

    #[test]
    fn apply_batch_is_atomic() {
        let mut d = doc();
        d.set(&parse_path("a"), 1).unwrap();
        let mut changes = d.drain_changes();
        changes.push(Delta {
            target: d.id().clone(),
            op: DeltaOp::Delete,
            path: parse_path("missing"),
            value: None,
            time: Default::default(),
        });

        let mut replica = doc();
        replica.set(&parse_path("keep"), true).unwrap();
        assert!(replica.apply_batch(&changes).is_err());
        assert_eq!(replica.to_json().unwrap(), json!({"keep": true}));
    }

    #[test]
    fn rewriting_a_field_keeps_the_arena_bounded() {
        let mut d = doc();
        for i in 0..1_000 {
            d.set(&parse_path("blob"), json!({"n": i, "xs": [i, i + 1]})).unwrap();
        }
        assert!(d.graph().len() <= 2 * MIN_COMPACT_LEN, "{} nodes", d.graph().len());
        assert_eq!(d.to_json().unwrap(), json!({"blob": {"n": 999, "xs": [999, 1000]}}));

        d.compact();
        assert_eq!(d.graph().len(), 3);
        let root = &d.graph()[d.root().as_node().unwrap()];
        assert_eq!(root.id.as_deref(), Some("rec-1"));
    }

    #[test]
    fn failed_batch_restores_state_across_compaction() {
        let mut d = doc();
        d.set(&parse_path("a"), json!({"b": 1})).unwrap();
        d.drain_changes();
        let mut source = d.clone();
        for i in 0..200 {
            source.set(&parse_path("a"), json!({"b": i})).unwrap();
        }
        let mut changes = source.drain_changes();
        changes.push(Delta {
            target: d.id().clone(),
            op: DeltaOp::Delete,
            path: parse_path("missing"),
            value: None,
            time: Default::default(),
        });

        assert!(d.apply_batch(&changes).is_err());
        assert_eq!(d.to_json().unwrap(), json!({"a": {"b": 1}}));
        d.set(&parse_path("a.b"), 2).unwrap();
        assert_eq!(d.to_json().unwrap(), json!({"a": {"b": 2}}));
    }

    #[test]
    fn wrong_target_is_rejected() {
        let mut d = doc();
        d.set(&parse_path("a"), 1).unwrap();
        let changes = d.drain_changes();
        let mut other = Document::new(RecordId::from("other"));
        assert!(matches!(
            other.apply(&changes[0]),
            Err(TypeError::WrongTarget { .. })
        ));
    }

    #[test]
    fn mark_deleted_is_a_root_delete() {
        let mut d = doc();
        d.mark_deleted().unwrap();
        assert!(d.is_deleted());
        let changes = d.drain_changes();
        assert!(changes[0].is_record_delete());
    }

    #[test]
    fn scalars_walk_nested_fields() {
        let mut d = doc();
        d.set(&parse_path("status"), "open").unwrap();
        d.set(&parse_path("owner"), json!({"name": "ada"})).unwrap();
        d.set(&parse_path("tags"), json!(["x", "y"])).unwrap();
        let scalars = d.scalars();
        let as_strings: Vec<(String, String)> = scalars
            .iter()
            .map(|(p, s)| (p.join("."), s.to_string()))
            .collect();
        assert!(as_strings.contains(&("status".into(), "\"open\"".into())));
        assert!(as_strings.contains(&("owner.name".into(), "\"ada\"".into())));
        assert!(as_strings.contains(&("tags".into(), "\"x\"".into())));
        assert!(as_strings.contains(&("tags".into(), "\"y\"".into())));
    }
}
