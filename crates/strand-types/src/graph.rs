use std::collections::{HashMap, HashSet};
use std::ops::Index;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::error::{TypeError, TypeResult};
use crate::path::{display_path, PathSeg};
use crate::value::{NodeId, Scalar, Value};

/// Type tags of the built-in container shapes.
pub mod tags {
    pub const OBJECT: &str = "object";
    pub const ARRAY: &str = "array";
    pub const MAP: &str = "map";
    pub const SET: &str = "set";
    pub const REACTIVE_OBJECT: &str = "reactive.object";
    pub const REACTIVE_ARRAY: &str = "reactive.array";
    pub const REACTIVE_MAP: &str = "reactive.map";
    pub const DELTA: &str = "strand.delta";
}

/// Payload of a compound node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeData {
    /// Insertion-ordered string-keyed fields.
    Object(Vec<(Arc<str>, Value)>),
    Array(Vec<Value>),
    /// Insertion-ordered entries with arbitrary keys.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Positional fields of a user-registered record type.
    Fields(Vec<Value>),
    /// Shell allocated by two-phase construction, not yet finished.
    Pending,
}

impl NodeData {
    fn shape(&self) -> &'static str {
        match self {
            NodeData::Object(_) => "object",
            NodeData::Array(_) => "array",
            NodeData::Map(_) => "map",
            NodeData::Set(_) => "set",
            NodeData::Fields(_) => "fields",
            NodeData::Pending => "pending",
        }
    }
}

/// A compound value stored in a [`Graph`].
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Serializer name for this node.
    pub tag: Arc<str>,
    /// Stable identifier carried by reactive containers.
    pub id: Option<Arc<str>>,
    pub data: NodeData,
}

impl Node {
    pub fn new(tag: &str, data: NodeData) -> Self {
        Self {
            tag: Arc::from(tag),
            id: None,
            data,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(Arc::from(id));
        self
    }

    pub fn pending(tag: &str) -> Self {
        Self::new(tag, NodeData::Pending)
    }

    /// All values directly referenced by this node, in serialization order.
    pub fn children(&self) -> Vec<&Value> {
        match &self.data {
            NodeData::Object(fields) => fields.iter().map(|(_, v)| v).collect(),
            NodeData::Array(items) | NodeData::Set(items) | NodeData::Fields(items) => {
                items.iter().collect()
            }
            NodeData::Map(entries) => entries.iter().flat_map(|(k, v)| [k, v]).collect(),
            NodeData::Pending => Vec::new(),
        }
    }

    /// Look up a field of an object node.
    pub fn field(&self, key: &str) -> Option<&Value> {
        match &self.data {
            NodeData::Object(fields) => fields
                .iter()
                .find(|(k, _)| k.as_ref() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    fn remap(&mut self, f: impl Fn(NodeId) -> NodeId) {
        let shift = |v: &mut Value| {
            if let Value::Node(id) = v {
                *id = f(*id);
            }
        };
        match &mut self.data {
            NodeData::Object(fields) => fields.iter_mut().for_each(|(_, v)| shift(v)),
            NodeData::Array(items) | NodeData::Set(items) | NodeData::Fields(items) => {
                items.iter_mut().for_each(shift)
            }
            NodeData::Map(entries) => entries.iter_mut().for_each(|(k, v)| {
                shift(k);
                shift(v);
            }),
            NodeData::Pending => {}
        }
    }
}

/// Arena holding the compound nodes of one object graph.
///
/// Nodes reference each other through [`Value::Node`], so cycles and shared
/// sub-objects are plain index reuse. Nodes are never removed individually;
/// unreachable nodes go away on [`compact`](Graph::compact), or when the
/// graph is re-encoded or copied.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node and return its id.
    pub fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId::from_index(self.nodes.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId::from_index(i), n))
    }

    pub fn object<K: AsRef<str>>(&mut self, entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        let fields = entries
            .into_iter()
            .map(|(k, v)| (Arc::from(k.as_ref()), v))
            .collect();
        Value::Node(self.alloc(Node::new(tags::OBJECT, NodeData::Object(fields))))
    }

    pub fn array(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        let items = items.into_iter().collect();
        Value::Node(self.alloc(Node::new(tags::ARRAY, NodeData::Array(items))))
    }

    pub fn map(&mut self, entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        let entries = entries.into_iter().collect();
        Value::Node(self.alloc(Node::new(tags::MAP, NodeData::Map(entries))))
    }

    pub fn set(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        let items = items.into_iter().collect();
        Value::Node(self.alloc(Node::new(tags::SET, NodeData::Set(items))))
    }

    /// Build nodes for a JSON value. Objects and arrays become fresh
    /// `object`/`array` nodes; integers that fit `i64` stay integral.
    pub fn from_json(&mut self, json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::str(s),
            Json::Array(items) => {
                let values: Vec<Value> = items.iter().map(|j| self.from_json(j)).collect();
                self.array(values)
            }
            Json::Object(map) => {
                let fields: Vec<(String, Value)> = map
                    .iter()
                    .map(|(k, j)| (k.clone(), self.from_json(j)))
                    .collect();
                self.object(fields)
            }
        }
    }

    /// Render a value as JSON. Maps become `[key, value]` pair arrays, sets
    /// and record fields become arrays, bytes become hex strings.
    pub fn to_json(&self, value: &Value) -> TypeResult<Json> {
        let mut on_path = HashSet::new();
        self.to_json_inner(value, &mut on_path)
    }

    fn to_json_inner(&self, value: &Value, on_path: &mut HashSet<NodeId>) -> TypeResult<Json> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Bytes(b) => Json::String(hex::encode(b)),
            Value::Node(id) => {
                if !on_path.insert(*id) {
                    return Err(TypeError::Cyclic);
                }
                let node = self.get(*id).ok_or(TypeError::DanglingNode(id.index()))?;
                let json = match &node.data {
                    NodeData::Object(fields) => {
                        let mut map = JsonMap::new();
                        for (k, v) in fields {
                            map.insert(k.to_string(), self.to_json_inner(v, on_path)?);
                        }
                        Json::Object(map)
                    }
                    NodeData::Array(items) | NodeData::Set(items) | NodeData::Fields(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for v in items {
                            out.push(self.to_json_inner(v, on_path)?);
                        }
                        Json::Array(out)
                    }
                    NodeData::Map(entries) => {
                        let mut out = Vec::with_capacity(entries.len());
                        for (k, v) in entries {
                            out.push(Json::Array(vec![
                                self.to_json_inner(k, on_path)?,
                                self.to_json_inner(v, on_path)?,
                            ]));
                        }
                        Json::Array(out)
                    }
                    NodeData::Pending => Json::Null,
                };
                on_path.remove(id);
                json
            }
        })
    }

    /// Follow `path` from `root`. Keys address object fields and string map
    /// keys; indices address array elements, record fields, and integer map
    /// keys.
    pub fn resolve<'a>(&'a self, root: &'a Value, path: &[PathSeg]) -> Option<&'a Value> {
        let mut current = root;
        for seg in path {
            let node = self.get(current.as_node()?)?;
            current = child(node, seg)?;
        }
        Some(current)
    }

    /// Like [`resolve`](Self::resolve) but reports which segment failed.
    pub fn resolve_node(&self, root: NodeId, path: &[PathSeg]) -> TypeResult<NodeId> {
        let mut current = root;
        for (depth, seg) in path.iter().enumerate() {
            let node = self
                .get(current)
                .ok_or(TypeError::DanglingNode(current.index()))?;
            let next = child(node, seg)
                .ok_or_else(|| TypeError::PathNotFound(display_path(&path[..=depth])))?;
            current = next.as_node().ok_or_else(|| TypeError::TypeMismatch {
                path: display_path(&path[..=depth]),
                expected: "container",
            })?;
        }
        Ok(current)
    }

    /// Merge another arena into this one and return `value` re-based onto it.
    pub fn absorb(&mut self, fragment: &Fragment) -> Value {
        let base = self.nodes.len();
        self.nodes.extend(fragment.graph.nodes.iter().cloned().map(|mut n| {
            n.remap(|id| NodeId::from_index(id.index() + base));
            n
        }));
        match &fragment.value {
            Value::Node(id) => Value::Node(NodeId::from_index(id.index() + base)),
            other => other.clone(),
        }
    }

    /// Drop every node unreachable from `root` and renumber the rest in
    /// depth-first preorder, so a node root ends up at index 0. Returns
    /// `root` re-based onto the compacted arena.
    pub fn compact(&mut self, root: &Value) -> Value {
        let order: Vec<NodeId> = self
            .reachable(root)
            .into_iter()
            .filter(|id| id.index() < self.nodes.len())
            .collect();
        let moved: HashMap<NodeId, NodeId> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, NodeId::from_index(i)))
            .collect();
        let mut old = std::mem::take(&mut self.nodes);
        self.nodes = order
            .iter()
            .map(|id| {
                let mut node = std::mem::replace(&mut old[id.index()], Node::pending(""));
                node.remap(|c| moved.get(&c).copied().unwrap_or(c));
                node
            })
            .collect();
        match root {
            Value::Node(id) => Value::Node(moved.get(id).copied().unwrap_or(*id)),
            other => other.clone(),
        }
    }

    /// Ids of all nodes reachable from `root`, in depth-first preorder.
    pub fn reachable(&self, root: &Value) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = root.as_node().into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(node) = self.get(id) {
                for child in node.children().into_iter().rev() {
                    if let Value::Node(c) = child {
                        stack.push(*c);
                    }
                }
            }
        }
        order
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

fn child<'a>(node: &'a Node, seg: &PathSeg) -> Option<&'a Value> {
    match (&node.data, seg) {
        (NodeData::Object(fields), PathSeg::Key(k)) => fields
            .iter()
            .find(|(name, _)| name.as_ref() == k)
            .map(|(_, v)| v),
        (NodeData::Array(items) | NodeData::Fields(items), PathSeg::Index(i)) => items.get(*i),
        (NodeData::Map(entries), seg) => entries
            .iter()
            .find(|(key, _)| map_key_matches(key, seg))
            .map(|(_, v)| v),
        _ => None,
    }
}

pub(crate) fn map_key_matches(key: &Value, seg: &PathSeg) -> bool {
    match (key, seg) {
        (Value::Str(s), PathSeg::Key(k)) => s.as_ref() == k,
        (Value::Int(i), PathSeg::Index(idx)) => *i >= 0 && *i as usize == *idx,
        _ => false,
    }
}

/// Structural equality of two values living in (possibly) different graphs.
///
/// Nodes must correspond one-to-one: if `a` reaches the same node through two
/// paths, `b` must too. This makes equality sensitive to aliasing and lets
/// cyclic graphs compare in finite time.
pub fn structurally_equal(a: &Graph, av: &Value, b: &Graph, bv: &Value) -> bool {
    let mut forward: HashMap<NodeId, NodeId> = HashMap::new();
    let mut backward: HashMap<NodeId, NodeId> = HashMap::new();
    let mut stack: Vec<(Value, Value)> = vec![(av.clone(), bv.clone())];

    while let Some((x, y)) = stack.pop() {
        let (xi, yi) = match (&x, &y) {
            (Value::Node(xi), Value::Node(yi)) => (*xi, *yi),
            (Value::Node(_), _) | (_, Value::Node(_)) => return false,
            _ => {
                if !x.same_primitive(&y) {
                    return false;
                }
                continue;
            }
        };
        match (forward.get(&xi), backward.get(&yi)) {
            (Some(mapped), _) if *mapped == yi => continue,
            (Some(_), _) | (None, Some(_)) => return false,
            (None, None) => {
                forward.insert(xi, yi);
                backward.insert(yi, xi);
            }
        }
        let (Some(xn), Some(yn)) = (a.get(xi), b.get(yi)) else {
            return false;
        };
        if xn.tag != yn.tag || xn.id != yn.id || xn.data.shape() != yn.data.shape() {
            return false;
        }
        if let (NodeData::Object(xf), NodeData::Object(yf)) = (&xn.data, &yn.data) {
            if xf.len() != yf.len() || xf.iter().zip(yf).any(|((xk, _), (yk, _))| xk != yk) {
                return false;
            }
        }
        let (xc, yc) = (xn.children(), yn.children());
        if xc.len() != yc.len() {
            return false;
        }
        stack.extend(xc.into_iter().cloned().zip(yc.into_iter().cloned()));
    }
    true
}

/// A value together with the arena its nodes live in.
///
/// Fragments are what the decoder produces and what deltas carry: they are
/// self-contained, so they can be moved between graphs with
/// [`Graph::absorb`].
#[derive(Clone, Debug, Default)]
pub struct Fragment {
    pub graph: Graph,
    pub value: Value,
}

impl Fragment {
    pub fn new(graph: Graph, value: Value) -> Self {
        Self { graph, value }
    }

    /// A fragment holding a single primitive.
    pub fn scalar(value: impl Into<Value>) -> Self {
        let value = value.into();
        debug_assert!(value.is_primitive(), "scalar fragment given a node");
        Self {
            graph: Graph::new(),
            value,
        }
    }

    pub fn from_json(json: &Json) -> Self {
        let mut graph = Graph::new();
        let value = graph.from_json(json);
        Self { graph, value }
    }

    pub fn to_json(&self) -> TypeResult<Json> {
        self.graph.to_json(&self.value)
    }

    pub fn structurally_eq(&self, other: &Fragment) -> bool {
        structurally_equal(&self.graph, &self.value, &other.graph, &other.value)
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        self.value.scalar()
    }
}

impl From<&Json> for Fragment {
    fn from(json: &Json) -> Self {
        Fragment::from_json(json)
    }
}

impl From<Json> for Fragment {
    fn from(json: Json) -> Self {
        Fragment::from_json(&json)
    }
}

impl From<Scalar> for Fragment {
    fn from(s: Scalar) -> Self {
        Fragment::scalar(s.to_value())
    }
}

impl From<bool> for Fragment {
    fn from(b: bool) -> Self {
        Fragment::scalar(b)
    }
}

impl From<i64> for Fragment {
    fn from(i: i64) -> Self {
        Fragment::scalar(i)
    }
}

impl From<i32> for Fragment {
    fn from(i: i32) -> Self {
        Fragment::scalar(i)
    }
}

impl From<f64> for Fragment {
    fn from(f: f64) -> Self {
        Fragment::scalar(f)
    }
}

impl From<&str> for Fragment {
    fn from(s: &str) -> Self {
        Fragment::scalar(s)
    }
}

impl From<String> for Fragment {
    fn from(s: String) -> Self {
        Fragment::scalar(s)
    }
}

impl From<Bytes> for Fragment {
    fn from(b: Bytes) -> Self {
        Fragment::scalar(b)
    }
}
