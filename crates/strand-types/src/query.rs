use std::collections::HashSet;
use std::sync::Arc;

use crate::document::Document;
use crate::graph::{Graph, NodeData};
use crate::value::{NodeId, Scalar, Value};

/// Equality constraint on one field path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub path: Vec<Arc<str>>,
    pub value: Scalar,
}

/// Conjunction of field equality constraints.
///
/// A constraint matches when its path resolves to an equal scalar, or to an
/// array/set containing one. Arrays along the path fan out: `tags.name = x`
/// matches if any element of `tags` has `name == x`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Query {
    pub constraints: Vec<Constraint>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint on a dotted field path.
    pub fn eq(mut self, path: &str, value: impl Into<Scalar>) -> Self {
        self.constraints.push(Constraint {
            path: path.split('.').map(Arc::from).collect(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_value(doc.graph(), &doc.root())
    }

    pub fn matches_value(&self, graph: &Graph, root: &Value) -> bool {
        self.constraints.iter().all(|c| {
            let mut visited = HashSet::new();
            matches_at(graph, root, &c.path, &c.value, &mut visited)
        })
    }
}

fn matches_at(
    graph: &Graph,
    value: &Value,
    path: &[Arc<str>],
    target: &Scalar,
    visited: &mut HashSet<(NodeId, usize)>,
) -> bool {
    let id = match value {
        Value::Node(id) => *id,
        primitive => return path.is_empty() && primitive.scalar().as_ref() == Some(target),
    };
    if !visited.insert((id, path.len())) {
        return false;
    }
    let Some(node) = graph.get(id) else {
        return false;
    };
    match (&node.data, path.split_first()) {
        (NodeData::Array(items) | NodeData::Set(items), _) => items
            .iter()
            .any(|item| matches_at(graph, item, path, target, visited)),
        (NodeData::Object(fields), Some((head, rest))) => fields
            .iter()
            .find(|(k, _)| k == head)
            .is_some_and(|(_, v)| matches_at(graph, v, rest, target, visited)),
        (NodeData::Map(entries), Some((head, rest))) => entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(head.as_ref()))
            .is_some_and(|(_, v)| matches_at(graph, v, rest, target, visited)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::graph::Fragment;

    fn frag(j: serde_json::Value) -> Fragment {
        Fragment::from_json(&j)
    }

    #[test]
    fn matches_nested_scalar() {
        let f = frag(json!({"owner": {"name": "ada"}, "status": "open"}));
        let q = Query::new().eq("owner.name", "ada").eq("status", "open");
        assert!(q.matches_value(&f.graph, &f.value));
        let q = Query::new().eq("owner.name", "bob");
        assert!(!q.matches_value(&f.graph, &f.value));
    }

    #[test]
    fn arrays_fan_out() {
        let f = frag(json!({"tags": ["a", "b"], "items": [{"k": 1}, {"k": 2}]}));
        assert!(Query::new().eq("tags", "b").matches_value(&f.graph, &f.value));
        assert!(Query::new().eq("items.k", 2).matches_value(&f.graph, &f.value));
        assert!(!Query::new().eq("items.k", 3).matches_value(&f.graph, &f.value));
    }

    #[test]
    fn empty_query_matches_everything() {
        let f = frag(json!({}));
        assert!(Query::new().matches_value(&f.graph, &f.value));
    }

    #[test]
    fn self_containing_array_terminates() {
        let mut g = Graph::new();
        let Value::Node(id) = g.array(vec![]) else { unreachable!() };
        if let NodeData::Array(items) = &mut g.get_mut(id).unwrap().data {
            items.push(Value::Node(id));
        }
        assert!(!Query::new().eq("x", 1).matches_value(&g, &Value::Node(id)));
    }
}
