use std::collections::HashMap;

use strand_types::{Fragment, Graph, NodeId, Value};
use tracing::trace;

use crate::error::{CodecError, CodecResult};
use crate::plan::Plan;
use crate::registry::{snapshot, Registry};

/// Deep-copy `value` into a fresh arena without a byte round trip.
///
/// Nodes are rebuilt through their serializers, so the copy has exactly the
/// shape decoding its encoding would produce: shared sub-objects stay shared,
/// cycles are preserved, and nothing is shared with `graph`.
pub fn copy(graph: &Graph, value: &Value) -> CodecResult<Fragment> {
    copy_with(&snapshot(), graph, value)
}

pub fn copy_with(registry: &Registry, graph: &Graph, value: &Value) -> CodecResult<Fragment> {
    if value.is_primitive() {
        return Ok(Fragment::scalar(value.clone()));
    }
    let plan = Plan::build(registry, graph, value)?;
    let mut out = Graph::new();
    let mut mapped: HashMap<NodeId, NodeId> = HashMap::new();

    for bucket in &plan.compounds {
        let alloc = bucket.serializer.alloc();
        for id in &bucket.nodes {
            let deps = &plan.deps[id];
            let alloc_deps = deps[..alloc]
                .iter()
                .map(|d| remap(d, &mapped))
                .collect::<CodecResult<Vec<_>>>()?;
            let shell = bucket.serializer.preallocate(&alloc_deps)?;
            mapped.insert(*id, out.alloc(shell));
        }
    }

    for bucket in &plan.compounds {
        for id in &bucket.nodes {
            let deps = plan.deps[id]
                .iter()
                .map(|d| remap(d, &mapped))
                .collect::<CodecResult<Vec<_>>>()?;
            let node = out
                .get_mut(mapped[id])
                .ok_or_else(|| CodecError::Invariant("copied node missing".into()))?;
            bucket.serializer.finish(node, &deps)?;
        }
    }

    trace!(nodes = out.len(), "graph copied");
    let root = remap(value, &mapped)?;
    Ok(Fragment::new(out, root))
}

fn remap(value: &Value, mapped: &HashMap<NodeId, NodeId>) -> CodecResult<Value> {
    match value {
        Value::Node(id) => mapped
            .get(id)
            .map(|new| Value::Node(*new))
            .ok_or_else(|| CodecError::Invariant(format!("node {id:?} referenced before allocation"))),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strand_types::NodeData;

    use super::*;

    #[test]
    fn copy_drops_unreachable_nodes() {
        let mut g = Graph::new();
        let _garbage = g.array(vec![Value::Int(0)]);
        let root = g.from_json(&json!({"keep": [1, 2]}));
        let copied = copy(&g, &root).unwrap();
        assert_eq!(copied.graph.len(), 2);
        assert!(strand_types::structurally_equal(&g, &root, &copied.graph, &copied.value));
    }

    #[test]
    fn copies_share_nothing_with_the_source() {
        let frag = Fragment::from_json(&json!({"a": {"b": [1]}}));
        let mut copied = copy(&frag.graph, &frag.value).unwrap();
        let root = copied.value.as_node().unwrap();
        if let Some(node) = copied.graph.get_mut(root) {
            node.data = NodeData::Object(vec![]);
        }
        assert_eq!(frag.to_json().unwrap(), json!({"a": {"b": [1]}}));
        assert_eq!(copied.to_json().unwrap(), json!({}));
    }

    #[test]
    fn aliasing_and_cycles_are_kept() {
        let mut g = Graph::new();
        let shared = g.array(vec![Value::str("s")]);
        let root = g.array(vec![shared.clone(), shared.clone()]);
        if let Some(node) = g.get_mut(shared.as_node().unwrap()) {
            node.data = NodeData::Array(vec![Value::str("s"), root.clone()]);
        }

        let copied = copy(&g, &root).unwrap();
        let top = &copied.graph[copied.value.as_node().unwrap()];
        let NodeData::Array(items) = &top.data else {
            panic!("not an array");
        };
        assert_eq!(items[0], items[1]);
        let inner = &copied.graph[items[0].as_node().unwrap()];
        assert_eq!(inner.children()[1], &copied.value);
    }

    #[test]
    fn primitives_copy_as_themselves() {
        let frag = copy(&Graph::new(), &Value::str("x")).unwrap();
        assert_eq!(frag.value, Value::str("x"));
        assert!(frag.graph.is_empty());
    }
}
