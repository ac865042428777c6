//! Graph walk shared by the encoder and [`copy`](crate::copy).
//!
//! The planner visits every value reachable from the root once, lowers each
//! node through its serializer, buckets values by serializer, orders the
//! compound buckets by type dependency, and assigns every value its index.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use strand_types::{Graph, NodeId, Scalar, TypeError, Value};

use crate::error::{CodecError, CodecResult};
use crate::registry::{CompoundSerializer, PrimitiveSerializer, Registry, Serializer};

pub(crate) struct PrimBucket {
    pub serializer: Arc<dyn PrimitiveSerializer>,
    pub values: Vec<Value>,
}

pub(crate) struct BinaryBucket {
    pub name: String,
    pub values: Vec<Bytes>,
}

pub(crate) struct CompoundBucket {
    pub serializer: Arc<dyn CompoundSerializer>,
    pub nodes: Vec<NodeId>,
}

pub(crate) struct Plan {
    pub prims: Vec<PrimBucket>,
    pub binaries: Vec<BinaryBucket>,
    /// In dependency order: a bucket follows the buckets its nodes reference.
    pub compounds: Vec<CompoundBucket>,
    pub deps: HashMap<NodeId, Vec<Value>>,
    scalar_index: HashMap<Scalar, usize>,
    node_index: HashMap<NodeId, usize>,
    pub root: usize,
    pub total: usize,
}

enum Visit {
    Enter(Value),
    Exit(NodeId),
}

impl Plan {
    pub fn build(registry: &Registry, graph: &Graph, root: &Value) -> CodecResult<Plan> {
        let mut prims: Vec<PrimBucket> = Vec::new();
        let mut binaries: Vec<BinaryBucket> = Vec::new();
        let mut prim_bucket: HashMap<String, usize> = HashMap::new();
        let mut seen_scalars: HashSet<Scalar> = HashSet::new();

        let mut compound_bucket: HashMap<String, usize> = HashMap::new();
        let mut compounds: Vec<CompoundBucket> = Vec::new();
        let mut type_edges: Vec<HashSet<usize>> = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut deps: HashMap<NodeId, Vec<Value>> = HashMap::new();

        let mut stack = vec![Visit::Enter(root.clone())];
        while let Some(visit) = stack.pop() {
            let value = match visit {
                Visit::Exit(id) => {
                    let tag = &graph.get(id).ok_or(TypeError::DanglingNode(id.index()))?.tag;
                    let bucket = compound_bucket[tag.as_ref()];
                    compounds[bucket].nodes.push(id);
                    continue;
                }
                Visit::Enter(value) => value,
            };

            let ser = match registry.resolve(graph, &value)? {
                Serializer::Compound(ser) => ser.clone(),
                Serializer::Primitive(ser) => {
                    let Some(scalar) = value.scalar() else {
                        return Err(CodecError::Invariant("node routed to a primitive".into()));
                    };
                    if !seen_scalars.insert(scalar) {
                        continue;
                    }
                    if ser.binary() {
                        let data = match &value {
                            Value::Bytes(data) => data.clone(),
                            other => {
                                return Err(CodecError::WrongValue {
                                    serializer: ser.name().to_string(),
                                    reason: other.kind_name().to_string(),
                                })
                            }
                        };
                        match binaries.iter_mut().find(|b| b.name == ser.name()) {
                            Some(bucket) => bucket.values.push(data),
                            None => binaries.push(BinaryBucket {
                                name: ser.name().to_string(),
                                values: vec![data],
                            }),
                        }
                        continue;
                    }
                    let next = prims.len();
                    let slot = *prim_bucket.entry(ser.name().to_string()).or_insert(next);
                    if slot == next {
                        prims.push(PrimBucket {
                            serializer: ser.clone(),
                            values: Vec::new(),
                        });
                    }
                    prims[slot].values.push(value);
                    continue;
                }
            };
            let id = match &value {
                Value::Node(id) => *id,
                other => {
                    return Err(CodecError::Invariant(format!(
                        "{} value routed to compound {}",
                        other.kind_name(),
                        ser.name()
                    )))
                }
            };

            if !visited.insert(id) {
                continue;
            }
            let node = graph.get(id).ok_or(TypeError::DanglingNode(id.index()))?;
            let lowered = ser.lower(node)?;

            let next = compounds.len();
            let own = *compound_bucket.entry(ser.name().to_string()).or_insert(next);
            if own == next {
                compounds.push(CompoundBucket {
                    serializer: ser,
                    nodes: Vec::new(),
                });
                type_edges.push(HashSet::new());
            }

            stack.push(Visit::Exit(id));
            for dep in lowered.iter().rev() {
                stack.push(Visit::Enter(dep.clone()));
            }
            deps.insert(id, lowered);
        }

        // Type edges, once every bucket exists.
        for (id, lowered) in &deps {
            let own = compound_bucket[graph[*id].tag.as_ref()];
            for dep in lowered {
                if let Value::Node(child) = dep {
                    let b = compound_bucket[graph[*child].tag.as_ref()];
                    if b != own {
                        type_edges[own].insert(b);
                    }
                }
            }
        }

        let order = topo_order(&type_edges);
        let mut slots: Vec<Option<CompoundBucket>> = compounds.into_iter().map(Some).collect();
        let compounds: Vec<CompoundBucket> = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        let mut plan = Plan {
            prims,
            binaries,
            compounds,
            deps,
            scalar_index: HashMap::new(),
            node_index: HashMap::new(),
            root: 0,
            total: 0,
        };
        plan.assign_indices();
        plan.root = plan.index_of(root)?;
        plan.check_alloc_order()?;
        Ok(plan)
    }

    fn assign_indices(&mut self) {
        let mut next = 0;
        for bucket in &self.prims {
            for v in &bucket.values {
                if let Some(s) = v.scalar() {
                    self.scalar_index.insert(s, next);
                }
                next += 1;
            }
        }
        for bucket in &self.binaries {
            for b in &bucket.values {
                self.scalar_index.insert(Scalar::Bytes(b.clone()), next);
                next += 1;
            }
        }
        for bucket in &self.compounds {
            for id in &bucket.nodes {
                self.node_index.insert(*id, next);
                next += 1;
            }
        }
        self.total = next;
    }

    pub fn index_of(&self, value: &Value) -> CodecResult<usize> {
        let found = match value {
            Value::Node(id) => self.node_index.get(id),
            primitive => primitive.scalar().and_then(|s| self.scalar_index.get(&s)),
        };
        found
            .copied()
            .ok_or_else(|| CodecError::Invariant(format!("value {value:?} has no index")))
    }

    pub fn dep_indices(&self, id: NodeId) -> CodecResult<Vec<usize>> {
        let deps = self
            .deps
            .get(&id)
            .ok_or_else(|| CodecError::Invariant(format!("node {id:?} was not lowered")))?;
        deps.iter().map(|d| self.index_of(d)).collect()
    }

    fn check_alloc_order(&self) -> CodecResult<()> {
        for bucket in &self.compounds {
            let alloc = bucket.serializer.alloc();
            if alloc == 0 {
                continue;
            }
            for id in &bucket.nodes {
                let own = self.node_index[id];
                let deps = &self.deps[id];
                if deps.len() < alloc {
                    return Err(CodecError::Invariant(format!(
                        "{}: {} dependencies, alloc arity {alloc}",
                        bucket.serializer.name(),
                        deps.len()
                    )));
                }
                for dep in &deps[..alloc] {
                    if self.index_of(dep)? >= own {
                        return Err(CodecError::Invariant(format!(
                            "{}: allocation dependency assigned after its dependent",
                            bucket.serializer.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Depth-first topological order; edges closing a cycle are ignored.
fn topo_order(edges: &[HashSet<usize>]) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    let mut marks = vec![Mark::New; edges.len()];
    let mut order = Vec::with_capacity(edges.len());
    for start in 0..edges.len() {
        if marks[start] != Mark::New {
            continue;
        }
        let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();
        marks[start] = Mark::Active;
        stack.push((start, sorted(&edges[start])));
        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) if marks[next] == Mark::New => {
                    marks[next] = Mark::Active;
                    let children = sorted(&edges[next]);
                    stack.push((next, children));
                }
                Some(_) => {}
                None => {
                    marks[*node] = Mark::Done;
                    order.push(*node);
                    stack.pop();
                }
            }
        }
    }
    order
}

fn sorted(set: &HashSet<usize>) -> Vec<usize> {
    let mut v: Vec<usize> = set.iter().copied().collect();
    v.sort_unstable_by(|a, b| b.cmp(a));
    v
}
