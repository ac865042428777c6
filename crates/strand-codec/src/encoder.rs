use std::collections::{HashMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use strand_stream::{encode_varint, zigzag, StreamWriter};
use strand_types::{Fragment, Graph, Value};
use tracing::debug;

use crate::bits::BitWriter;
use crate::error::{CodecError, CodecResult};
use crate::format::*;
use crate::huffman::{Pair, Tree};
use crate::plan::Plan;
use crate::registry::{snapshot, Registry};

enum Job {
    Header,
    Primitives(usize),
    Binary(usize),
    Compounds(usize),
    Root,
    Eof,
}

/// Emits a planned graph extent by extent.
///
/// The encoder owns everything it needs once constructed, so an async
/// caller can flush between extents without holding the graph.
pub struct Encoder {
    plan: Plan,
    options: EncodeOptions,
    names: HashMap<String, u64>,
    jobs: VecDeque<Job>,
    extents: usize,
}

impl Encoder {
    pub fn new(
        registry: &Registry,
        options: EncodeOptions,
        graph: &Graph,
        root: &Value,
    ) -> CodecResult<Self> {
        let plan = Plan::build(registry, graph, root)?;
        let mut jobs = VecDeque::new();
        jobs.push_back(Job::Header);
        jobs.extend((0..plan.prims.len()).map(Job::Primitives));
        jobs.extend((0..plan.binaries.len()).map(Job::Binary));
        jobs.extend((0..plan.compounds.len()).map(Job::Compounds));
        if plan.root + 1 != plan.total {
            jobs.push_back(Job::Root);
        }
        jobs.push_back(Job::Eof);
        Ok(Self {
            plan,
            options,
            names: HashMap::new(),
            jobs,
            extents: 0,
        })
    }

    /// Number of values that will be assigned an index.
    pub fn value_count(&self) -> usize {
        self.plan.total
    }

    /// Append the next extent (with any name table it needs) to `out`.
    /// Returns `false` once the end marker has been written.
    pub fn emit_next(&mut self, out: &mut BytesMut) -> CodecResult<bool> {
        let Some(job) = self.jobs.pop_front() else {
            return Ok(false);
        };
        match job {
            Job::Header => {
                out.put_slice(&MAGIC);
                out.put_u8(VERSION);
            }
            Job::Primitives(i) => self.emit_primitives(i, out)?,
            Job::Binary(i) => self.emit_binary(i, out)?,
            Job::Compounds(i) => self.emit_compounds(i, out)?,
            Job::Root => {
                out.put_u8(EXT_ROOT);
                encode_varint(out, (self.plan.total - 1 - self.plan.root) as u64);
                self.extents += 1;
            }
            Job::Eof => {
                out.put_u8(EXT_EOF);
                debug!(
                    values = self.plan.total,
                    extents = self.extents,
                    names = self.names.len(),
                    "graph encoded"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn name_index(&mut self, name: &str, out: &mut BytesMut) -> u64 {
        if let Some(idx) = self.names.get(name) {
            return *idx;
        }
        let idx = self.names.len() as u64;
        out.put_u8(EXT_NAMES);
        encode_varint(out, 1);
        out.put_slice(name.as_bytes());
        out.put_u8(0);
        self.names.insert(name.to_string(), idx);
        self.extents += 1;
        idx
    }

    fn emit_primitives(&mut self, i: usize, out: &mut BytesMut) -> CodecResult<()> {
        let serializer = self.plan.prims[i].serializer.clone();
        let name_idx = self.name_index(serializer.name(), out);
        let bucket = &self.plan.prims[i];
        out.put_u8(EXT_PRIMITIVES);
        encode_varint(out, name_idx);
        encode_varint(out, bucket.values.len() as u64);
        for value in &bucket.values {
            serializer.write(value, out)?;
        }
        self.extents += 1;
        Ok(())
    }

    /// Small payloads are grouped into lists; a large one interrupts the
    /// current list and gets its own extent, so indices stay in plan order.
    fn emit_binary(&mut self, i: usize, out: &mut BytesMut) -> CodecResult<()> {
        let name = self.plan.binaries[i].name.clone();
        let name_idx = self.name_index(&name, out);
        let values = std::mem::take(&mut self.plan.binaries[i].values);

        let mut run: Vec<&Bytes> = Vec::new();
        for value in &values {
            if value.len() < self.options.large_payload {
                run.push(value);
                continue;
            }
            if !run.is_empty() {
                self.write_binary_list(name_idx, &run, out)?;
                run.clear();
            }
            self.write_large(name_idx, value, out)?;
        }
        if !run.is_empty() {
            self.write_binary_list(name_idx, &run, out)?;
        }
        self.plan.binaries[i].values = values;
        Ok(())
    }

    fn write_binary_list(&mut self, name_idx: u64, run: &[&Bytes], out: &mut BytesMut) -> CodecResult<()> {
        let total: usize = run.iter().map(|b| b.len()).sum();
        let mut payload = Vec::with_capacity(total);
        for b in run {
            payload.extend_from_slice(b);
        }
        let compressed = self.maybe_compress(&payload)?;
        out.put_u8(if compressed.is_some() {
            EXT_BINARY_ZSTD
        } else {
            EXT_BINARY
        });
        encode_varint(out, name_idx);
        encode_varint(out, run.len() as u64);
        for b in run {
            encode_varint(out, b.len() as u64);
        }
        match compressed {
            Some(stored) => {
                encode_varint(out, stored.len() as u64);
                out.put_slice(&stored);
            }
            None => out.put_slice(&payload),
        }
        self.extents += 1;
        Ok(())
    }

    fn write_large(&mut self, name_idx: u64, value: &Bytes, out: &mut BytesMut) -> CodecResult<()> {
        match self.maybe_compress(value)? {
            Some(stored) => {
                out.put_u8(EXT_LARGE_ZSTD);
                encode_varint(out, name_idx);
                encode_varint(out, value.len() as u64);
                encode_varint(out, stored.len() as u64);
                out.put_slice(&stored);
            }
            None => {
                out.put_u8(EXT_LARGE);
                encode_varint(out, name_idx);
                encode_varint(out, value.len() as u64);
                out.put_slice(value);
            }
        }
        self.extents += 1;
        Ok(())
    }

    fn maybe_compress(&self, payload: &[u8]) -> CodecResult<Option<Vec<u8>>> {
        if payload.len() < self.options.compress_threshold {
            return Ok(None);
        }
        let compressed = zstd::encode_all(payload, self.options.zstd_level)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok((compressed.len() < payload.len()).then_some(compressed))
    }

    fn emit_compounds(&mut self, i: usize, out: &mut BytesMut) -> CodecResult<()> {
        let serializer = self.plan.compounds[i].serializer.clone();
        let name_idx = self.name_index(serializer.name(), out);
        let bucket = &self.plan.compounds[i];

        let mut instances: Vec<(i64, Vec<Pair>)> = Vec::with_capacity(bucket.nodes.len());
        let mut freqs: HashMap<Pair, u64> = HashMap::new();
        let mut prev: Option<Vec<usize>> = None;
        for id in &bucket.nodes {
            let own = self.plan.index_of(&Value::Node(*id))?;
            let deps = self.plan.dep_indices(*id)?;
            let prev_len = prev.as_ref().map_or(0, Vec::len);
            let count_delta = deps.len() as i64 - prev_len as i64;

            let mut pairs: Vec<Pair> = Vec::new();
            for slot in 0..deps.len() {
                let base = slot_base(prev.as_deref(), &deps, slot, own);
                let delta = deps[slot] as i64 - base as i64;
                match pairs.last_mut() {
                    Some(last) if last.delta == delta => last.run += 1,
                    _ => pairs.push(Pair { run: 1, delta }),
                }
            }
            for p in &pairs {
                *freqs.entry(*p).or_insert(0) += 1;
            }
            instances.push((count_delta, pairs));
            prev = Some(deps);
        }

        let codes = if freqs.is_empty() {
            HashMap::new()
        } else {
            let tree = Tree::build(&freqs)?;
            let mut w = BitWriter::new();
            tree.write(&mut w)?;
            let table = w.finish();
            out.put_u8(EXT_HUFFMAN);
            encode_varint(out, table.len() as u64);
            out.put_slice(&table);
            self.extents += 1;
            tree.codes()?
        };

        let mut w = BitWriter::new();
        for (count_delta, pairs) in &instances {
            w.write_var(zigzag(*count_delta))?;
            for p in pairs {
                let (bits, len) = codes
                    .get(p)
                    .ok_or_else(|| CodecError::Invariant("pair missing from Huffman table".into()))?;
                w.write_bits(*bits, *len);
            }
        }
        let body = w.finish();
        out.put_u8(EXT_COMPOUNDS);
        encode_varint(out, name_idx);
        encode_varint(out, instances.len() as u64);
        encode_varint(out, body.len() as u64);
        out.put_slice(&body);
        self.extents += 1;
        Ok(())
    }
}

/// Encode with the process-wide registry and default options.
pub fn to_bytes(graph: &Graph, root: &Value) -> CodecResult<Bytes> {
    to_bytes_with(&snapshot(), &EncodeOptions::default(), graph, root)
}

pub fn to_bytes_with(
    registry: &Registry,
    options: &EncodeOptions,
    graph: &Graph,
    root: &Value,
) -> CodecResult<Bytes> {
    let mut encoder = Encoder::new(registry, options.clone(), graph, root)?;
    let mut out = BytesMut::new();
    while encoder.emit_next(&mut out)? {}
    Ok(out.freeze())
}

pub fn encode_fragment(fragment: &Fragment) -> CodecResult<Bytes> {
    to_bytes(&fragment.graph, &fragment.value)
}

/// Encode into a stream writer, letting it flush between extents. The
/// writer is left open.
pub async fn encode(graph: &Graph, root: &Value, writer: &mut StreamWriter) -> CodecResult<()> {
    let encoder = Encoder::new(&snapshot(), EncodeOptions::default(), graph, root)?;
    drive(encoder, writer).await
}

pub async fn encode_with(
    registry: &Registry,
    options: &EncodeOptions,
    graph: &Graph,
    root: &Value,
    writer: &mut StreamWriter,
) -> CodecResult<()> {
    let encoder = Encoder::new(registry, options.clone(), graph, root)?;
    drive(encoder, writer).await
}

async fn drive(mut encoder: Encoder, writer: &mut StreamWriter) -> CodecResult<()> {
    loop {
        let more = encoder.emit_next(writer.buffer_mut())?;
        writer.maybe_flush().await?;
        if !more {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn header_and_eof_frame_the_output() {
        let bytes = to_bytes(&Graph::new(), &Value::Int(7)).unwrap();
        assert_eq!(&bytes[..4], b"STRG");
        assert_eq!(bytes[4], VERSION);
        assert_eq!(*bytes.last().unwrap(), EXT_EOF);
        // names "int.u8", then a one-value primitive list
        assert_eq!(bytes[5], EXT_NAMES);
    }

    #[test]
    fn post_order_puts_a_structured_root_last() {
        let frag = Fragment::from_json(&json!({"k": [{"x": 1}], "j": [2]}));
        let plan = Plan::build(&snapshot(), &frag.graph, &frag.value).unwrap();
        assert_eq!(plan.root + 1, plan.total);
        let bytes = encode_fragment(&frag).unwrap();
        assert_eq!(bytes[bytes.len() - 1], EXT_EOF);
    }

    #[test]
    fn sequential_lists_share_one_symbol() {
        // a run of arrays each holding the previous one compresses to one pair kind
        let mut g = Graph::new();
        let mut prev = g.array(vec![]);
        for _ in 0..50 {
            prev = g.array(vec![prev]);
        }
        let small = to_bytes(&g, &prev).unwrap();
        assert!(small.len() < 80, "encoded {} bytes", small.len());
    }

    #[test]
    fn compressible_binaries_shrink() {
        let mut g = Graph::new();
        let blob = Value::from(vec![0u8; 64 * 1024]);
        let root = g.array(vec![blob]);
        let bytes = to_bytes(&g, &root).unwrap();
        assert!(bytes.len() < 4096);
    }

    #[test]
    fn alloc_dependency_after_dependent_is_invariant() {
        use strand_types::{Node, NodeData};

        use crate::registry::{CompoundSerializer, Serializer};

        /// Needs its first field to exist before it can be allocated.
        struct Linked;
        impl CompoundSerializer for Linked {
            fn name(&self) -> &str {
                "test.linked"
            }
            fn alloc(&self) -> usize {
                1
            }
            fn lower(&self, node: &Node) -> CodecResult<Vec<Value>> {
                match &node.data {
                    NodeData::Fields(items) => Ok(items.clone()),
                    _ => Err(CodecError::Malformed("not linked".into())),
                }
            }
            fn preallocate(&self, _: &[Value]) -> CodecResult<Node> {
                Ok(Node::pending("test.linked"))
            }
            fn finish(&self, node: &mut Node, deps: &[Value]) -> CodecResult<()> {
                node.data = NodeData::Fields(deps.to_vec());
                Ok(())
            }
        }

        let mut reg = Registry::with_builtins();
        reg.insert(Serializer::compound(Linked));
        let mut g = Graph::new();
        let a = g.alloc(Node::new("test.linked", NodeData::Fields(vec![])));
        let b = g.alloc(Node::new("test.linked", NodeData::Fields(vec![Value::Node(a)])));
        if let Some(n) = g.get_mut(a) {
            n.data = NodeData::Fields(vec![Value::Node(b)]);
        }
        // a two-node cycle through the allocation slot cannot be ordered
        let err = to_bytes_with(&reg, &EncodeOptions::default(), &g, &Value::Node(b));
        assert!(matches!(err, Err(CodecError::Invariant(_))));
    }
}
