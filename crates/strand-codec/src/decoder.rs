//! Resumable decoder.
//!
//! Decoding is a queue of [`Step`]s. Each step looks at the unconsumed input
//! and either consumes a prefix (optionally scheduling follow-up steps) or
//! reports how many bytes it needs before it can make progress. A step that
//! asks for more input leaves the decoder untouched, so the same step can be
//! retried once the reader has pulled more bytes.
//!
//! Compound nodes are built in two phases: a shell is allocated as soon as
//! its instance is read (so later values may reference it) and finished at
//! the end marker, once every index in the stream has a value.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use strand_stream::{decode_varint, unzigzag, StreamError, StreamReader};
use strand_types::{Fragment, Graph, NodeId, Value};
use tracing::{debug, trace};

use crate::bits::BitReader;
use crate::error::{CodecError, CodecResult};
use crate::format::*;
use crate::huffman::Tree;
use crate::registry::{snapshot, CompoundSerializer, PrimitiveSerializer, Registry, Serializer};

enum Step {
    Header,
    Extent,
    Names,
    PrimHeader,
    PrimValues {
        serializer: Arc<dyn PrimitiveSerializer>,
        remaining: u64,
    },
    BinaryHeader {
        zstd: bool,
    },
    LargeHeader {
        zstd: bool,
    },
    BinaryPayload {
        lens: Vec<usize>,
        stored: Option<usize>,
    },
    Huffman,
    Compounds,
    Root,
    Finish,
}

enum Outcome {
    Done(usize),
    Then(usize, Vec<Step>),
    Need(usize),
}

/// What one call to [`Decoder::advance`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The given number of input bytes were consumed.
    Consumed(usize),
    /// At least this many bytes must be available before retrying.
    Need(usize),
    Finished,
}

struct Unfinished {
    serializer: Arc<dyn CompoundSerializer>,
    node: NodeId,
    deps: Vec<usize>,
}

/// Reads the position-tracked fields at the front of an extent.
struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
    /// Exact input length a failed `take` asked for.
    want: Option<usize>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            want: None,
        }
    }

    fn varint(&mut self) -> CodecResult<Option<u64>> {
        Ok(decode_varint(&self.input[self.pos..])?.map(|(v, used)| {
            self.pos += used;
            v
        }))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let Some(slice) = self.input.get(self.pos..end) else {
            self.want = Some(end);
            return None;
        };
        self.pos = end;
        Some(slice)
    }

    fn cstr(&mut self) -> Option<&'a [u8]> {
        let rest = &self.input[self.pos..];
        let end = rest.iter().position(|b| *b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    /// Outcome for a field that runs past the end of the input.
    fn short(&self) -> Outcome {
        Outcome::Need(self.want.unwrap_or(self.input.len() + 1))
    }
}

fn byte_len(len: u64, what: &str) -> CodecResult<usize> {
    usize::try_from(len).map_err(|_| CodecError::Malformed(format!("{what}: length {len} out of range")))
}

fn bounded(count: u64, what: &str) -> CodecResult<usize> {
    if count > MAX_LIST_LEN {
        return Err(CodecError::Malformed(format!("{what}: count {count} too large")));
    }
    Ok(count as usize)
}

/// Incremental graph decoder driven by [`from_bytes`] and [`decode`].
pub struct Decoder<'r> {
    registry: &'r Registry,
    queue: VecDeque<Step>,
    names: Vec<Serializer>,
    values: Vec<Value>,
    graph: Graph,
    tree: Option<Tree>,
    unfinished: Vec<Unfinished>,
    root_offset: usize,
    output: Option<Fragment>,
}

impl<'r> Decoder<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            queue: VecDeque::from([Step::Header]),
            names: Vec::new(),
            values: Vec::new(),
            graph: Graph::new(),
            tree: None,
            unfinished: Vec::new(),
            root_offset: 0,
            output: None,
        }
    }

    /// Run one step against the unconsumed input.
    pub fn advance(&mut self, input: &[u8]) -> CodecResult<Progress> {
        let Some(step) = self.queue.pop_front() else {
            return Ok(Progress::Finished);
        };
        match self.run(&step, input)? {
            Outcome::Need(n) => {
                self.queue.push_front(step);
                Ok(Progress::Need(n))
            }
            Outcome::Done(used) => Ok(Progress::Consumed(used)),
            Outcome::Then(used, next) => {
                for s in next.into_iter().rev() {
                    self.queue.push_front(s);
                }
                Ok(Progress::Consumed(used))
            }
        }
    }

    /// The decoded value, once [`advance`](Self::advance) reported
    /// [`Progress::Finished`].
    pub fn into_fragment(self) -> CodecResult<Fragment> {
        self.output
            .ok_or_else(|| CodecError::Invariant("decoder has not reached the end marker".into()))
    }

    fn run(&mut self, step: &Step, input: &[u8]) -> CodecResult<Outcome> {
        match step {
            Step::Header => self.header(input),
            Step::Extent => self.extent(input),
            Step::Names => self.names(input),
            Step::PrimHeader => self.prim_header(input),
            Step::PrimValues {
                serializer,
                remaining,
            } => self.prim_values(serializer, *remaining, input),
            Step::BinaryHeader { zstd } => self.binary_header(*zstd, input),
            Step::LargeHeader { zstd } => self.large_header(*zstd, input),
            Step::BinaryPayload { lens, stored } => self.binary_payload(lens, *stored, input),
            Step::Huffman => self.huffman(input),
            Step::Compounds => self.compounds(input),
            Step::Root => self.root(input),
            Step::Finish => self.finish(),
        }
    }

    fn header(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let Some(head) = input.get(..5) else {
            return Ok(Outcome::Need(5));
        };
        let magic = [head[0], head[1], head[2], head[3]];
        if magic != MAGIC {
            return Err(CodecError::InvalidMagic(magic));
        }
        if head[4] != VERSION {
            return Err(CodecError::UnsupportedVersion(head[4]));
        }
        Ok(Outcome::Then(5, vec![Step::Extent]))
    }

    fn extent(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let Some(&tag) = input.first() else {
            return Ok(Outcome::Need(1));
        };
        let step = match tag {
            EXT_EOF => return Ok(Outcome::Then(1, vec![Step::Finish])),
            EXT_NAMES => Step::Names,
            EXT_PRIMITIVES => Step::PrimHeader,
            EXT_BINARY => Step::BinaryHeader { zstd: false },
            EXT_BINARY_ZSTD => Step::BinaryHeader { zstd: true },
            EXT_LARGE => Step::LargeHeader { zstd: false },
            EXT_LARGE_ZSTD => Step::LargeHeader { zstd: true },
            EXT_HUFFMAN => Step::Huffman,
            EXT_COMPOUNDS => Step::Compounds,
            EXT_ROOT => Step::Root,
            other => return Err(CodecError::UnknownExtent(other)),
        };
        trace!(tag, values = self.values.len(), "extent");
        Ok(Outcome::Then(1, vec![step, Step::Extent]))
    }

    fn names(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let Some(count) = cur.varint()? else {
            return Ok(cur.short());
        };
        let count = bounded(count, "name table")?;
        let mut raw = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let Some(name) = cur.cstr() else {
                return Ok(cur.short());
            };
            raw.push(name);
        }
        for name in raw {
            let name = std::str::from_utf8(name)
                .map_err(|e| CodecError::Malformed(format!("type name: {e}")))?;
            let serializer = self
                .registry
                .get(name)
                .ok_or_else(|| CodecError::UnknownType(name.to_string()))?;
            self.names.push(serializer.clone());
        }
        Ok(Outcome::Done(cur.pos))
    }

    fn named(&self, idx: u64) -> CodecResult<&Serializer> {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.names.get(i))
            .ok_or(CodecError::UnknownTypeIndex(idx))
    }

    fn primitive(&self, idx: u64, binary: bool) -> CodecResult<Arc<dyn PrimitiveSerializer>> {
        match self.named(idx)? {
            Serializer::Primitive(s) if s.binary() == binary => Ok(s.clone()),
            other => Err(CodecError::Malformed(format!(
                "serializer {} does not fit this extent",
                other.name()
            ))),
        }
    }

    fn prim_header(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let (Some(idx), Some(count)) = (cur.varint()?, cur.varint()?) else {
            return Ok(cur.short());
        };
        let serializer = self.primitive(idx, false)?;
        if count == 0 {
            return Ok(Outcome::Done(cur.pos));
        }
        Ok(Outcome::Then(
            cur.pos,
            vec![Step::PrimValues {
                serializer,
                remaining: count,
            }],
        ))
    }

    /// Reads as many values as the input holds; the rest are rescheduled.
    fn prim_values(
        &mut self,
        serializer: &Arc<dyn PrimitiveSerializer>,
        remaining: u64,
        input: &[u8],
    ) -> CodecResult<Outcome> {
        let mut pos = 0;
        let mut read = 0u64;
        while read < remaining {
            match serializer.read(&input[pos..])? {
                Some((value, used)) => {
                    self.values.push(value);
                    pos += used;
                    read += 1;
                }
                None => break,
            }
        }
        if read == 0 {
            let need = serializer
                .fixed_size()
                .unwrap_or(input.len() + 1)
                .max(input.len() + 1);
            return Ok(Outcome::Need(need));
        }
        if read < remaining {
            return Ok(Outcome::Then(
                pos,
                vec![Step::PrimValues {
                    serializer: serializer.clone(),
                    remaining: remaining - read,
                }],
            ));
        }
        Ok(Outcome::Done(pos))
    }

    fn binary_header(&mut self, zstd: bool, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let (Some(idx), Some(count)) = (cur.varint()?, cur.varint()?) else {
            return Ok(cur.short());
        };
        self.primitive(idx, true)?;
        let count = bounded(count, "binary list")?;
        let mut lens = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let Some(len) = cur.varint()? else {
                return Ok(cur.short());
            };
            lens.push(byte_len(len, "binary list")?);
        }
        let stored = if zstd {
            let Some(stored) = cur.varint()? else {
                return Ok(cur.short());
            };
            Some(byte_len(stored, "compressed payload")?)
        } else {
            None
        };
        Ok(Outcome::Then(cur.pos, vec![Step::BinaryPayload { lens, stored }]))
    }

    fn large_header(&mut self, zstd: bool, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let (Some(idx), Some(len)) = (cur.varint()?, cur.varint()?) else {
            return Ok(cur.short());
        };
        self.primitive(idx, true)?;
        let stored = if zstd {
            let Some(stored) = cur.varint()? else {
                return Ok(cur.short());
            };
            Some(byte_len(stored, "compressed payload")?)
        } else {
            None
        };
        Ok(Outcome::Then(
            cur.pos,
            vec![Step::BinaryPayload {
                lens: vec![byte_len(len, "binary payload")?],
                stored,
            }],
        ))
    }

    fn binary_payload(
        &mut self,
        lens: &[usize],
        stored: Option<usize>,
        input: &[u8],
    ) -> CodecResult<Outcome> {
        let raw_len = lens
            .iter()
            .try_fold(0usize, |acc, l| acc.checked_add(*l))
            .ok_or_else(|| CodecError::Malformed("binary lengths overflow".into()))?;
        let wire_len = stored.unwrap_or(raw_len);
        let Some(wire) = input.get(..wire_len) else {
            return Ok(Outcome::Need(wire_len));
        };
        let payload = match stored {
            Some(_) => {
                let data =
                    zstd::decode_all(wire).map_err(|e| CodecError::Compression(e.to_string()))?;
                if data.len() != raw_len {
                    return Err(CodecError::Malformed(format!(
                        "decompressed {} bytes, expected {raw_len}",
                        data.len()
                    )));
                }
                Bytes::from(data)
            }
            None => Bytes::copy_from_slice(wire),
        };
        let mut offset = 0;
        for len in lens {
            self.values.push(Value::Bytes(payload.slice(offset..offset + len)));
            offset += len;
        }
        Ok(Outcome::Done(wire_len))
    }

    fn framed<'a>(cur: &mut Cursor<'a>) -> CodecResult<Option<&'a [u8]>> {
        let Some(len) = cur.varint()? else {
            return Ok(None);
        };
        Ok(usize::try_from(len).ok().and_then(|len| cur.take(len)))
    }

    fn huffman(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let Some(body) = Self::framed(&mut cur)? else {
            return Ok(cur.short());
        };
        self.tree = Some(Tree::read(&mut BitReader::new(body))?);
        Ok(Outcome::Done(cur.pos))
    }

    fn compounds(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let (Some(idx), Some(count)) = (cur.varint()?, cur.varint()?) else {
            return Ok(cur.short());
        };
        let Some(body) = Self::framed(&mut cur)? else {
            return Ok(cur.short());
        };
        let serializer = match self.named(idx)? {
            Serializer::Compound(s) => s.clone(),
            other => {
                return Err(CodecError::Malformed(format!(
                    "primitive serializer {} names a compound list",
                    other.name()
                )))
            }
        };
        let count = bounded(count, "compound list")?;
        let alloc = serializer.alloc();

        let mut bits = BitReader::new(body);
        let mut prev: Option<Vec<usize>> = None;
        for _ in 0..count {
            let own = self.values.len();
            let prev_len = prev.as_ref().map_or(0, Vec::len) as i64;
            let len = prev_len + unzigzag(bits.read_var()?);
            if len < 0 || len as u64 > MAX_LIST_LEN {
                return Err(CodecError::Malformed(format!("instance length {len}")));
            }
            let len = len as usize;

            let mut deps: Vec<usize> = Vec::with_capacity(len.min(1024));
            while deps.len() < len {
                let tree = self.tree.as_ref().ok_or_else(|| {
                    CodecError::Malformed("compound list before any Huffman table".into())
                })?;
                let pair = tree.decode(&mut bits)?;
                if pair.run > (len - deps.len()) as u64 {
                    return Err(CodecError::Malformed("run overflows instance".into()));
                }
                for _ in 0..pair.run {
                    let base = slot_base(prev.as_deref(), &deps, deps.len(), own) as i64;
                    let dep = base + pair.delta;
                    if dep < 0 {
                        return Err(CodecError::Malformed(format!("negative reference {dep}")));
                    }
                    deps.push(dep as usize);
                }
            }

            if deps.len() < alloc {
                return Err(CodecError::Malformed(format!(
                    "{}: {} dependencies, alloc arity {alloc}",
                    serializer.name(),
                    deps.len()
                )));
            }
            let mut alloc_values = Vec::with_capacity(alloc);
            for &dep in &deps[..alloc] {
                if dep >= own {
                    return Err(CodecError::Malformed(format!(
                        "{}: allocation dependency {dep} not yet decoded",
                        serializer.name()
                    )));
                }
                alloc_values.push(self.values[dep].clone());
            }
            let shell = serializer.preallocate(&alloc_values)?;
            let node = self.graph.alloc(shell);
            self.values.push(Value::Node(node));
            self.unfinished.push(Unfinished {
                serializer: serializer.clone(),
                node,
                deps: deps.clone(),
            });
            prev = Some(deps);
        }
        Ok(Outcome::Done(cur.pos))
    }

    fn root(&mut self, input: &[u8]) -> CodecResult<Outcome> {
        let mut cur = Cursor::new(input);
        let Some(offset) = cur.varint()? else {
            return Ok(cur.short());
        };
        self.root_offset = usize::try_from(offset)
            .map_err(|_| CodecError::Malformed(format!("root offset {offset}")))?;
        Ok(Outcome::Done(cur.pos))
    }

    fn finish(&mut self) -> CodecResult<Outcome> {
        let total = self.values.len();
        for pending in std::mem::take(&mut self.unfinished) {
            let deps = pending
                .deps
                .iter()
                .map(|&i| {
                    self.values.get(i).cloned().ok_or_else(|| {
                        CodecError::Malformed(format!("reference {i} beyond {total} values"))
                    })
                })
                .collect::<CodecResult<Vec<_>>>()?;
            let node = self
                .graph
                .get_mut(pending.node)
                .ok_or_else(|| CodecError::Invariant("preallocated node missing".into()))?;
            pending.serializer.finish(node, &deps)?;
        }

        let root = total
            .checked_sub(1)
            .and_then(|last| last.checked_sub(self.root_offset))
            .ok_or_else(|| {
                CodecError::Malformed(format!(
                    "root offset {} with {total} values",
                    self.root_offset
                ))
            })?;
        debug!(values = total, nodes = self.graph.len(), "graph decoded");
        let graph = std::mem::take(&mut self.graph);
        self.output = Some(Fragment::new(graph, self.values[root].clone()));
        Ok(Outcome::Done(0))
    }
}

/// Decode a complete encoding with the process-wide registry.
pub fn from_bytes(input: &[u8]) -> CodecResult<Fragment> {
    from_bytes_with(&snapshot(), input)
}

/// Decode a complete encoding. Trailing bytes after the end marker are an
/// error.
pub fn from_bytes_with(registry: &Registry, input: &[u8]) -> CodecResult<Fragment> {
    let mut decoder = Decoder::new(registry);
    let mut pos = 0;
    loop {
        match decoder.advance(&input[pos..])? {
            Progress::Consumed(n) => pos += n,
            Progress::Need(needed) => {
                return Err(StreamError::Underflow {
                    needed,
                    available: input.len() - pos,
                }
                .into())
            }
            Progress::Finished => break,
        }
    }
    if pos != input.len() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes",
            input.len() - pos
        )));
    }
    decoder.into_fragment()
}

/// Decode one graph from a stream, pulling input only when a step needs it.
/// Bytes after the end marker stay in the reader.
pub async fn decode(reader: &mut StreamReader) -> CodecResult<Fragment> {
    let registry = snapshot();
    decode_with(&registry, reader).await
}

pub async fn decode_with(registry: &Registry, reader: &mut StreamReader) -> CodecResult<Fragment> {
    let mut decoder = Decoder::new(registry);
    loop {
        match decoder.advance(reader.peek())? {
            Progress::Consumed(n) => reader.consume(n)?,
            Progress::Need(needed) => {
                if !reader.ensure_read(needed).await? {
                    let available = reader.available();
                    return Err(if available == 0 {
                        StreamError::Closed
                    } else {
                        StreamError::Underflow { needed, available }
                    }
                    .into());
                }
            }
            Progress::Finished => return decoder.into_fragment(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use strand_stream::passthrough;
    use strand_types::{tags, Node, NodeData};

    use super::*;
    use crate::builtins::RecordSerializer;
    use crate::encoder::{encode, encode_fragment, to_bytes, to_bytes_with};

    fn roundtrip(frag: &Fragment) -> Fragment {
        let bytes = encode_fragment(frag).unwrap();
        from_bytes(&bytes).unwrap()
    }

    #[test]
    fn scalar_roots() {
        for v in [
            Value::Null,
            Value::Bool(false),
            Value::Int(-9),
            Value::Int(1 << 40),
            Value::Float(3.5),
            Value::str("solo"),
            Value::from(vec![1u8, 2, 3]),
        ] {
            let out = roundtrip(&Fragment::scalar(v.clone()));
            assert!(out.value.same_primitive(&v), "{v:?}");
        }
    }

    #[test]
    fn nested_json() {
        let frag = Fragment::from_json(&json!({
            "name": "strand",
            "tags": ["a", "b", "a"],
            "nested": {"deep": [1, 2.5, null, true, {"x": -4}]},
            "empty": {},
            "none": []
        }));
        let out = roundtrip(&frag);
        assert!(out.structurally_eq(&frag));
        assert_eq!(out.to_json().unwrap(), frag.to_json().unwrap());
    }

    #[test]
    fn aliasing_survives() {
        let mut g = Graph::new();
        let shared = g.array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let root = g.object([("a", shared.clone()), ("b", shared)]);
        let out = from_bytes(&to_bytes(&g, &root).unwrap()).unwrap();

        let node = &out.graph[out.value.as_node().unwrap()];
        assert_eq!(node.field("a"), node.field("b"));
        assert_eq!(out.graph.len(), 2);
    }

    #[test]
    fn cycles_survive() {
        let mut g = Graph::new();
        let root = g.object([("name", Value::str("loop"))]);
        let id = root.as_node().unwrap();
        if let Some(Node {
            data: NodeData::Object(fields),
            ..
        }) = g.get_mut(id)
        {
            fields.push(("me".into(), root.clone()));
        }
        let out = from_bytes(&to_bytes(&g, &root).unwrap()).unwrap();
        let out_id = out.value.as_node().unwrap();
        assert_eq!(out.graph[out_id].field("me"), Some(&Value::Node(out_id)));
        assert!(structurally_equal_frag(&g, &root, &out));
    }

    fn structurally_equal_frag(g: &Graph, root: &Value, out: &Fragment) -> bool {
        strand_types::structurally_equal(g, root, &out.graph, &out.value)
    }

    #[test]
    fn reactive_ids_survive() {
        let mut g = Graph::new();
        let inner = g.alloc(
            Node::new(tags::REACTIVE_ARRAY, NodeData::Array(vec![Value::Int(5)])).with_id("arr-1"),
        );
        let root = g.alloc(
            Node::new(
                tags::REACTIVE_OBJECT,
                NodeData::Object(vec![("list".into(), Value::Node(inner))]),
            )
            .with_id("rec-1"),
        );
        let out = from_bytes(&to_bytes(&g, &Value::Node(root)).unwrap()).unwrap();
        let node = &out.graph[out.value.as_node().unwrap()];
        assert_eq!(node.id.as_deref(), Some("rec-1"));
        let list = node.field("list").and_then(Value::as_node).unwrap();
        assert_eq!(out.graph[list].id.as_deref(), Some("arr-1"));
    }

    #[test]
    fn truncation_reports_underflow() {
        let frag = Fragment::from_json(&json!({"k": [1, "two", {"three": 3}]}));
        let bytes = encode_fragment(&frag).unwrap();
        for cut in 0..bytes.len() {
            match from_bytes(&bytes[..cut]) {
                Err(CodecError::Stream(StreamError::Underflow { .. })) => {}
                other => panic!("cut at {cut}: {other:?}"),
            }
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = to_bytes(&Graph::new(), &Value::Int(1)).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(from_bytes(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn bad_magic_and_version() {
        assert!(matches!(
            from_bytes(b"NOPE\x01\x00"),
            Err(CodecError::InvalidMagic(m)) if &m == b"NOPE"
        ));
        assert!(matches!(
            from_bytes(b"STRG\x02\x00"),
            Err(CodecError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn unknown_extent_tag() {
        assert!(matches!(
            from_bytes(b"STRG\x01\x09"),
            Err(CodecError::UnknownExtent(9))
        ));
    }

    #[test]
    fn unknown_type_name_fails_at_the_name_table() {
        let mut reg = Registry::with_builtins();
        reg.insert(Serializer::compound(RecordSerializer::new("test.decoder.pt", &["x", "y"])));
        let mut g = Graph::new();
        let id = g.alloc(Node::new(
            "test.decoder.pt",
            NodeData::Fields(vec![Value::Int(1), Value::Int(2)]),
        ));
        let bytes = to_bytes_with(&reg, &Default::default(), &g, &Value::Node(id)).unwrap();

        let out = from_bytes_with(&reg, &bytes).unwrap();
        assert_eq!(
            out.graph[out.value.as_node().unwrap()].data,
            NodeData::Fields(vec![Value::Int(1), Value::Int(2)])
        );
        assert!(matches!(
            from_bytes_with(&Registry::with_builtins(), &bytes),
            Err(CodecError::UnknownType(name)) if name == "test.decoder.pt"
        ));
    }

    #[test]
    fn root_offset_selects_an_earlier_value() {
        // names [int.u8], primitives [5, 6], root one before the last
        let mut bytes = b"STRG\x01".to_vec();
        bytes.extend_from_slice(&[EXT_NAMES, 1]);
        bytes.extend_from_slice(b"int.u8\0");
        bytes.extend_from_slice(&[EXT_PRIMITIVES, 0, 2, 5, 6]);
        bytes.extend_from_slice(&[EXT_ROOT, 1, EXT_EOF]);
        assert_eq!(from_bytes(&bytes).unwrap().value, Value::Int(5));

        let offset_at = bytes.len() - 2;
        bytes[offset_at] = 7;
        assert!(matches!(from_bytes(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn binary_lists_large_values_and_compression() {
        let mut g = Graph::new();
        let small: Vec<Value> = (0..8u8).map(|i| Value::from(vec![i; 40])).collect();
        let big = Value::from((0..300u32).map(|i| (i % 7) as u8).collect::<Vec<_>>());
        let mut items = small.clone();
        items.insert(3, big.clone());
        let root = g.array(items);

        let options = EncodeOptions {
            compress_threshold: 64,
            large_payload: 256,
            zstd_level: 1,
        };
        let bytes = to_bytes_with(&Registry::with_builtins(), &options, &g, &root).unwrap();
        assert!(bytes.contains(&EXT_LARGE_ZSTD) || bytes.contains(&EXT_LARGE));
        let out = from_bytes(&bytes).unwrap();
        assert!(out.structurally_eq(&Fragment::new(g, root)));
    }

    #[tokio::test]
    async fn resumes_across_single_byte_chunks() {
        let frag = Fragment::from_json(&json!({"a": [1, 2, {"b": "c"}], "d": "e\u{0}f"}));
        let bytes = encode_fragment(&frag).unwrap();
        let chunks: Vec<Bytes> = bytes.iter().map(|b| Bytes::copy_from_slice(&[*b])).collect();

        let mut reader = StreamReader::from_chunks(chunks);
        let out = decode(&mut reader).await.unwrap();
        assert!(out.structurally_eq(&frag));
    }

    #[tokio::test]
    async fn encode_and_decode_through_a_pipe() {
        let frag = Fragment::from_json(&json!({
            "rows": (0..200).map(|i| json!({"id": i, "label": format!("row-{i}")})).collect::<Vec<_>>()
        }));
        let (mut writer, mut reader) = passthrough(64);
        let (sent, received) = tokio::join!(
            async {
                encode(&frag.graph, &frag.value, &mut writer).await?;
                writer.flush(true).await?;
                Ok::<_, CodecError>(())
            },
            decode(&mut reader)
        );
        sent.unwrap();
        assert!(received.unwrap().structurally_eq(&frag));
    }

    #[tokio::test]
    async fn two_graphs_back_to_back() {
        let a = encode_fragment(&Fragment::from_json(&json!([1]))).unwrap();
        let b = encode_fragment(&Fragment::from_json(&json!({"z": 0}))).unwrap();
        let mut reader = StreamReader::from_chunks(vec![a, b]);
        assert_eq!(decode(&mut reader).await.unwrap().to_json().unwrap(), json!([1]));
        assert_eq!(
            decode(&mut reader).await.unwrap().to_json().unwrap(),
            json!({"z": 0})
        );
        assert!(matches!(
            decode(&mut reader).await,
            Err(CodecError::Stream(StreamError::Closed))
        ));
    }

    fn json_strategy() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z\u{e9}]{0,6}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-d]{1,2}", inner, 0..5)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn json_documents_roundtrip(doc in json_strategy()) {
            let frag = Fragment::from_json(&doc);
            let out = from_bytes(&encode_fragment(&frag).unwrap()).unwrap();
            prop_assert!(out.structurally_eq(&frag));
            prop_assert_eq!(out.to_json().unwrap(), doc);
        }
    }
}
