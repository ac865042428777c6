//! Delta batches on the wire.
//!
//! A batch is one encoded graph: an array of `strand.delta` records, each
//! `[op, target, path, physical_ms, logical, has_value, value]`. Paths are
//! arrays of string keys and integer indices. Values are absorbed into the
//! batch graph, so they share its name table and Huffman tables.

use bytes::Bytes;
use strand_types::{
    tags, Delta, DeltaOp, Fragment, Graph, LogicalTime, Node, NodeData, PathSeg, RecordId, Value,
};

use crate::copy::copy;
use crate::decoder::from_bytes;
use crate::encoder::to_bytes;
use crate::error::{CodecError, CodecResult};

const FIELD_COUNT: usize = 7;

pub fn encode_batch(deltas: &[Delta]) -> CodecResult<Bytes> {
    let mut g = Graph::new();
    let mut records = Vec::with_capacity(deltas.len());
    for delta in deltas {
        let segs = delta
            .path
            .iter()
            .map(|seg| match seg {
                PathSeg::Key(k) => Ok(Value::str(k)),
                PathSeg::Index(i) => i64::try_from(*i)
                    .map(Value::Int)
                    .map_err(|_| malformed("path index out of range")),
            })
            .collect::<CodecResult<Vec<_>>>()?;
        let path = g.array(segs);
        let value = match &delta.value {
            Some(fragment) => g.absorb(fragment),
            None => Value::Null,
        };
        let fields = vec![
            Value::Int(delta.op.code()),
            Value::str(delta.target.as_str()),
            path,
            Value::Int(
                i64::try_from(delta.time.physical_ms)
                    .map_err(|_| malformed("physical time out of range"))?,
            ),
            Value::Int(i64::from(delta.time.logical)),
            Value::Bool(delta.value.is_some()),
            value,
        ];
        records.push(Value::Node(g.alloc(Node::new(tags::DELTA, NodeData::Fields(fields)))));
    }
    let root = g.array(records);
    to_bytes(&g, &root)
}

pub fn decode_batch(input: &[u8]) -> CodecResult<Vec<Delta>> {
    let batch = from_bytes(input)?;
    let items = match node_data(&batch.graph, &batch.value)? {
        NodeData::Array(items) => items,
        _ => return Err(malformed("batch root is not an array")),
    };
    items
        .iter()
        .map(|item| delta_from(&batch, item))
        .collect()
}

fn delta_from(batch: &Fragment, item: &Value) -> CodecResult<Delta> {
    let fields = match node_data(&batch.graph, item)? {
        NodeData::Fields(fields) if fields.len() == FIELD_COUNT => fields,
        _ => return Err(malformed("batch entry is not a delta record")),
    };
    let int = |i: usize, what: &str| {
        fields[i]
            .as_int()
            .ok_or_else(|| malformed(&format!("{what} is not an integer")))
    };

    let op = DeltaOp::from_code(int(0, "op")?).ok_or_else(|| malformed("unknown op code"))?;
    let target = fields[1]
        .as_str()
        .map(RecordId::new)
        .ok_or_else(|| malformed("target is not a string"))?;
    let path = match node_data(&batch.graph, &fields[2])? {
        NodeData::Array(segs) => segs
            .iter()
            .map(|seg| match seg {
                Value::Str(k) => Ok(PathSeg::Key(k.to_string())),
                Value::Int(i) => usize::try_from(*i)
                    .map(PathSeg::Index)
                    .map_err(|_| malformed("bad path index")),
                _ => Err(malformed("bad path segment")),
            })
            .collect::<CodecResult<Vec<_>>>()?,
        _ => return Err(malformed("path is not an array")),
    };
    let physical = u64::try_from(int(3, "physical time")?)
        .map_err(|_| malformed("physical time out of range"))?;
    let logical = u32::try_from(int(4, "logical time")?)
        .map_err(|_| malformed("logical time out of range"))?;
    let time = LogicalTime::new(physical, logical);
    let value = match fields[5].as_bool() {
        Some(true) => Some(copy(&batch.graph, &fields[6])?),
        Some(false) => None,
        None => return Err(malformed("has_value is not a bool")),
    };
    Ok(Delta {
        target,
        op,
        path,
        value,
        time,
    })
}

fn node_data<'g>(graph: &'g Graph, value: &Value) -> CodecResult<&'g NodeData> {
    let id = value.as_node().ok_or_else(|| malformed("expected a node"))?;
    graph
        .get(id)
        .map(|n| &n.data)
        .ok_or_else(|| malformed("dangling node"))
}

fn malformed(reason: &str) -> CodecError {
    CodecError::Malformed(format!("delta batch: {reason}"))
}
