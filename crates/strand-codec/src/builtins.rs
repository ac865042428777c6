//! Built-in serializers: primitives, the plain and reactive container
//! shapes, and fixed-field records.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use strand_stream::{decode_varint, encode_varint, unzigzag, zigzag};
use strand_types::{tags, Node, NodeData, Value};

use crate::error::{CodecError, CodecResult};
use crate::registry::{CompoundSerializer, PrimitiveSerializer, Registry, Serializer};

pub(crate) fn install(registry: &mut Registry) {
    registry.insert(Serializer::primitive(NullSerializer));
    registry.insert(Serializer::primitive(BoolSerializer));
    registry.insert(Serializer::primitive(UintSerializer::new("int.u8", 1)));
    registry.insert(Serializer::primitive(UintSerializer::new("int.u16", 2)));
    registry.insert(Serializer::primitive(UintSerializer::new("int.u32", 4)));
    registry.insert(Serializer::primitive(VarIntSerializer));
    registry.insert(Serializer::primitive(FloatSerializer));
    registry.insert(Serializer::primitive(CStrSerializer));
    registry.insert(Serializer::primitive(StrSerializer));
    registry.insert(Serializer::primitive(BytesSerializer));

    registry.insert(Serializer::compound(ObjectSerializer::new(tags::OBJECT, false)));
    registry.insert(Serializer::compound(ObjectSerializer::new(tags::REACTIVE_OBJECT, true)));
    registry.insert(Serializer::compound(SequenceSerializer::new(tags::ARRAY, false)));
    registry.insert(Serializer::compound(SequenceSerializer::new(tags::REACTIVE_ARRAY, true)));
    registry.insert(Serializer::compound(SequenceSerializer::new(tags::SET, false)));
    registry.insert(Serializer::compound(MapSerializer::new(tags::MAP, false)));
    registry.insert(Serializer::compound(MapSerializer::new(tags::REACTIVE_MAP, true)));
    registry.insert(Serializer::compound(RecordSerializer::new(
        tags::DELTA,
        &["op", "target", "path", "physical", "logical", "has_value", "value"],
    )));

    registry.set_selector("int", Arc::new(select_int));
    registry.set_selector("str", Arc::new(select_str));
}

fn select_int(value: &Value) -> &'static str {
    match value.as_int() {
        Some(i) if (0..=u8::MAX as i64).contains(&i) => "int.u8",
        Some(i) if (0..=u16::MAX as i64).contains(&i) => "int.u16",
        Some(i) if (0..=u32::MAX as i64).contains(&i) => "int.u32",
        _ => "int.var",
    }
}

fn select_str(value: &Value) -> &'static str {
    match value.as_str() {
        Some(s) if s.contains('\0') => "str",
        _ => "cstr",
    }
}

fn wrong(serializer: &str, reason: impl Into<String>) -> CodecError {
    CodecError::WrongValue {
        serializer: serializer.to_string(),
        reason: reason.into(),
    }
}

struct NullSerializer;

impl PrimitiveSerializer for NullSerializer {
    fn name(&self) -> &str {
        "null"
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(0)
    }

    fn write(&self, value: &Value, _out: &mut BytesMut) -> CodecResult<()> {
        match value {
            Value::Null => Ok(()),
            other => Err(wrong("null", other.kind_name())),
        }
    }

    fn read(&self, _input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        Ok(Some((Value::Null, 0)))
    }
}

struct BoolSerializer;

impl PrimitiveSerializer for BoolSerializer {
    fn name(&self) -> &str {
        "bool"
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(1)
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        let b = value.as_bool().ok_or_else(|| wrong("bool", value.kind_name()))?;
        out.put_u8(b as u8);
        Ok(())
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        Ok(match input.first() {
            Some(0) => Some((Value::Bool(false), 1)),
            Some(1) => Some((Value::Bool(true), 1)),
            Some(b) => return Err(CodecError::Malformed(format!("bool byte {b:#x}"))),
            None => None,
        })
    }
}

/// Unsigned little-endian integer of a fixed byte width.
struct UintSerializer {
    name: &'static str,
    width: usize,
}

impl UintSerializer {
    fn new(name: &'static str, width: usize) -> Self {
        Self { name, width }
    }
}

impl PrimitiveSerializer for UintSerializer {
    fn name(&self) -> &str {
        self.name
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(self.width)
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        let i = value.as_int().ok_or_else(|| wrong(self.name, value.kind_name()))?;
        let max = (1u64 << (self.width * 8)) - 1;
        if i < 0 || i as u64 > max {
            return Err(wrong(self.name, format!("{i} out of range")));
        }
        out.put_uint_le(i as u64, self.width);
        Ok(())
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        if input.len() < self.width {
            return Ok(None);
        }
        let mut raw = [0u8; 8];
        raw[..self.width].copy_from_slice(&input[..self.width]);
        Ok(Some((Value::Int(u64::from_le_bytes(raw) as i64), self.width)))
    }
}

/// Signed integer as a zig-zag varint.
struct VarIntSerializer;

impl PrimitiveSerializer for VarIntSerializer {
    fn name(&self) -> &str {
        "int.var"
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        let i = value.as_int().ok_or_else(|| wrong("int.var", value.kind_name()))?;
        encode_varint(out, zigzag(i));
        Ok(())
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        Ok(decode_varint(input)?.map(|(v, used)| (Value::Int(unzigzag(v)), used)))
    }
}

struct FloatSerializer;

impl PrimitiveSerializer for FloatSerializer {
    fn name(&self) -> &str {
        "float"
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        match value {
            Value::Float(f) => {
                out.put_f64_le(*f);
                Ok(())
            }
            other => Err(wrong("float", other.kind_name())),
        }
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        let Some(raw) = input.get(..8) else {
            return Ok(None);
        };
        let mut bits = [0u8; 8];
        bits.copy_from_slice(raw);
        Ok(Some((Value::Float(f64::from_le_bytes(bits)), 8)))
    }
}

/// NUL-terminated UTF-8.
struct CStrSerializer;

impl PrimitiveSerializer for CStrSerializer {
    fn name(&self) -> &str {
        "cstr"
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        let s = value.as_str().ok_or_else(|| wrong("cstr", value.kind_name()))?;
        if s.contains('\0') {
            return Err(wrong("cstr", "embedded NUL"));
        }
        out.put_slice(s.as_bytes());
        out.put_u8(0);
        Ok(())
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        let Some(end) = input.iter().position(|b| *b == 0) else {
            return Ok(None);
        };
        let s = std::str::from_utf8(&input[..end])
            .map_err(|e| CodecError::Malformed(format!("cstr: {e}")))?;
        Ok(Some((Value::str(s), end + 1)))
    }
}

/// Length-prefixed UTF-8.
struct StrSerializer;

impl PrimitiveSerializer for StrSerializer {
    fn name(&self) -> &str {
        "str"
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        let s = value.as_str().ok_or_else(|| wrong("str", value.kind_name()))?;
        encode_varint(out, s.len() as u64);
        out.put_slice(s.as_bytes());
        Ok(())
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        let Some((len, head)) = decode_varint(input)? else {
            return Ok(None);
        };
        let end = span(head, len, "str")?;
        let Some(raw) = input.get(head..end) else {
            return Ok(None);
        };
        let s = std::str::from_utf8(raw).map_err(|e| CodecError::Malformed(format!("str: {e}")))?;
        Ok(Some((Value::str(s), end)))
    }
}

/// End offset of a `len`-byte body starting at `head`.
fn span(head: usize, len: u64, what: &str) -> CodecResult<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| head.checked_add(len))
        .ok_or_else(|| CodecError::Malformed(format!("{what}: length {len} out of range")))
}

/// Opaque bytes. Encoded through the binary extents; the list form below is
/// only used when a caller writes one explicitly.
struct BytesSerializer;

impl PrimitiveSerializer for BytesSerializer {
    fn name(&self) -> &str {
        "bytes"
    }

    fn binary(&self) -> bool {
        true
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()> {
        match value {
            Value::Bytes(b) => {
                encode_varint(out, b.len() as u64);
                out.put_slice(b);
                Ok(())
            }
            other => Err(wrong("bytes", other.kind_name())),
        }
    }

    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>> {
        let Some((len, head)) = decode_varint(input)? else {
            return Ok(None);
        };
        let end = span(head, len, "bytes")?;
        Ok(input
            .get(head..end)
            .map(|raw| (Value::Bytes(Bytes::copy_from_slice(raw)), end)))
    }
}

/// Leading dependency of a reactive container: its stable identifier.
fn reactive_id(name: &str, node: &Node) -> CodecResult<Value> {
    node.id
        .as_ref()
        .map(|id| Value::Str(id.clone()))
        .ok_or_else(|| wrong(name, "reactive container without an id"))
}

fn shell(tag: &str, reactive: bool, alloc_deps: &[Value]) -> CodecResult<Node> {
    let mut node = Node::pending(tag);
    if reactive {
        let id = alloc_deps
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| wrong(tag, "missing string id"))?;
        node = node.with_id(id);
    }
    Ok(node)
}

/// String-keyed objects. Dependencies are `[id?] key0 value0 key1 value1 ...`.
pub struct ObjectSerializer {
    tag: &'static str,
    reactive: bool,
}

impl ObjectSerializer {
    pub fn new(tag: &'static str, reactive: bool) -> Self {
        Self { tag, reactive }
    }
}

impl CompoundSerializer for ObjectSerializer {
    fn name(&self) -> &str {
        self.tag
    }

    fn alloc(&self) -> usize {
        self.reactive as usize
    }

    fn lower(&self, node: &Node) -> CodecResult<Vec<Value>> {
        let NodeData::Object(fields) = &node.data else {
            return Err(wrong(self.tag, "not an object"));
        };
        let mut deps = Vec::with_capacity(fields.len() * 2 + 1);
        if self.reactive {
            deps.push(reactive_id(self.tag, node)?);
        }
        for (k, v) in fields {
            deps.push(Value::Str(k.clone()));
            deps.push(v.clone());
        }
        Ok(deps)
    }

    fn preallocate(&self, alloc_deps: &[Value]) -> CodecResult<Node> {
        shell(self.tag, self.reactive, alloc_deps)
    }

    fn finish(&self, node: &mut Node, deps: &[Value]) -> CodecResult<()> {
        let body = &deps[self.alloc().min(deps.len())..];
        if body.len() % 2 != 0 {
            return Err(CodecError::Malformed(format!("{}: odd field list", self.tag)));
        }
        let mut fields = Vec::with_capacity(body.len() / 2);
        for pair in body.chunks_exact(2) {
            let Value::Str(key) = &pair[0] else {
                return Err(CodecError::Malformed(format!("{}: non-string key", self.tag)));
            };
            fields.push((key.clone(), pair[1].clone()));
        }
        node.data = NodeData::Object(fields);
        Ok(())
    }
}

/// Arrays and sets. Dependencies are `[id?] item0 item1 ...`.
pub struct SequenceSerializer {
    tag: &'static str,
    reactive: bool,
}

impl SequenceSerializer {
    pub fn new(tag: &'static str, reactive: bool) -> Self {
        Self { tag, reactive }
    }

    fn is_set(&self) -> bool {
        self.tag == tags::SET
    }
}

impl CompoundSerializer for SequenceSerializer {
    fn name(&self) -> &str {
        self.tag
    }

    fn alloc(&self) -> usize {
        self.reactive as usize
    }

    fn lower(&self, node: &Node) -> CodecResult<Vec<Value>> {
        let items = match (&node.data, self.is_set()) {
            (NodeData::Array(items), false) | (NodeData::Set(items), true) => items,
            _ => return Err(wrong(self.tag, "shape mismatch")),
        };
        let mut deps = Vec::with_capacity(items.len() + 1);
        if self.reactive {
            deps.push(reactive_id(self.tag, node)?);
        }
        deps.extend(items.iter().cloned());
        Ok(deps)
    }

    fn preallocate(&self, alloc_deps: &[Value]) -> CodecResult<Node> {
        shell(self.tag, self.reactive, alloc_deps)
    }

    fn finish(&self, node: &mut Node, deps: &[Value]) -> CodecResult<()> {
        let items = deps[self.alloc().min(deps.len())..].to_vec();
        node.data = if self.is_set() {
            NodeData::Set(items)
        } else {
            NodeData::Array(items)
        };
        Ok(())
    }
}

/// Maps with arbitrary keys. Dependencies are `[id?] key0 value0 ...`.
pub struct MapSerializer {
    tag: &'static str,
    reactive: bool,
}

impl MapSerializer {
    pub fn new(tag: &'static str, reactive: bool) -> Self {
        Self { tag, reactive }
    }
}

impl CompoundSerializer for MapSerializer {
    fn name(&self) -> &str {
        self.tag
    }

    fn alloc(&self) -> usize {
        self.reactive as usize
    }

    fn lower(&self, node: &Node) -> CodecResult<Vec<Value>> {
        let NodeData::Map(entries) = &node.data else {
            return Err(wrong(self.tag, "not a map"));
        };
        let mut deps = Vec::with_capacity(entries.len() * 2 + 1);
        if self.reactive {
            deps.push(reactive_id(self.tag, node)?);
        }
        for (k, v) in entries {
            deps.push(k.clone());
            deps.push(v.clone());
        }
        Ok(deps)
    }

    fn preallocate(&self, alloc_deps: &[Value]) -> CodecResult<Node> {
        shell(self.tag, self.reactive, alloc_deps)
    }

    fn finish(&self, node: &mut Node, deps: &[Value]) -> CodecResult<()> {
        let body = &deps[self.alloc().min(deps.len())..];
        if body.len() % 2 != 0 {
            return Err(CodecError::Malformed(format!("{}: odd entry list", self.tag)));
        }
        let entries = body
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        node.data = NodeData::Map(entries);
        Ok(())
    }
}

/// User-defined record type with a fixed list of positional fields.
///
/// ```
/// use strand_codec::{register, RecordSerializer, Serializer};
///
/// register(Serializer::compound(RecordSerializer::new("geo.point", &["lat", "lon"])));
/// ```
#[derive(Debug, Clone)]
pub struct RecordSerializer {
    name: String,
    fields: Vec<String>,
}

impl RecordSerializer {
    pub fn new(name: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }
}

impl CompoundSerializer for RecordSerializer {
    fn name(&self) -> &str {
        &self.name
    }

    fn lower(&self, node: &Node) -> CodecResult<Vec<Value>> {
        match &node.data {
            NodeData::Fields(items) if items.len() == self.fields.len() => Ok(items.clone()),
            NodeData::Fields(items) => Err(wrong(
                &self.name,
                format!("{} fields, expected {}", items.len(), self.fields.len()),
            )),
            _ => Err(wrong(&self.name, "not a record")),
        }
    }

    fn preallocate(&self, _alloc_deps: &[Value]) -> CodecResult<Node> {
        Ok(Node::pending(&self.name))
    }

    fn finish(&self, node: &mut Node, deps: &[Value]) -> CodecResult<()> {
        if deps.len() != self.fields.len() {
            return Err(CodecError::Malformed(format!(
                "{}: {} fields, expected {}",
                self.name,
                deps.len(),
                self.fields.len()
            )));
        }
        node.data = NodeData::Fields(deps.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ser: &dyn PrimitiveSerializer, value: Value) -> Value {
        let mut buf = BytesMut::new();
        ser.write(&value, &mut buf).unwrap();
        if let Some(size) = ser.fixed_size() {
            assert_eq!(buf.len(), size);
        }
        assert_eq!(ser.read(&buf[..buf.len().saturating_sub(1)]).unwrap().is_none(), !buf.is_empty());
        let (out, used) = ser.read(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        out
    }

    #[test]
    fn primitive_encodings() {
        assert_eq!(roundtrip(&BoolSerializer, Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(&UintSerializer::new("int.u16", 2), Value::Int(513)), Value::Int(513));
        assert_eq!(roundtrip(&VarIntSerializer, Value::Int(-70_000)), Value::Int(-70_000));
        assert_eq!(roundtrip(&FloatSerializer, Value::Float(-2.25)), Value::Float(-2.25));
        assert_eq!(roundtrip(&CStrSerializer, Value::str("héllo")), Value::str("héllo"));
        assert_eq!(roundtrip(&StrSerializer, Value::str("a\0b")), Value::str("a\0b"));
        assert_eq!(roundtrip(&NullSerializer, Value::Null), Value::Null);
    }

    #[test]
    fn uint_rejects_out_of_range() {
        let mut buf = BytesMut::new();
        let err = UintSerializer::new("int.u8", 1).write(&Value::Int(256), &mut buf);
        assert!(matches!(err, Err(CodecError::WrongValue { .. })));
    }

    #[test]
    fn oversized_lengths_are_malformed() {
        let mut wire = vec![0xFF; 9];
        wire.push(0x01);
        for ser in [&StrSerializer as &dyn PrimitiveSerializer, &BytesSerializer] {
            assert!(matches!(ser.read(&wire), Err(CodecError::Malformed(_))));
        }
    }

    #[test]
    fn cstr_rejects_embedded_nul() {
        let mut buf = BytesMut::new();
        assert!(CStrSerializer.write(&Value::str("a\0"), &mut buf).is_err());
    }

    #[test]
    fn reactive_object_preallocates_with_id() {
        let ser = ObjectSerializer::new(tags::REACTIVE_OBJECT, true);
        let node = Node::new(
            tags::REACTIVE_OBJECT,
            NodeData::Object(vec![(Arc::from("k"), Value::Int(1))]),
        )
        .with_id("rec-9");
        let deps = ser.lower(&node).unwrap();
        assert_eq!(deps[0], Value::str("rec-9"));

        let mut shell = ser.preallocate(&deps[..ser.alloc()]).unwrap();
        assert_eq!(shell.id.as_deref(), Some("rec-9"));
        assert_eq!(shell.data, NodeData::Pending);
        ser.finish(&mut shell, &deps).unwrap();
        assert_eq!(shell, node);
    }

    #[test]
    fn record_checks_field_count() {
        let ser = RecordSerializer::new("pt", &["x", "y"]);
        let bad = Node::new("pt", NodeData::Fields(vec![Value::Int(1)]));
        assert!(ser.lower(&bad).is_err());
        assert_eq!(ser.field_index("y"), Some(1));
    }
}
