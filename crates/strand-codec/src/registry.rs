//! Process-wide serializer registry.
//!
//! Serializers are looked up by name. Compound values name their serializer
//! through [`Node::tag`]; primitives are routed through an optional selector
//! keyed by their base kind (`"int"`, `"str"`, ...), which picks a variant
//! such as `int.u8` from the runtime value.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use bytes::BytesMut;
use strand_types::{Graph, Node, TypeError, Value};
use tracing::warn;

use crate::builtins;
use crate::error::{CodecError, CodecResult};

/// Serializer for values that reference nothing else.
pub trait PrimitiveSerializer: Send + Sync {
    fn name(&self) -> &str;

    /// Encoded width when it does not depend on the value.
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    /// Binary payloads travel in dedicated extents and are never passed to
    /// `write`/`read`.
    fn binary(&self) -> bool {
        false
    }

    fn write(&self, value: &Value, out: &mut BytesMut) -> CodecResult<()>;

    /// Parse one value from the front of `input`. `Ok(None)` means `input`
    /// ends before the value does.
    fn read(&self, input: &[u8]) -> CodecResult<Option<(Value, usize)>>;
}

/// Serializer for graph nodes, built in two phases.
///
/// `lower` flattens a node into its dependency list. Decoding first calls
/// `preallocate` with the leading `alloc()` dependencies to obtain a shell
/// that other values may already reference, then `finish` with the full
/// list once every dependency exists.
pub trait CompoundSerializer: Send + Sync {
    fn name(&self) -> &str;

    /// Number of leading dependencies `preallocate` needs.
    fn alloc(&self) -> usize {
        0
    }

    fn lower(&self, node: &Node) -> CodecResult<Vec<Value>>;

    fn preallocate(&self, alloc_deps: &[Value]) -> CodecResult<Node>;

    fn finish(&self, node: &mut Node, deps: &[Value]) -> CodecResult<()>;
}

#[derive(Clone)]
pub enum Serializer {
    Primitive(Arc<dyn PrimitiveSerializer>),
    Compound(Arc<dyn CompoundSerializer>),
}

impl Serializer {
    pub fn primitive(s: impl PrimitiveSerializer + 'static) -> Self {
        Serializer::Primitive(Arc::new(s))
    }

    pub fn compound(s: impl CompoundSerializer + 'static) -> Self {
        Serializer::Compound(Arc::new(s))
    }

    pub fn name(&self) -> &str {
        match self {
            Serializer::Primitive(s) => s.name(),
            Serializer::Compound(s) => s.name(),
        }
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Serializer::Primitive(s) => write!(f, "Primitive({})", s.name()),
            Serializer::Compound(s) => write!(f, "Compound({}, alloc {})", s.name(), s.alloc()),
        }
    }
}

/// Chooses a serializer name for a primitive from its value.
pub type Selector = Arc<dyn Fn(&Value) -> &'static str + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    serializers: HashMap<String, Serializer>,
    selectors: HashMap<&'static str, Selector>,
}

impl Registry {
    /// An empty registry, without even the built-in serializers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        builtins::install(&mut registry);
        registry
    }

    /// Add a serializer. A serializer already registered under the same name
    /// is replaced and returned.
    pub fn insert(&mut self, serializer: Serializer) -> Option<Serializer> {
        let name = serializer.name().to_string();
        let previous = self.serializers.insert(name.clone(), serializer);
        if previous.is_some() {
            warn!(name = %name, "serializer replaced");
        }
        previous
    }

    pub fn set_selector(&mut self, kind: &'static str, selector: Selector) {
        if self.selectors.insert(kind, selector).is_some() {
            warn!(kind, "selector replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Serializer> {
        self.serializers.get(name)
    }

    pub fn len(&self) -> usize {
        self.serializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }

    /// The serializer that encodes `value`.
    pub fn resolve(&self, graph: &Graph, value: &Value) -> CodecResult<&Serializer> {
        let name: &str = match value {
            Value::Node(id) => {
                let node = graph
                    .get(*id)
                    .ok_or(TypeError::DanglingNode(id.index()))?;
                node.tag.as_ref()
            }
            primitive => {
                let kind = primitive.kind_name();
                match self.selectors.get(kind) {
                    Some(select) => select(primitive),
                    None => kind,
                }
            }
        };
        self.get(name)
            .ok_or_else(|| CodecError::UnknownType(name.to_string()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.serializers.keys().collect();
        names.sort();
        f.debug_struct("Registry")
            .field("serializers", &names)
            .field("selectors", &self.selectors.len())
            .finish()
    }
}

static GLOBAL: OnceLock<RwLock<Arc<Registry>>> = OnceLock::new();

fn global() -> &'static RwLock<Arc<Registry>> {
    GLOBAL.get_or_init(|| RwLock::new(Arc::new(Registry::with_builtins())))
}

/// The current process-wide registry. Later registrations do not affect a
/// snapshot already taken.
pub fn snapshot() -> Arc<Registry> {
    global().read().expect("lock poisoned").clone()
}

/// Register a serializer process-wide, replacing one of the same name.
pub fn register(serializer: Serializer) -> Option<Serializer> {
    let mut guard = global().write().expect("lock poisoned");
    Arc::make_mut(&mut guard).insert(serializer)
}

/// Register a primitive selector process-wide.
pub fn register_selector(kind: &'static str, selector: Selector) {
    let mut guard = global().write().expect("lock poisoned");
    Arc::make_mut(&mut guard).set_selector(kind, selector);
}
