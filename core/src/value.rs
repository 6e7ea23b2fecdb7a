//! Owned value model of the wire format

use std::collections::BTreeMap;

pub type Array = Vec<Value>;
pub type Map = BTreeMap<String, Value>;

/// Raw bytes, distinct from `Vec<Value>` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    #[inline]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Bytes {
    #[inline]
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    #[inline]
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl std::ops::Deref for Bytes {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// A value that can be written to or read from a stream body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    Array(Array),
    Map(Map),
}

impl Value {
    /// Type name used in signature and mismatch messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => TYPE_NIL,
            Value::Bool(_) => TYPE_BOOL,
            Value::Int64(_) => TYPE_INT64,
            Value::Uint64(_) => TYPE_UINT64,
            Value::Float64(_) => TYPE_FLOAT64,
            Value::String(_) => TYPE_STRING,
            Value::Bytes(_) => TYPE_BYTES,
            Value::Array(_) => TYPE_ARRAY,
            Value::Map(_) => TYPE_MAP,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

pub const TYPE_NIL: &str = "<nil>";
pub const TYPE_BOOL: &str = "rpc.Bool";
pub const TYPE_INT64: &str = "rpc.Int64";
pub const TYPE_UINT64: &str = "rpc.Uint64";
pub const TYPE_FLOAT64: &str = "rpc.Float64";
pub const TYPE_STRING: &str = "rpc.String";
pub const TYPE_BYTES: &str = "rpc.Bytes";
pub const TYPE_ARRAY: &str = "rpc.Array";
pub const TYPE_MAP: &str = "rpc.Map";
pub const TYPE_RT_VALUE: &str = "rpc.RTValue";
pub const TYPE_RT_ARRAY: &str = "rpc.RTArray";
pub const TYPE_RT_MAP: &str = "rpc.RTMap";

macro_rules! impl_from {
    ($t: ty, $variant: ident, $conv: ty) => {
        impl From<$t> for Value {
            #[inline]
            fn from(v: $t) -> Self {
                Value::$variant(v as $conv)
            }
        }
    };
}

impl_from!(i8, Int64, i64);
impl_from!(i16, Int64, i64);
impl_from!(i32, Int64, i64);
impl_from!(i64, Int64, i64);
impl_from!(isize, Int64, i64);
impl_from!(u8, Uint64, u64);
impl_from!(u16, Uint64, u64);
impl_from!(u32, Uint64, u64);
impl_from!(u64, Uint64, u64);
impl_from!(usize, Uint64, u64);
impl_from!(f32, Float64, f64);
impl_from!(f64, Float64, f64);

impl From<()> for Value {
    #[inline]
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    #[inline]
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Bytes> for Value {
    #[inline]
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Array> for Value {
    #[inline]
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<Map> for Value {
    #[inline]
    fn from(v: Map) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    #[inline]
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Nil,
        }
    }
}
