//! Lazy views over values inside the worker's streams.
//!
//! An RT value is a position in a stream owned by the worker. Nothing is decoded
//! until asked for, and every access goes through the Runtime lock of the invocation
//! that produced it.

use crate::error::*;
use crate::runtime::Runtime;
use rtrpc_core::value::*;
use rtrpc_core::{Stream, Value};
use rustc_hash::FxHashMap;
use std::fmt;

/// (stream index in the worker arena, byte position)
type Loc = (usize, usize);

#[inline]
fn read_loc<T>(
    streams: &mut [Stream], loc: Loc, f: impl FnOnce(&mut Stream) -> Result<T, StreamError>,
) -> Result<T, StreamError> {
    match streams.get_mut(loc.0) {
        Some(s) => s.read_at(loc.1, f),
        None => Err(StreamError),
    }
}

/// Write `v` at the end of the scratch stream
#[inline]
fn pin_value(streams: &mut [Stream], v: &Value) -> Result<Loc, RpcError> {
    let scratch = &mut streams[0];
    let pos = scratch.get_write_pos();
    scratch.write(v).map_err(|e| ERR_UNSUPPORTED_VALUE.msg(e))?;
    Ok((0, pos))
}

#[derive(Clone)]
pub struct RTValue {
    rt: Runtime,
    src: usize,
    pos: usize,
}

impl fmt::Debug for RTValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RTValue({:?} {}:{})", self.rt, self.src, self.pos)
    }
}

macro_rules! rt_value_reader {
    ($name: ident, $t: ty, $want: expr, $read: ident) => {
        pub fn $name(&self) -> Result<$t, RpcError> {
            self.read($want, |s| s.$read())
        }
    };
}

impl RTValue {
    #[inline]
    pub(crate) fn new(rt: Runtime, src: usize, pos: usize) -> Self {
        Self { rt, src, pos }
    }

    #[inline(always)]
    pub(crate) fn rt(&self) -> &Runtime {
        &self.rt
    }

    #[inline(always)]
    pub(crate) fn location(&self) -> Loc {
        (self.src, self.pos)
    }

    fn read<T>(
        &self, want: &str, f: impl FnOnce(&mut Stream) -> Result<T, StreamError>,
    ) -> Result<T, RpcError> {
        let mut st = self.rt.lock_state()?;
        let streams = &mut st.streams;
        match read_loc(streams, self.location(), f) {
            Ok(v) => Ok(v),
            Err(_) => {
                let got = streams
                    .get(self.src)
                    .and_then(|s| s.type_name_at(self.pos))
                    .unwrap_or("<unknown>");
                Err(ERR_RT_VALUE_TYPE.msg(format!("{} expected, got {}", want, got)))
            }
        }
    }

    /// Type name of the underlying value
    pub fn type_name(&self) -> Result<&'static str, RpcError> {
        let st = self.rt.lock_state()?;
        match st.streams.get(self.src).and_then(|s| s.type_name_at(self.pos)) {
            Some(name) => Ok(name),
            None => Err(ERR_STREAM.msg("invalid value")),
        }
    }

    pub fn is_nil(&self) -> Result<bool, RpcError> {
        Ok(self.type_name()? == TYPE_NIL)
    }

    rt_value_reader!(to_bool, bool, TYPE_BOOL, read_bool);
    rt_value_reader!(to_int64, i64, TYPE_INT64, read_int64);
    rt_value_reader!(to_uint64, u64, TYPE_UINT64, read_uint64);
    rt_value_reader!(to_float64, f64, TYPE_FLOAT64, read_float64);
    rt_value_reader!(to_string, String, TYPE_STRING, read_string);
    rt_value_reader!(to_bytes, Bytes, TYPE_BYTES, read_bytes);
    rt_value_reader!(to_array, Array, TYPE_ARRAY, read_array);
    rt_value_reader!(to_map, Map, TYPE_MAP, read_map);

    /// Decode whatever is there
    pub fn to_value(&self) -> Result<Value, RpcError> {
        self.read("value", |s| s.read())
    }

    pub fn to_rt_array(&self) -> Result<RTArray, RpcError> {
        let src = self.src;
        let positions = self.read(TYPE_ARRAY, |s| s.read_array_positions())?;
        Ok(RTArray::from_items(self.rt.clone(), positions.into_iter().map(|p| (src, p)).collect()))
    }

    pub fn to_rt_map(&self) -> Result<RTMap, RpcError> {
        let src = self.src;
        let positions = self.read(TYPE_MAP, |s| s.read_map_positions())?;
        Ok(RTMap::from_items(self.rt.clone(), positions.into_iter().map(|(k, p)| (k, (src, p))).collect()))
    }
}

/// Array of lazy elements, new elements are written to the worker's scratch stream
#[derive(Clone)]
pub struct RTArray {
    rt: Runtime,
    items: Vec<Loc>,
}

impl fmt::Debug for RTArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RTArray({:?} len={})", self.rt, self.items.len())
    }
}

impl RTArray {
    #[inline]
    pub(crate) fn from_items(rt: Runtime, items: Vec<Loc>) -> Self {
        Self { rt, items }
    }

    #[inline(always)]
    pub(crate) fn rt(&self) -> &Runtime {
        &self.rt
    }

    #[inline]
    fn overflow(&self, index: usize) -> RpcError {
        ERR_RT_ARRAY_INDEX_OVERFLOW.msg(format!("index {} out of size {}", index, self.items.len()))
    }

    pub fn size(&self) -> Result<usize, RpcError> {
        let _st = self.rt.lock_state()?;
        Ok(self.items.len())
    }

    pub fn get(&self, index: usize) -> Result<RTValue, RpcError> {
        let _st = self.rt.lock_state()?;
        match self.items.get(index) {
            Some(&(src, pos)) => Ok(RTValue::new(self.rt.clone(), src, pos)),
            None => Err(self.overflow(index)),
        }
    }

    pub fn set<V: Into<Value>>(&mut self, index: usize, v: V) -> Result<(), RpcError> {
        let mut st = self.rt.lock_state()?;
        if index >= self.items.len() {
            return Err(self.overflow(index));
        }
        let loc = pin_value(&mut st.streams, &v.into())?;
        self.items[index] = loc;
        Ok(())
    }

    pub fn append<V: Into<Value>>(&mut self, v: V) -> Result<(), RpcError> {
        let mut st = self.rt.lock_state()?;
        let loc = pin_value(&mut st.streams, &v.into())?;
        self.items.push(loc);
        Ok(())
    }

    /// Remove the element at `index`, later elements shift down
    pub fn delete(&mut self, index: usize) -> Result<(), RpcError> {
        let _st = self.rt.lock_state()?;
        if index >= self.items.len() {
            return Err(self.overflow(index));
        }
        self.items.remove(index);
        Ok(())
    }

    /// Decode every element
    pub fn to_array(&self) -> Result<Array, RpcError> {
        let mut st = self.rt.lock_state()?;
        self.materialize(&mut st.streams)
    }

    pub(crate) fn materialize(&self, streams: &mut [Stream]) -> Result<Array, RpcError> {
        let mut out = Vec::with_capacity(self.items.len());
        for &loc in &self.items {
            out.push(read_loc(streams, loc, |s| s.read())?);
        }
        Ok(out)
    }
}

/// Map of lazy values keyed by string
#[derive(Clone)]
pub struct RTMap {
    rt: Runtime,
    items: FxHashMap<String, Loc>,
}

impl fmt::Debug for RTMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RTMap({:?} len={})", self.rt, self.items.len())
    }
}

impl RTMap {
    #[inline]
    pub(crate) fn new(rt: Runtime, cap: usize) -> Self {
        Self { rt, items: FxHashMap::with_capacity_and_hasher(cap, Default::default()) }
    }

    #[inline]
    pub(crate) fn from_items(rt: Runtime, items: Vec<(String, Loc)>) -> Self {
        Self { rt, items: items.into_iter().collect() }
    }

    #[inline(always)]
    pub(crate) fn rt(&self) -> &Runtime {
        &self.rt
    }

    #[inline]
    fn missing(key: &str) -> RpcError {
        ERR_RT_MAP_KEY_MISSING.msg(format!("key \"{}\" does not exist", key))
    }

    pub fn size(&self) -> Result<usize, RpcError> {
        let _st = self.rt.lock_state()?;
        Ok(self.items.len())
    }

    /// Sorted keys
    pub fn keys(&self) -> Result<Vec<String>, RpcError> {
        let _st = self.rt.lock_state()?;
        let mut keys: Vec<String> = self.items.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn get(&self, key: &str) -> Result<RTValue, RpcError> {
        let _st = self.rt.lock_state()?;
        match self.items.get(key) {
            Some(&(src, pos)) => Ok(RTValue::new(self.rt.clone(), src, pos)),
            None => Err(Self::missing(key)),
        }
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, v: V) -> Result<(), RpcError> {
        let mut st = self.rt.lock_state()?;
        let loc = pin_value(&mut st.streams, &v.into())?;
        self.items.insert(key.to_string(), loc);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<(), RpcError> {
        let _st = self.rt.lock_state()?;
        match self.items.remove(key) {
            Some(_) => Ok(()),
            None => Err(Self::missing(key)),
        }
    }

    pub fn to_map(&self) -> Result<Map, RpcError> {
        let mut st = self.rt.lock_state()?;
        self.materialize(&mut st.streams)
    }

    pub(crate) fn materialize(&self, streams: &mut [Stream]) -> Result<Map, RpcError> {
        let mut out = Map::new();
        for (key, &loc) in &self.items {
            out.insert(key.clone(), read_loc(streams, loc, |s| s.read())?);
        }
        Ok(out)
    }
}
