//! Value grammar of the stream body.
//!
//! Every value starts with a one byte opcode. Fixed width values are sized by the
//! opcode alone, variable width values carry a 4 byte length right after it, so any
//! value can be skipped without decoding.

use super::{Cursor, Stream};
use crate::error::StreamError;
use crate::value::*;

/// Max nesting of containers accepted by `write` and `read`
pub const MAX_VALUE_DEPTH: usize = 64;

const OP_NIL: u8 = 0x01;
const OP_TRUE: u8 = 0x02;
const OP_FALSE: u8 = 0x03;
const OP_FLOAT64_ZERO: u8 = 0x04;
const OP_FLOAT64: u8 = 0x05;
const OP_INT16: u8 = 0x06;
const OP_INT32: u8 = 0x07;
const OP_INT64: u8 = 0x08;
const OP_UINT16: u8 = 0x09;
const OP_UINT32: u8 = 0x0A;
const OP_UINT64: u8 = 0x0B;
const OP_SMALL_INT_MIN: u8 = 0x0E;
const OP_SMALL_INT_MAX: u8 = 0x35;
const SMALL_INT_BIAS: i64 = 21;
const OP_SMALL_UINT_MIN: u8 = 0x36;
const OP_SMALL_UINT_MAX: u8 = 0x3F;
const SMALL_UINT_BIAS: u64 = 54;
const OP_ARRAY: u8 = 0x40;
const OP_ARRAY_LONG: u8 = 0x5F;
const OP_MAP: u8 = 0x60;
const OP_MAP_LONG: u8 = 0x7F;
const OP_STRING: u8 = 0x80;
const OP_STRING_LONG: u8 = 0xBF;
const OP_BYTES: u8 = 0xC0;
const OP_BYTES_LONG: u8 = 0xFF;

const SHORT_LEN_MAX: usize = 62;
const SHORT_COUNT_MAX: usize = 30;

const SKIP_INVALID: u8 = 0;
const SKIP_VARIABLE: u8 = 255;

/// Bytes occupied by a value, indexed by opcode
static SKIP_TABLE: [u8; 256] = build_skip_table();

const fn build_skip_table() -> [u8; 256] {
    let mut t = [SKIP_INVALID; 256];
    t[OP_NIL as usize] = 1;
    t[OP_TRUE as usize] = 1;
    t[OP_FALSE as usize] = 1;
    t[OP_FLOAT64_ZERO as usize] = 1;
    t[OP_FLOAT64 as usize] = 9;
    t[OP_INT16 as usize] = 3;
    t[OP_INT32 as usize] = 5;
    t[OP_INT64 as usize] = 9;
    t[OP_UINT16 as usize] = 3;
    t[OP_UINT32 as usize] = 5;
    t[OP_UINT64 as usize] = 9;
    let mut op = OP_SMALL_INT_MIN as usize;
    while op <= OP_SMALL_UINT_MAX as usize {
        t[op] = 1;
        op += 1;
    }
    t[OP_ARRAY as usize] = 1;
    op = OP_ARRAY as usize + 1;
    while op <= OP_ARRAY_LONG as usize {
        t[op] = SKIP_VARIABLE;
        op += 1;
    }
    t[OP_MAP as usize] = 1;
    op = OP_MAP as usize + 1;
    while op <= OP_MAP_LONG as usize {
        t[op] = SKIP_VARIABLE;
        op += 1;
    }
    op = OP_STRING as usize;
    while op < OP_STRING_LONG as usize {
        t[op] = (op - OP_STRING as usize + 2) as u8;
        op += 1;
    }
    t[OP_STRING_LONG as usize] = SKIP_VARIABLE;
    op = OP_BYTES as usize;
    while op < OP_BYTES_LONG as usize {
        t[op] = (op - OP_BYTES as usize + 1) as u8;
        op += 1;
    }
    t[OP_BYTES_LONG as usize] = SKIP_VARIABLE;
    t
}

#[inline(always)]
fn le_u32(b: &[u8]) -> usize {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
}

impl Stream {
    #[inline]
    pub fn write_nil(&mut self) {
        self.put_byte(OP_NIL);
    }

    #[inline]
    pub fn write_bool(&mut self, v: bool) {
        self.put_byte(if v { OP_TRUE } else { OP_FALSE });
    }

    #[inline]
    pub fn write_float64(&mut self, v: f64) {
        if v.to_bits() == 0 {
            self.put_byte(OP_FLOAT64_ZERO);
            return;
        }
        let b = v.to_le_bytes();
        self.put_bytes(&[OP_FLOAT64, b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
    }

    #[inline]
    pub fn write_int64(&mut self, v: i64) {
        if v >= -7 && v <= 32 {
            self.put_byte((v + SMALL_INT_BIAS) as u8);
        } else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
            let b = (v as i16).to_le_bytes();
            self.put_bytes(&[OP_INT16, b[0], b[1]]);
        } else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
            let b = (v as i32).to_le_bytes();
            self.put_bytes(&[OP_INT32, b[0], b[1], b[2], b[3]]);
        } else {
            let b = v.to_le_bytes();
            self.put_bytes(&[OP_INT64, b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        }
    }

    #[inline]
    pub fn write_uint64(&mut self, v: u64) {
        if v <= 9 {
            self.put_byte((v + SMALL_UINT_BIAS) as u8);
        } else if v <= u16::MAX as u64 {
            let b = (v as u16).to_le_bytes();
            self.put_bytes(&[OP_UINT16, b[0], b[1]]);
        } else if v <= u32::MAX as u64 {
            let b = (v as u32).to_le_bytes();
            self.put_bytes(&[OP_UINT32, b[0], b[1], b[2], b[3]]);
        } else {
            let b = v.to_le_bytes();
            self.put_bytes(&[OP_UINT64, b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        }
    }

    pub fn write_string(&mut self, v: &str) {
        let len = v.len();
        if len <= SHORT_LEN_MAX {
            self.put_byte(OP_STRING + len as u8);
        } else {
            let b = (len as u32).to_le_bytes();
            self.put_bytes(&[OP_STRING_LONG, b[0], b[1], b[2], b[3]]);
        }
        self.put_bytes(v.as_bytes());
        self.put_byte(0);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        let len = v.len();
        if len <= SHORT_LEN_MAX {
            self.put_byte(OP_BYTES + len as u8);
        } else {
            let b = (len as u32).to_le_bytes();
            self.put_bytes(&[OP_BYTES_LONG, b[0], b[1], b[2], b[3]]);
        }
        self.put_bytes(v);
    }

    /// Write an array, fails with `value<path> overflows` when nested too deep
    pub fn write_array(&mut self, v: &[Value]) -> Result<(), String> {
        self.write_guarded(|s| s.write_array_inner(v, MAX_VALUE_DEPTH))
    }

    /// Write a map, fails with `value<path> overflows` when nested too deep
    pub fn write_map(&mut self, v: &Map) -> Result<(), String> {
        self.write_guarded(|s| s.write_map_inner(v, MAX_VALUE_DEPTH))
    }

    /// Write any value.
    ///
    /// On failure nothing is left behind: the write position is restored.
    pub fn write(&mut self, v: &Value) -> Result<(), String> {
        self.write_guarded(|s| s.write_inner(v, MAX_VALUE_DEPTH))
    }

    #[inline]
    fn write_guarded(
        &mut self, f: impl FnOnce(&mut Self) -> Result<(), String>,
    ) -> Result<(), String> {
        let start = self.get_write_pos();
        match f(self) {
            Ok(()) => Ok(()),
            Err(path) => {
                self.set_write_pos(start);
                Err(format!("value{} overflows", path))
            }
        }
    }

    fn write_inner(&mut self, v: &Value, depth: usize) -> Result<(), String> {
        match v {
            Value::Nil => self.write_nil(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Int64(i) => self.write_int64(*i),
            Value::Uint64(u) => self.write_uint64(*u),
            Value::Float64(f) => self.write_float64(*f),
            Value::String(s) => self.write_string(s),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Array(a) => return self.write_array_inner(a, depth),
            Value::Map(m) => return self.write_map_inner(m, depth),
        }
        Ok(())
    }

    /// Returns the position of the length field to patch, None for an empty container
    #[inline]
    fn write_container_head(&mut self, short: u8, long: u8, count: usize) -> Option<usize> {
        if count == 0 {
            self.put_byte(short);
            return None;
        }
        let start = self.get_write_pos();
        if count <= SHORT_COUNT_MAX {
            self.put_bytes(&[short + count as u8, 0, 0, 0, 0]);
        } else {
            let c = (count as u32).to_le_bytes();
            self.put_bytes(&[long, 0, 0, 0, 0, c[0], c[1], c[2], c[3]]);
        }
        Some(start)
    }

    #[inline]
    fn patch_container_len(&mut self, start: usize) {
        let total = (self.get_write_pos() - start) as u32;
        self.put_bytes_at(start + 1, &total.to_le_bytes());
    }

    fn write_array_inner(&mut self, v: &[Value], depth: usize) -> Result<(), String> {
        if depth == 0 {
            return Err(String::new());
        }
        let Some(start) = self.write_container_head(OP_ARRAY, OP_ARRAY_LONG, v.len()) else {
            return Ok(());
        };
        for (i, item) in v.iter().enumerate() {
            if let Err(path) = self.write_inner(item, depth - 1) {
                return Err(format!("[{}]{}", i, path));
            }
        }
        self.patch_container_len(start);
        Ok(())
    }

    fn write_map_inner(&mut self, v: &Map, depth: usize) -> Result<(), String> {
        if depth == 0 {
            return Err(String::new());
        }
        let Some(start) = self.write_container_head(OP_MAP, OP_MAP_LONG, v.len()) else {
            return Ok(());
        };
        for (k, item) in v.iter() {
            self.write_string(k);
            if let Err(path) = self.write_inner(item, depth - 1) {
                return Err(format!("[\"{}\"]{}", k, path));
            }
        }
        self.patch_container_len(start);
        Ok(())
    }

    /// Copy one encoded value from another stream, verbatim
    pub fn write_encoded_from(&mut self, src: &Stream, pos: usize) -> Result<(), StreamError> {
        let size = src.value_size_at(pos).ok_or(StreamError)?;
        let mut buf = vec![0u8; size];
        if !src.peek_bytes_at(pos, &mut buf) {
            return Err(StreamError);
        }
        self.put_bytes(&buf);
        Ok(())
    }

    /// Restores the read cursor when `f` fails
    #[inline(always)]
    fn atomic_read<T>(
        &mut self, f: impl FnOnce(&mut Self) -> Option<T>,
    ) -> Result<T, StreamError> {
        let saved: Cursor = self.read;
        match f(self) {
            Some(v) => Ok(v),
            None => {
                self.read = saved;
                Err(StreamError)
            }
        }
    }

    #[inline]
    pub fn read_nil(&mut self) -> Result<(), StreamError> {
        self.atomic_read(|s| {
            if s.peek_byte()? != OP_NIL {
                return None;
            }
            s.skip_bytes(1);
            Some(())
        })
    }

    #[inline]
    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        self.atomic_read(|s| {
            let v = match s.peek_byte()? {
                OP_TRUE => true,
                OP_FALSE => false,
                _ => return None,
            };
            s.skip_bytes(1);
            Some(v)
        })
    }

    #[inline]
    pub fn read_float64(&mut self) -> Result<f64, StreamError> {
        self.atomic_read(|s| s.get_float64())
    }

    #[inline]
    pub fn read_int64(&mut self) -> Result<i64, StreamError> {
        self.atomic_read(|s| s.get_int64())
    }

    #[inline]
    pub fn read_uint64(&mut self) -> Result<u64, StreamError> {
        self.atomic_read(|s| s.get_uint64())
    }

    #[inline]
    pub fn read_string(&mut self) -> Result<String, StreamError> {
        self.atomic_read(|s| s.get_string())
    }

    #[inline]
    pub fn read_bytes(&mut self) -> Result<Bytes, StreamError> {
        self.atomic_read(|s| s.get_bytes())
    }

    #[inline]
    pub fn read_array(&mut self) -> Result<Array, StreamError> {
        self.atomic_read(|s| s.get_array_value(MAX_VALUE_DEPTH))
    }

    #[inline]
    pub fn read_map(&mut self) -> Result<Map, StreamError> {
        self.atomic_read(|s| s.get_map_value(MAX_VALUE_DEPTH))
    }

    /// Read any value
    #[inline]
    pub fn read(&mut self) -> Result<Value, StreamError> {
        self.atomic_read(|s| s.get_value(MAX_VALUE_DEPTH))
    }

    /// Consume an array, returning the start position of each element.
    ///
    /// Elements are skipped over, not decoded.
    pub fn read_array_positions(&mut self) -> Result<Vec<usize>, StreamError> {
        self.atomic_read(|s| {
            let (count, start, total) = s.get_container_head(OP_ARRAY, OP_ARRAY_LONG)?;
            let mut out = Vec::with_capacity(count.min(total));
            for _ in 0..count {
                out.push(s.get_read_pos());
                s.skip_one()?;
            }
            if s.get_read_pos() != start + total {
                return None;
            }
            Some(out)
        })
    }

    /// Consume a map, returning each key and the start position of its value
    pub fn read_map_positions(&mut self) -> Result<Vec<(String, usize)>, StreamError> {
        self.atomic_read(|s| {
            let (count, start, total) = s.get_container_head(OP_MAP, OP_MAP_LONG)?;
            let mut out = Vec::with_capacity(count.min(total));
            for _ in 0..count {
                let key = s.get_string()?;
                out.push((key, s.get_read_pos()));
                s.skip_one()?;
            }
            if s.get_read_pos() != start + total {
                return None;
            }
            Some(out)
        })
    }

    /// Run `f` with the read cursor at `pos`, the cursor is restored afterwards
    pub fn read_at<T>(
        &mut self, pos: usize, f: impl FnOnce(&mut Self) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let saved: Cursor = self.read;
        if !self.set_read_pos(pos) {
            return Err(StreamError);
        }
        let r = f(self);
        self.read = saved;
        r
    }

    #[inline]
    pub fn skip_value(&mut self) -> Result<(), StreamError> {
        self.atomic_read(|s| s.skip_one())
    }

    /// Type name of the value under the read cursor
    pub fn peek_type_name(&self) -> Option<&'static str> {
        Self::op_type_name(self.peek_byte()?)
    }

    /// Type name of the value at `pos`
    pub fn type_name_at(&self, pos: usize) -> Option<&'static str> {
        Self::op_type_name(self.peek_byte_at(pos)?)
    }

    fn op_type_name(op: u8) -> Option<&'static str> {
        let name = match op {
            OP_NIL => TYPE_NIL,
            OP_TRUE | OP_FALSE => TYPE_BOOL,
            OP_FLOAT64_ZERO | OP_FLOAT64 => TYPE_FLOAT64,
            OP_INT16 | OP_INT32 | OP_INT64 => TYPE_INT64,
            OP_SMALL_INT_MIN..=OP_SMALL_INT_MAX => TYPE_INT64,
            OP_UINT16 | OP_UINT32 | OP_UINT64 => TYPE_UINT64,
            OP_SMALL_UINT_MIN..=OP_SMALL_UINT_MAX => TYPE_UINT64,
            OP_ARRAY..=OP_ARRAY_LONG => TYPE_ARRAY,
            OP_MAP..=OP_MAP_LONG => TYPE_MAP,
            OP_STRING..=OP_STRING_LONG => TYPE_STRING,
            OP_BYTES..=OP_BYTES_LONG => TYPE_BYTES,
            _ => return None,
        };
        Some(name)
    }

    /// Encoded size of the value at `pos`, None when invalid or truncated
    pub fn value_size_at(&self, pos: usize) -> Option<usize> {
        let op = self.peek_byte_at(pos)?;
        let size = match SKIP_TABLE[op as usize] {
            SKIP_INVALID => return None,
            SKIP_VARIABLE => {
                let mut b = [0u8; 4];
                if !self.peek_bytes_at(pos + 1, &mut b) {
                    return None;
                }
                let len = le_u32(&b);
                match op {
                    OP_STRING_LONG => len + 6,
                    OP_BYTES_LONG => len + 5,
                    OP_ARRAY_LONG | OP_MAP_LONG if len < 9 => return None,
                    _ if len < 5 => return None,
                    _ => len,
                }
            }
            n => n as usize,
        };
        if pos + size > self.get_write_pos() {
            return None;
        }
        Some(size)
    }

    #[inline]
    fn skip_one(&mut self) -> Option<()> {
        let size = self.value_size_at(self.get_read_pos())?;
        if !self.skip_bytes(size) {
            return None;
        }
        Some(())
    }

    fn get_float64(&mut self) -> Option<f64> {
        match self.peek_byte()? {
            OP_FLOAT64_ZERO => {
                self.skip_bytes(1);
                Some(0.0)
            }
            OP_FLOAT64 => {
                let b = self.get_array::<9>()?;
                Some(f64::from_le_bytes([b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]]))
            }
            _ => None,
        }
    }

    fn get_int64(&mut self) -> Option<i64> {
        let op = self.peek_byte()?;
        match op {
            OP_SMALL_INT_MIN..=OP_SMALL_INT_MAX => {
                self.skip_bytes(1);
                Some(op as i64 - SMALL_INT_BIAS)
            }
            OP_INT16 => {
                let b = self.get_array::<3>()?;
                Some(i16::from_le_bytes([b[1], b[2]]) as i64)
            }
            OP_INT32 => {
                let b = self.get_array::<5>()?;
                Some(i32::from_le_bytes([b[1], b[2], b[3], b[4]]) as i64)
            }
            OP_INT64 => {
                let b = self.get_array::<9>()?;
                Some(i64::from_le_bytes([b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]]))
            }
            _ => None,
        }
    }

    fn get_uint64(&mut self) -> Option<u64> {
        let op = self.peek_byte()?;
        match op {
            OP_SMALL_UINT_MIN..=OP_SMALL_UINT_MAX => {
                self.skip_bytes(1);
                Some(op as u64 - SMALL_UINT_BIAS)
            }
            OP_UINT16 => {
                let b = self.get_array::<3>()?;
                Some(u16::from_le_bytes([b[1], b[2]]) as u64)
            }
            OP_UINT32 => {
                let b = self.get_array::<5>()?;
                Some(u32::from_le_bytes([b[1], b[2], b[3], b[4]]) as u64)
            }
            OP_UINT64 => {
                let b = self.get_array::<9>()?;
                Some(u64::from_le_bytes([b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]]))
            }
            _ => None,
        }
    }

    /// Length of a string or bytes value, consuming its opcode and length field
    #[inline]
    fn get_blob_len(&mut self, short: u8, long: u8) -> Option<usize> {
        let op = self.peek_byte()?;
        if op >= short && op < long {
            self.skip_bytes(1);
            return Some((op - short) as usize);
        }
        if op == long {
            let b = self.get_array::<5>()?;
            return Some(le_u32(&b[1..]));
        }
        None
    }

    fn get_string(&mut self) -> Option<String> {
        let len = self.get_blob_len(OP_STRING, OP_STRING_LONG)?;
        let mut raw = self.get_vec(len + 1)?;
        if raw.pop()? != 0 {
            return None;
        }
        String::from_utf8(raw).ok()
    }

    fn get_bytes(&mut self) -> Option<Bytes> {
        let len = self.get_blob_len(OP_BYTES, OP_BYTES_LONG)?;
        Some(Bytes(self.get_vec(len)?))
    }

    /// Returns (count, start position, total length)
    fn get_container_head(&mut self, short: u8, long: u8) -> Option<(usize, usize, usize)> {
        let start = self.get_read_pos();
        let op = self.peek_byte()?;
        let (count, total) = if op == short {
            self.skip_bytes(1);
            (0, 1)
        } else if op > short && op < long {
            let b = self.get_array::<5>()?;
            ((op - short) as usize, le_u32(&b[1..]))
        } else if op == long {
            let b = self.get_array::<9>()?;
            (le_u32(&b[5..]), le_u32(&b[1..]))
        } else {
            return None;
        };
        if start + total > self.get_write_pos() || total < self.get_read_pos() - start {
            return None;
        }
        Some((count, start, total))
    }

    fn get_array_value(&mut self, depth: usize) -> Option<Array> {
        if depth == 0 {
            return None;
        }
        let (count, start, total) = self.get_container_head(OP_ARRAY, OP_ARRAY_LONG)?;
        let mut out = Vec::with_capacity(count.min(total));
        for _ in 0..count {
            out.push(self.get_value(depth - 1)?);
        }
        if self.get_read_pos() != start + total {
            return None;
        }
        Some(out)
    }

    fn get_map_value(&mut self, depth: usize) -> Option<Map> {
        if depth == 0 {
            return None;
        }
        let (count, start, total) = self.get_container_head(OP_MAP, OP_MAP_LONG)?;
        let mut out = Map::new();
        for _ in 0..count {
            let key = self.get_string()?;
            let v = self.get_value(depth - 1)?;
            out.insert(key, v);
        }
        if self.get_read_pos() != start + total {
            return None;
        }
        Some(out)
    }

    fn get_value(&mut self, depth: usize) -> Option<Value> {
        let op = self.peek_byte()?;
        let v = match op {
            OP_NIL => {
                self.skip_bytes(1);
                Value::Nil
            }
            OP_TRUE => {
                self.skip_bytes(1);
                Value::Bool(true)
            }
            OP_FALSE => {
                self.skip_bytes(1);
                Value::Bool(false)
            }
            OP_FLOAT64_ZERO | OP_FLOAT64 => Value::Float64(self.get_float64()?),
            OP_INT16 | OP_INT32 | OP_INT64 | OP_SMALL_INT_MIN..=OP_SMALL_INT_MAX => {
                Value::Int64(self.get_int64()?)
            }
            OP_UINT16 | OP_UINT32 | OP_UINT64 | OP_SMALL_UINT_MIN..=OP_SMALL_UINT_MAX => {
                Value::Uint64(self.get_uint64()?)
            }
            OP_ARRAY..=OP_ARRAY_LONG => Value::Array(self.get_array_value(depth)?),
            OP_MAP..=OP_MAP_LONG => Value::Map(self.get_map_value(depth)?),
            OP_STRING..=OP_STRING_LONG => Value::String(self.get_string()?),
            OP_BYTES..=OP_BYTES_LONG => Value::Bytes(self.get_bytes()?),
            _ => return None,
        };
        Some(v)
    }
}
