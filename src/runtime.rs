//! The handle an action handler works through.
//!
//! A [Runtime] is only valid on the worker thread that invoked the handler and only
//! while that invocation is the innermost one. Any use outside of it fails with
//! `ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE` and leaves the worker untouched.

use crate::error::*;
use crate::processor::{WorkerCtx, WorkerState};
use crate::proto;
use crate::rt_value::{RTArray, RTMap, RTValue};
use rtrpc_core::value::{Array, Bytes, Map};
use rtrpc_core::{Stream, StreamKind, Value};
use std::fmt;
use std::sync::{Arc, MutexGuard};

/// Proof that a handler went through `Runtime::reply`
#[must_use]
pub struct Return(());

/// Anything a handler can reply with
pub enum ReplyValue {
    Value(Value),
    Error(RpcError),
    RTValue(RTValue),
    RTArray(RTArray),
    RTMap(RTMap),
}

macro_rules! impl_reply_value {
    ($($t: ty),*) => {
        $(
            impl From<$t> for ReplyValue {
                #[inline]
                fn from(v: $t) -> Self {
                    ReplyValue::Value(Value::from(v))
                }
            }
        )*
    };
}

impl_reply_value!((), bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);
impl_reply_value!(String, &str, Bytes, Array, Map);

impl From<Value> for ReplyValue {
    #[inline]
    fn from(v: Value) -> Self {
        ReplyValue::Value(v)
    }
}

impl From<RpcError> for ReplyValue {
    #[inline]
    fn from(e: RpcError) -> Self {
        ReplyValue::Error(e)
    }
}

impl From<&ErrorDef> for ReplyValue {
    #[inline]
    fn from(e: &ErrorDef) -> Self {
        ReplyValue::Error(e.to_err())
    }
}

impl From<RTValue> for ReplyValue {
    #[inline]
    fn from(v: RTValue) -> Self {
        ReplyValue::RTValue(v)
    }
}

impl From<RTArray> for ReplyValue {
    #[inline]
    fn from(v: RTArray) -> Self {
        ReplyValue::RTArray(v)
    }
}

impl From<RTMap> for ReplyValue {
    #[inline]
    fn from(v: RTMap) -> Self {
        ReplyValue::RTMap(v)
    }
}

impl<T: Into<ReplyValue>> From<Result<T, RpcError>> for ReplyValue {
    #[inline]
    fn from(r: Result<T, RpcError>) -> Self {
        match r {
            Ok(v) => v.into(),
            Err(e) => ReplyValue::Error(e),
        }
    }
}

#[derive(Clone)]
pub struct Runtime {
    id: u64,
    ctx: Arc<WorkerCtx>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Runtime({})", self.id)
    }
}

impl Runtime {
    #[inline]
    pub(crate) fn new(id: u64, ctx: Arc<WorkerCtx>) -> Self {
        Self { id, ctx }
    }

    #[inline(always)]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Lock the worker state, only from the worker thread while this invocation is on top
    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, WorkerState>, RpcError> {
        if !self.ctx.is_current_thread() {
            return Err(ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE
                .msg("Runtime is used outside of its worker thread"));
        }
        let st = self.ctx.lock();
        match st.top_frame() {
            Some(frame) if frame.lock == self.id => Ok(st),
            _ => Err(ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE
                .msg("Runtime is used outside of its invocation")),
        }
    }

    /// Build the response of the current invocation, only the first reply counts
    pub fn reply<V: Into<ReplyValue>>(&self, v: V) -> Return {
        let mut st = match self.lock_state() {
            Ok(st) => st,
            Err(e) => {
                logger_warn!(self.ctx.shared.logger, "{:?} reply: {}", self, e);
                return Return(());
            }
        };
        let WorkerState { frames, streams, .. } = &mut *st;
        let Some(frame) = frames.last_mut() else {
            return Return(());
        };
        if frame.response.is_some() {
            let e = ERR_RUNTIME_REPLIED.msg(format!("{} replied twice", frame.entry.path));
            logger_warn!(self.ctx.shared.logger, "{}", e);
            return Return(());
        }
        let resp = match Self::encode_reply(self.id, streams, frame.src, v.into()) {
            Ok(resp) => resp,
            Err(e) => proto::new_error_response(&streams[frame.src], &e),
        };
        frame.response = Some(resp);
        Return(())
    }

    fn encode_reply(
        id: u64, streams: &mut [Stream], src: usize, v: ReplyValue,
    ) -> Result<Stream, RpcError> {
        let mut resp = proto::new_response(&streams[src], StreamKind::RpcResponseOk);
        match v {
            ReplyValue::Value(v) => {
                resp.write(&v).map_err(|e| ERR_UNSUPPORTED_VALUE.msg(format!("reply {}", e)))?;
            }
            ReplyValue::Error(e) => {
                return Ok(proto::new_error_response(&streams[src], &e));
            }
            ReplyValue::RTValue(v) => {
                if v.rt().id() != id {
                    return Err(ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE
                        .msg("reply with a value of another invocation"));
                }
                let (vsrc, pos) = v.location();
                resp.write_encoded_from(&streams[vsrc], pos)?;
            }
            ReplyValue::RTArray(a) => {
                if a.rt().id() != id {
                    return Err(ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE
                        .msg("reply with a value of another invocation"));
                }
                let v = Value::Array(a.materialize(streams)?);
                resp.write(&v).map_err(|e| ERR_UNSUPPORTED_VALUE.msg(format!("reply {}", e)))?;
            }
            ReplyValue::RTMap(m) => {
                if m.rt().id() != id {
                    return Err(ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE
                        .msg("reply with a value of another invocation"));
                }
                let v = Value::Map(m.materialize(streams)?);
                resp.write(&v).map_err(|e| ERR_UNSUPPORTED_VALUE.msg(format!("reply {}", e)))?;
            }
        }
        Ok(resp)
    }

    /// Call another action on this worker, the result stays readable until this
    /// invocation returns.
    pub fn call(&self, target: &str, args: &[Value]) -> Result<RTValue, RpcError> {
        let req = {
            let st = self.lock_state()?;
            let Some(frame) = st.top_frame() else {
                return Err(ERR_KERNEL_PANIC.msg("call without frame"));
            };
            let parent = &st.streams[frame.src];
            let depth = u16::try_from(frame.level).unwrap_or(u16::MAX);
            let mut req =
                proto::new_request(target, &frame.entry.path, args, parent.get_callback_id(), depth)?;
            req.set_session_id(parent.get_session_id());
            req.set_gateway_id(parent.get_gateway_id());
            req.set_status_bit_debug(parent.get_status_bit_debug());
            req
        };
        let mut resp = self.ctx.eval(req);
        match resp.kind() {
            Some(StreamKind::RpcResponseOk) => {
                let mut st = self.lock_state()?;
                let src = st.streams.len();
                st.streams.push(resp);
                Ok(RTValue::new(self.clone(), src, rtrpc_core::stream::STREAM_HEAD_SIZE))
            }
            _ => Err(proto::read_error(&mut resp)?),
        }
    }

    /// Broadcast `value` under `topic` to the session of the current request
    pub fn post<V: Into<Value>>(&self, endpoint: &str, topic: &str, value: V) -> Result<(), RpcError> {
        let stream = {
            let st = self.lock_state()?;
            let Some(frame) = st.top_frame() else {
                return Err(ERR_KERNEL_PANIC.msg("post without frame"));
            };
            let req = &st.streams[frame.src];
            let mut s = proto::new_broadcast(
                req.get_session_id(),
                req.get_callback_id(),
                endpoint,
                topic,
                &value.into(),
            )?;
            s.set_gateway_id(req.get_gateway_id());
            s
        };
        self.ctx.shared.out.on_receive_stream(stream);
        Ok(())
    }

    /// Nil when the key is not set
    pub fn service_config_get(&self, key: &str) -> Result<Value, RpcError> {
        let st = self.lock_state()?;
        let Some(frame) = st.top_frame() else {
            return Err(ERR_KERNEL_PANIC.msg("config without frame"));
        };
        let config = frame.entry.config.lock().unwrap_or_else(|e| e.into_inner());
        Ok(config.get(key).cloned().unwrap_or_default())
    }

    pub fn service_config_set<V: Into<Value>>(&self, key: &str, value: V) -> Result<(), RpcError> {
        let st = self.lock_state()?;
        let Some(frame) = st.top_frame() else {
            return Err(ERR_KERNEL_PANIC.msg("config without frame"));
        };
        let mut config = frame.entry.config.lock().unwrap_or_else(|e| e.into_inner());
        config.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn new_rt_array(&self, cap: usize) -> Result<RTArray, RpcError> {
        let _st = self.lock_state()?;
        Ok(RTArray::from_items(self.clone(), Vec::with_capacity(cap)))
    }

    pub fn new_rt_map(&self, cap: usize) -> Result<RTMap, RpcError> {
        let _st = self.lock_state()?;
        Ok(RTMap::new(self.clone(), cap))
    }
}
