//! Layout of control, request, response and report bodies

use crate::error::*;
use rtrpc_core::stream::ControlCode;
use rtrpc_core::{Stream, StreamKind, Value};

/// The `from` field of requests sent by an external client
pub const FROM_CLIENT: &str = "@";

/// Message replacing panic details for clients without the debug bit
pub const SANITIZED_MESSAGE: &str = "internal error";

#[inline]
pub fn format_session(id: u64, token: &str) -> String {
    format!("{}-{}", id, token)
}

/// Parse `"{id}-{token}"`
pub fn parse_session(s: &str) -> Option<(u64, &str)> {
    let (id, token) = s.split_once('-')?;
    let id = id.parse::<u64>().ok()?;
    if token.is_empty() {
        return None;
    }
    Some((id, token))
}

/// Control stream with its sub-kind code and sequence written.
///
/// Client sub-kinds travel as connect-request, replies as connect-response.
pub fn new_control(session_id: u64, code: ControlCode, seq: u64) -> Stream {
    let mut s = Stream::new();
    match code {
        ControlCode::Init | ControlCode::RequestIds => s.set_kind(StreamKind::ConnectRequest),
        ControlCode::InitBack | ControlCode::RequestIdsBack => {
            s.set_kind(StreamKind::ConnectResponse)
        }
    }
    s.set_session_id(session_id);
    s.set_callback_id(0);
    s.write_int64(code as i64);
    s.write_uint64(seq);
    s
}

/// Read the sub-kind code and sequence of a control stream
pub fn read_control_head(s: &mut Stream) -> Result<(ControlCode, u64), RpcError> {
    s.set_read_pos_to_body_start();
    let code = s.read_int64()?;
    let Some(code) = ControlCode::from_repr(code) else {
        return Err(ERR_CONTROL_STREAM.msg(format!("unknown control code {}", code)));
    };
    let seq = s.read_uint64()?;
    Ok((code, seq))
}

/// Parameters announced to the client in init-back
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitBack {
    pub session: String,
    pub read_timeout_ms: i64,
    pub write_timeout_ms: i64,
    pub transport_limit: i64,
    pub concurrency: i64,
}

impl InitBack {
    pub fn write_to(&self, s: &mut Stream) {
        s.write_string(&self.session);
        s.write_int64(self.read_timeout_ms);
        s.write_int64(self.write_timeout_ms);
        s.write_int64(self.transport_limit);
        s.write_int64(self.concurrency);
    }

    pub fn read_from(s: &mut Stream) -> Result<Self, RpcError> {
        Ok(Self {
            session: s.read_string()?,
            read_timeout_ms: s.read_int64()?,
            write_timeout_ms: s.read_int64()?,
            transport_limit: s.read_int64()?,
            concurrency: s.read_int64()?,
        })
    }
}

#[inline]
pub fn new_keepalive(kind: StreamKind, session_id: u64) -> Stream {
    let mut s = Stream::new();
    s.set_kind(kind);
    s.set_session_id(session_id);
    s
}

/// Request body: target, from, then the arguments
pub fn new_request(
    target: &str, from: &str, args: &[Value], callback_id: u64, depth: u16,
) -> Result<Stream, RpcError> {
    let mut s = Stream::new();
    s.set_kind(StreamKind::RpcRequest);
    s.set_callback_id(callback_id);
    s.set_depth(depth);
    s.write_string(target);
    s.write_string(from);
    for (i, arg) in args.iter().enumerate() {
        if let Err(e) = s.write(arg) {
            return Err(ERR_UNSUPPORTED_VALUE.msg(format!("argument {}: {}", i + 1, e)));
        }
    }
    Ok(s)
}

/// Empty response with the routing fields of the request
#[inline]
pub fn new_response(req: &Stream, kind: StreamKind) -> Stream {
    let mut s = Stream::new();
    s.copy_head_from(req);
    s.set_kind(kind);
    s
}

/// Error response body: code, message, and debug info when the debug bit is set
pub fn write_error(s: &mut Stream, err: &RpcError) {
    s.write_uint64(err.code());
    s.write_string(err.message());
    if s.get_status_bit_debug() {
        s.write_string(err.debug_info());
    }
}

pub fn new_error_response(req: &Stream, err: &RpcError) -> Stream {
    let mut s = new_response(req, StreamKind::RpcResponseError);
    write_error(&mut s, err);
    s
}

pub fn read_error(s: &mut Stream) -> Result<RpcError, RpcError> {
    s.set_read_pos_to_body_start();
    let code = s.read_uint64()?;
    let message = s.read_string()?;
    let mut err = RpcError::from_code(code, message);
    if s.get_status_bit_debug() {
        if let Ok(debug) = s.read_string() {
            err = err.with_raw_debug(debug);
        }
    }
    Ok(err)
}

/// Asynchronous error surfaced to the peer, the callback id names the offending stream
pub fn new_error_report(session_id: u64, callback_id: u64, err: &RpcError) -> Stream {
    let mut s = Stream::new();
    s.set_kind(StreamKind::SystemErrorReport);
    s.set_session_id(session_id);
    s.set_callback_id(callback_id);
    s.write_uint64(err.code());
    s.write_string(err.message());
    s
}

/// Broadcast body: endpoint, topic, payload
pub fn new_broadcast(
    session_id: u64, callback_id: u64, endpoint: &str, topic: &str, payload: &Value,
) -> Result<Stream, RpcError> {
    let mut s = Stream::new();
    s.set_kind(StreamKind::RpcBroadcast);
    s.set_session_id(session_id);
    s.set_callback_id(callback_id);
    s.write_string(endpoint);
    s.write_string(topic);
    if let Err(e) = s.write(payload) {
        return Err(ERR_UNSUPPORTED_VALUE.msg(e));
    }
    Ok(s)
}

pub fn read_broadcast(s: &mut Stream) -> Result<(String, String, Value), RpcError> {
    s.set_read_pos_to_body_start();
    let endpoint = s.read_string()?;
    let topic = s.read_string()?;
    let payload = s.read()?;
    Ok((endpoint, topic, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_string() {
        assert_eq!(parse_session("12-abc"), Some((12, "abc")));
        assert_eq!(parse_session(&format_session(3, "x-y")), Some((3, "x-y")));
        assert_eq!(parse_session(""), None);
        assert_eq!(parse_session("12-"), None);
        assert_eq!(parse_session("a-b"), None);
    }

    #[test]
    fn test_control() {
        let mut s = new_control(9, ControlCode::RequestIds, 4);
        s.write_uint64(100);
        assert_eq!(s.kind(), Some(StreamKind::ConnectRequest));
        assert!(s.is_control());
        let (code, seq) = read_control_head(&mut s).expect("head");
        assert_eq!(code, ControlCode::RequestIds);
        assert_eq!(seq, 4);
        assert_eq!(s.read_uint64().expect("current"), 100);

        let mut s = new_control(9, ControlCode::InitBack, 1);
        let back = InitBack {
            session: "9-tok".to_string(),
            read_timeout_ms: 12000,
            write_timeout_ms: 2000,
            transport_limit: 4 << 20,
            concurrency: 64,
        };
        back.write_to(&mut s);
        assert_eq!(s.kind(), Some(StreamKind::ConnectResponse));
        read_control_head(&mut s).expect("head");
        assert_eq!(InitBack::read_from(&mut s).expect("init back"), back);
    }

    #[test]
    fn test_error_body() {
        let mut req = new_request("#.a:B", FROM_CLIENT, &[], 3, 0).expect("req");
        let err = ERR_RUNTIME_PANIC.debug("boom");
        let mut resp = new_error_response(&req, &err);
        assert_eq!(resp.get_callback_id(), 3);
        let got = read_error(&mut resp).expect("read");
        assert_eq!(got.code(), err.code());
        assert_eq!(got.debug_info(), "");

        req.set_status_bit_debug(true);
        let mut resp = new_error_response(&req, &err);
        let got = read_error(&mut resp).expect("read");
        assert!(got.debug_info().starts_with("boom"));
    }
}
