use std::fmt;
use std::panic::Location;

/// Category of an error, stored in the lowest byte of the wire code.
///
/// NOTE The kind decides the propagation policy: protocol errors close the connection,
/// panics are sanitized for non-debug peers, the rest travel back to the caller.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::FromRepr,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Hash,
)]
#[repr(u8)]
pub enum ErrorKind {
    /// Malformed stream from the peer
    #[strum(serialize = "ProtocolError")]
    Protocol = 1,
    /// Network condition
    #[strum(serialize = "TransportError")]
    Transport = 2,
    /// Error returned by an action, or by dispatching an action
    #[strum(serialize = "ReplyError")]
    Reply = 3,
    /// Misuse of the Runtime or RT values inside a handler
    #[strum(serialize = "RuntimeError")]
    Runtime = 4,
    /// Handler panicked
    #[strum(serialize = "RuntimePanic")]
    RuntimePanic = 5,
    /// Invariant violated inside the framework
    #[strum(serialize = "KernelPanic")]
    KernelPanic = 6,
    /// Session token or session lookup failure
    #[strum(serialize = "SecurityError")]
    Security = 7,
    /// Rejected before listening
    #[strum(serialize = "ConfigError")]
    Config = 8,
}

impl ErrorKind {
    /// Panic kinds are never shown in detail to a non-debug client
    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::RuntimePanic | Self::KernelPanic)
    }
}

/// A predefined error: number, kind and default message.
///
/// The wire code of an error is `(num << 8) | kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDef {
    pub num: u32,
    pub kind: ErrorKind,
    pub message: &'static str,
}

impl ErrorDef {
    pub const fn new(num: u32, kind: ErrorKind, message: &'static str) -> Self {
        Self { num, kind, message }
    }

    #[inline]
    pub const fn code(&self) -> u64 {
        ((self.num as u64) << 8) | self.kind as u64
    }

    /// Instantiate with the default message
    #[inline]
    pub fn to_err(&self) -> RpcError {
        RpcError {
            kind: self.kind,
            num: self.num,
            message: self.message.to_string(),
            debug: String::new(),
        }
    }

    /// Instantiate with a customized message
    #[inline]
    pub fn msg<S: Into<String>>(&self, message: S) -> RpcError {
        RpcError { kind: self.kind, num: self.num, message: message.into(), debug: String::new() }
    }

    /// Instantiate with the default message and a debug line
    #[track_caller]
    #[inline]
    pub fn debug<S: AsRef<str>>(&self, debug: S) -> RpcError {
        self.to_err().add_debug(debug)
    }
}

impl PartialEq<ErrorDef> for RpcError {
    #[inline]
    fn eq(&self, other: &ErrorDef) -> bool {
        self.num == other.num && self.kind == other.kind
    }
}

// Stream / codec
pub const ERR_STREAM: ErrorDef = ErrorDef::new(1, ErrorKind::Protocol, "stream error");
pub const ERR_CONTROL_STREAM: ErrorDef =
    ErrorDef::new(2, ErrorKind::Protocol, "malformed control stream");
pub const ERR_CALLBACK_NOT_FOUND: ErrorDef =
    ErrorDef::new(3, ErrorKind::Protocol, "callback id is not allocated");
pub const ERR_UNSUPPORTED_VALUE: ErrorDef =
    ErrorDef::new(4, ErrorKind::Runtime, "value is not supported");

// Runtime misuse
pub const ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE: ErrorDef =
    ErrorDef::new(10, ErrorKind::Runtime, "Runtime is illegal in current thread");
pub const ERR_RT_ARRAY_INDEX_OVERFLOW: ErrorDef =
    ErrorDef::new(11, ErrorKind::Runtime, "RTArray index overflows");
pub const ERR_RT_MAP_KEY_MISSING: ErrorDef =
    ErrorDef::new(12, ErrorKind::Runtime, "RTMap key does not exist");
pub const ERR_RT_VALUE_TYPE: ErrorDef =
    ErrorDef::new(13, ErrorKind::Runtime, "RTValue type mismatch");
pub const ERR_RUNTIME_REPLIED: ErrorDef =
    ErrorDef::new(14, ErrorKind::Runtime, "Runtime has already replied");

// Action dispatch
pub const ERR_ACTION_NOT_FOUND: ErrorDef =
    ErrorDef::new(20, ErrorKind::Reply, "target action does not exist");
pub const ERR_ACTION_ARGUMENTS_MISMATCH: ErrorDef =
    ErrorDef::new(21, ErrorKind::Reply, "action arguments mismatch");
pub const ERR_ACTION_HANDLER: ErrorDef =
    ErrorDef::new(22, ErrorKind::Config, "action handler is illegal");
pub const ERR_CALL_OVERFLOW: ErrorDef = ErrorDef::new(23, ErrorKind::Reply, "call overflows");
pub const ERR_SERVICE_NAME: ErrorDef =
    ErrorDef::new(24, ErrorKind::Config, "service name is illegal");
pub const ERR_ACTION_NAME: ErrorDef =
    ErrorDef::new(25, ErrorKind::Config, "action name is illegal");
pub const ERR_NODE_DEPTH: ErrorDef =
    ErrorDef::new(26, ErrorKind::Config, "service node depth overflows");

// Panics
pub const ERR_RUNTIME_PANIC: ErrorDef =
    ErrorDef::new(30, ErrorKind::RuntimePanic, "runtime panic");
pub const ERR_KERNEL_PANIC: ErrorDef = ErrorDef::new(31, ErrorKind::KernelPanic, "kernel panic");
pub const ERR_ACTION_NOT_REPLIED: ErrorDef =
    ErrorDef::new(32, ErrorKind::KernelPanic, "action returned without reply");

// Session layer
pub const ERR_GATEWAY_SESSION_NOT_FOUND: ErrorDef =
    ErrorDef::new(40, ErrorKind::Security, "session not found");
pub const ERR_GATEWAY_SESSION_OVERFLOW: ErrorDef =
    ErrorDef::new(41, ErrorKind::Protocol, "sessions overflow");

// Transport
pub const ERR_TRANSPORT_READ: ErrorDef =
    ErrorDef::new(50, ErrorKind::Transport, "transport read error");
pub const ERR_TRANSPORT_WRITE: ErrorDef =
    ErrorDef::new(51, ErrorKind::Transport, "transport write error");
pub const ERR_TRANSPORT_CLOSED: ErrorDef =
    ErrorDef::new(52, ErrorKind::Transport, "connection is closed");
pub const ERR_TRANSPORT_STREAM_LENGTH: ErrorDef =
    ErrorDef::new(53, ErrorKind::Transport, "stream length overflows transport limit");
pub const ERR_TRANSPORT_TIMEOUT: ErrorDef =
    ErrorDef::new(54, ErrorKind::Transport, "transport timeout");

// Lifecycle / configuration
pub const ERR_CONFIG: ErrorDef = ErrorDef::new(60, ErrorKind::Config, "configuration error");
pub const ERR_SERVER_ALREADY_RUNNING: ErrorDef =
    ErrorDef::new(61, ErrorKind::Config, "server is already running");
pub const ERR_SERVER_NOT_RUNNING: ErrorDef =
    ErrorDef::new(62, ErrorKind::Config, "server is not running");
pub const ERR_PROCESSOR_NOT_RUNNING: ErrorDef =
    ErrorDef::new(63, ErrorKind::KernelPanic, "processor is not running");

/// The error carried through the framework and on the wire.
///
/// On the wire it is `u64 code` + `String message`, plus a `String debug` when the
/// debug status bit is set on the stream.
#[derive(Clone, PartialEq, thiserror::Error)]
#[error("{kind}[{num}]: {message}")]
pub struct RpcError {
    kind: ErrorKind,
    num: u32,
    message: String,
    debug: String,
}

impl RpcError {
    /// Rebuild from a wire code; unknown kinds degrade to KernelPanic
    pub fn from_code(code: u64, message: String) -> Self {
        let kind = ErrorKind::from_repr((code & 0xFF) as u8).unwrap_or(ErrorKind::KernelPanic);
        Self { kind, num: (code >> 8) as u32, message, debug: String::new() }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn num(&self) -> u32 {
        self.num
    }

    #[inline]
    pub fn code(&self) -> u64 {
        ((self.num as u64) << 8) | self.kind as u64
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn debug_info(&self) -> &str {
        &self.debug
    }

    /// Append a debug line tagged with the caller location
    #[track_caller]
    pub fn add_debug<S: AsRef<str>>(mut self, debug: S) -> Self {
        let loc = Location::caller();
        if !self.debug.is_empty() {
            self.debug.push('\n');
        }
        self.debug.push_str(&format!("{} ({}:{})", debug.as_ref(), loc.file(), loc.line()));
        self
    }

    /// Replace the debug section, used when decoding from the wire
    #[inline]
    pub fn with_raw_debug(mut self, debug: String) -> Self {
        self.debug = debug;
        self
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.kind, self.num, self.message)?;
        if !self.debug.is_empty() {
            write!(f, "\n{}", self.debug)?;
        }
        Ok(())
    }
}

impl From<&ErrorDef> for RpcError {
    #[inline]
    fn from(def: &ErrorDef) -> Self {
        def.to_err()
    }
}

impl From<ErrorDef> for RpcError {
    #[inline]
    fn from(def: ErrorDef) -> Self {
        def.to_err()
    }
}

/// The single failure kind surfaced by codec reads.
///
/// Callers only need to know the peer sent something malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream error")]
pub struct StreamError;

impl From<StreamError> for RpcError {
    #[inline]
    fn from(_e: StreamError) -> Self {
        ERR_STREAM.to_err()
    }
}

impl From<std::io::Error> for RpcError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ERR_TRANSPORT_TIMEOUT.msg(e.to_string())
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ERR_TRANSPORT_CLOSED.msg(e.to_string()),
            _ => ERR_TRANSPORT_READ.msg(e.to_string()),
        }
    }
}
