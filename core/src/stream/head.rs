use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const STREAM_VERSION: u8 = 1;
pub const STREAM_HEAD_SIZE: usize = 48;

pub const STATUS_BIT_DEBUG: u8 = 1;

/// Offset range of the checksum field, excluded from the digest
pub(crate) const CHECKSUM_START: usize = 8;
pub(crate) const CHECKSUM_END: usize = 16;

/// Fixed 48 byte stream header, all fields little-endian
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone)]
#[repr(C)]
pub struct StreamHead {
    pub version: u8,
    pub status: u8,
    pub kind: u8,
    pub priority: u8,
    pub length: U32,
    pub checksum: U64,
    pub zone_id: U16,
    pub target_id: U32,
    pub source_id: U32,
    pub gateway_id: U32,
    pub session_id: U64,
    pub callback_id: U64,
    pub depth: U16,
}

const _: () = assert!(std::mem::size_of::<StreamHead>() == STREAM_HEAD_SIZE);

impl StreamHead {
    #[inline]
    pub fn template() -> Self {
        let mut head = Self::new_zeroed();
        head.version = STREAM_VERSION;
        head.length.set(STREAM_HEAD_SIZE as u32);
        head
    }
}

#[derive(
    strum::Display, strum::AsRefStr, strum::FromRepr, PartialEq, Eq, Clone, Copy, Debug, Hash,
)]
#[repr(u8)]
pub enum StreamKind {
    ConnectRequest = 1,
    ConnectResponse = 2,
    Ping = 3,
    Pong = 4,
    RpcRequest = 5,
    RpcResponseOk = 6,
    RpcResponseError = 7,
    RpcBroadcast = 8,
    SystemErrorReport = 9,
}

impl StreamKind {
    /// Kinds that travel with a callback id
    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::RpcRequest
                | Self::RpcResponseOk
                | Self::RpcResponseError
                | Self::RpcBroadcast
                | Self::SystemErrorReport
        )
    }
}

/// Sub-kind code at the beginning of a connect-request / connect-response body
#[derive(strum::Display, strum::FromRepr, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(i64)]
pub enum ControlCode {
    Init = 1,
    InitBack = 2,
    RequestIds = 3,
    RequestIdsBack = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_layout() {
        let mut head = StreamHead::template();
        head.callback_id.set(0x0102030405060708);
        head.depth.set(3);
        let bytes = head.as_bytes();
        assert_eq!(bytes.len(), STREAM_HEAD_SIZE);
        assert_eq!(bytes[0], STREAM_VERSION);
        assert_eq!(&bytes[4..8], &48u32.to_le_bytes());
        assert_eq!(&bytes[38..46], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&bytes[46..48], &3u16.to_le_bytes());
        assert_eq!(StreamKind::from_repr(9), Some(StreamKind::SystemErrorReport));
        assert_eq!(StreamKind::from_repr(10), None);
        assert!(!StreamKind::Ping.is_data());
    }
}
