use crate::error::{ERR_CONFIG, RpcError};
use std::time::Duration;

pub const MAX_SESSION_CONCURRENCY: usize = 1024;
pub const MIN_TRANSPORT_LIMIT: usize = 10240;
pub const MAX_NUM_OF_THREADS: usize = 1 << 20;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Number of callback slots per session, at most 1024
    pub session_concurrency: usize,
    /// Max bytes of a single stream, at least 10240
    pub transport_limit: usize,
    /// Socket read timeout
    pub read_timeout: Duration,
    /// Socket write timeout
    pub write_timeout: Duration,
    /// Interval of client keepalive, announced to clients
    pub heartbeat: Duration,
    pub heartbeat_timeout: Duration,
    pub server_max_sessions: usize,
    /// Session without traffic longer than this will be evicted
    pub session_timeout: Duration,
    pub server_read_buffer_size: usize,
    pub server_write_buffer_size: usize,
    /// Number of request queues the workers draw from
    pub num_of_channels: usize,
    pub max_node_depth: usize,
    pub max_call_depth: usize,
    /// Upper bound of worker threads
    pub num_of_threads: usize,
    /// How long close() waits for workers to drain
    pub close_timeout: Duration,
    pub session_shards: usize,
    /// Send panic details back to clients
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_concurrency: 64,
            transport_limit: 4 * 1024 * 1024,
            read_timeout: Duration::from_secs(12),
            write_timeout: Duration::from_secs(2),
            heartbeat: Duration::from_secs(4),
            heartbeat_timeout: Duration::from_secs(8),
            server_max_sessions: 10240000,
            session_timeout: Duration::from_secs(120),
            server_read_buffer_size: 1200,
            server_write_buffer_size: 1200,
            num_of_channels: 32,
            max_node_depth: 128,
            max_call_depth: 128,
            num_of_threads: default_num_of_threads(),
            close_timeout: Duration::from_secs(5),
            session_shards: 1024,
            debug: false,
        }
    }
}

/// 16384 threads per cpu, capped at 2^20
#[inline]
pub fn default_num_of_threads() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let n = cpus.saturating_mul(16384);
    if n > MAX_NUM_OF_THREADS {
        return MAX_NUM_OF_THREADS;
    }
    n
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.session_concurrency == 0 || self.session_concurrency > MAX_SESSION_CONCURRENCY {
            return Err(ERR_CONFIG.msg(format!(
                "session_concurrency({}) must be in [1, {}]",
                self.session_concurrency, MAX_SESSION_CONCURRENCY
            )));
        }
        if self.transport_limit < MIN_TRANSPORT_LIMIT {
            return Err(ERR_CONFIG.msg(format!(
                "transport_limit({}) must be at least {}",
                self.transport_limit, MIN_TRANSPORT_LIMIT
            )));
        }
        if self.num_of_threads == 0 || self.num_of_threads > MAX_NUM_OF_THREADS {
            return Err(ERR_CONFIG.msg(format!(
                "num_of_threads({}) must be in [1, {}]",
                self.num_of_threads, MAX_NUM_OF_THREADS
            )));
        }
        if self.num_of_channels == 0 {
            return Err(ERR_CONFIG.msg("num_of_channels must be positive"));
        }
        if self.max_node_depth == 0 {
            return Err(ERR_CONFIG.msg("max_node_depth must be positive"));
        }
        if self.max_call_depth == 0 {
            return Err(ERR_CONFIG.msg("max_call_depth must be positive"));
        }
        if self.server_max_sessions == 0 {
            return Err(ERR_CONFIG.msg("server_max_sessions must be positive"));
        }
        if self.session_shards == 0 {
            return Err(ERR_CONFIG.msg("session_shards must be positive"));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(ERR_CONFIG.msg("read_timeout and write_timeout must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Interval between pings when idle
    pub heartbeat: Duration,
    /// Connection is dropped after this long without any stream from server
    pub heartbeat_timeout: Duration,
    /// How long send() waits for the response, including retransmission
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Ask the server for debug info in error responses
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(4),
            heartbeat_timeout: Duration::from_secs(8),
            request_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERR_CONFIG;

    #[test]
    fn test_default_valid() {
        let config = ServerConfig::default();
        config.validate().expect("default");
        assert!(config.num_of_threads >= 16384);
        assert!(config.num_of_threads <= MAX_NUM_OF_THREADS);
    }

    #[test]
    fn test_reject() {
        let mut config = ServerConfig::default();
        config.session_concurrency = 1025;
        let e = config.validate().unwrap_err();
        assert!(e == ERR_CONFIG);
        assert!(e.message().contains("session_concurrency"));

        let mut config = ServerConfig::default();
        config.transport_limit = 10239;
        assert!(config.validate().unwrap_err().message().contains("transport_limit"));

        let mut config = ServerConfig::default();
        config.transport_limit = 10240;
        config.session_concurrency = 1024;
        config.validate().expect("boundary");
    }
}
