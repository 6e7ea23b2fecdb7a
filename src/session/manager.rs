use super::Session;
use crate::error::*;
use crate::proto;
use captains_log::LogFilter;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rtrpc_core::{ServerConfig, StreamReceiver};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const SESSION_TOKEN_LEN: usize = 32;

type Shard = Mutex<FxHashMap<u64, Arc<Session>>>;

/// Sessions of one server, sharded by id so a sweep never holds a global lock
pub struct SessionManager {
    shards: Vec<Shard>,
    seed: AtomicU64,
    count: AtomicUsize,
    config: Arc<ServerConfig>,
    processor: Arc<dyn StreamReceiver>,
    logger: Arc<LogFilter>,
}

#[inline]
fn new_token() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(SESSION_TOKEN_LEN).map(char::from).collect()
}

impl SessionManager {
    pub fn new(
        config: Arc<ServerConfig>, processor: Arc<dyn StreamReceiver>, logger: Arc<LogFilter>,
    ) -> Self {
        let num = config.session_shards.max(1);
        let mut shards = Vec::with_capacity(num);
        for _ in 0..num {
            shards.push(Mutex::new(FxHashMap::default()));
        }
        Self {
            shards,
            seed: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            config,
            processor,
            logger,
        }
    }

    #[inline(always)]
    fn shard(&self, id: u64) -> MutexGuard<'_, FxHashMap<u64, Arc<Session>>> {
        let shard = &self.shards[(id % self.shards.len() as u64) as usize];
        shard.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.shard(id).get(&id).cloned()
    }

    /// Resume the session named by `presented` when its token matches, otherwise
    /// create a new one.
    pub fn get_or_create(&self, presented: &str) -> Result<Arc<Session>, RpcError> {
        if let Some((id, token)) = proto::parse_session(presented) {
            if let Some(session) = self.get(id) {
                if session.token() == token {
                    logger_debug!(self.logger, "resume {:?}", session);
                    return Ok(session);
                }
                logger_warn!(self.logger, "token mismatch for session {}", id);
            } else {
                logger_debug!(self.logger, "session {} not found, create", id);
            }
        }
        if self.count.fetch_add(1, Ordering::AcqRel) >= self.config.server_max_sessions {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(ERR_GATEWAY_SESSION_OVERFLOW
                .msg(format!("sessions reach the limit {}", self.config.server_max_sessions)));
        }
        let id = self.seed.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Arc::new(Session::new(
            id,
            new_token(),
            self.config.clone(),
            self.processor.clone(),
            self.logger.clone(),
        ));
        self.shard(id).insert(id, session.clone());
        logger_debug!(self.logger, "create {:?}", session);
        Ok(session)
    }

    /// Evict sessions idle longer than `session_timeout`, returns the number evicted
    pub fn time_check(&self, now: u64) -> usize {
        let mut evicted = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.lock().unwrap_or_else(|e| e.into_inner());
            guard.retain(|_, session| {
                if session.is_timeout(now) {
                    evicted.push(session.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.count.fetch_sub(evicted.len(), Ordering::AcqRel);
        for session in &evicted {
            logger_info!(self.logger, "evict {:?} on timeout", session);
            session.close_conn();
        }
        evicted.len()
    }

    /// Close every attached connection and drop all sessions
    pub fn close_all(&self) {
        for shard in &self.shards {
            let sessions: Vec<Arc<Session>> = {
                let mut guard = shard.lock().unwrap_or_else(|e| e.into_inner());
                guard.drain().map(|(_, s)| s).collect()
            };
            self.count.fetch_sub(sessions.len(), Ordering::AcqRel);
            for session in sessions {
                session.close_conn();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrpc_core::Stream;
    use rtrpc_core::time::now_ns;
    use std::time::Duration;

    fn new_manager(max: usize) -> SessionManager {
        let mut config = ServerConfig::default();
        config.server_max_sessions = max;
        config.session_shards = 4;
        config.session_timeout = Duration::from_secs(1);
        let processor = Arc::new(|_s: Stream| {});
        SessionManager::new(Arc::new(config), processor, Arc::new(LogFilter::new()))
    }

    #[test]
    fn test_get_or_create() {
        let m = new_manager(2);
        let s1 = m.get_or_create("").expect("create");
        assert_eq!(s1.id(), 1);
        assert_eq!(s1.token().len(), SESSION_TOKEN_LEN);
        assert!(s1.token().chars().all(|c| c.is_ascii_alphanumeric()));

        let again = m.get_or_create(&s1.session_string()).expect("resume");
        assert!(Arc::ptr_eq(&s1, &again));

        // wrong token creates a fresh session
        let s2 = m.get_or_create(&format!("{}-{}", s1.id(), "x".repeat(32))).expect("create");
        assert_eq!(s2.id(), 2);
        assert_eq!(m.len(), 2);

        let e = m.get_or_create("garbage").unwrap_err();
        assert!(e == ERR_GATEWAY_SESSION_OVERFLOW);
        assert_eq!(m.len(), 2);
        // resume still works at capacity
        assert!(m.get_or_create(&s2.session_string()).is_ok());
    }

    #[test]
    fn test_time_check() {
        let m = new_manager(16);
        let s1 = m.get_or_create("").expect("create");
        let s2 = m.get_or_create("").expect("create");
        let now = now_ns();
        assert_eq!(m.time_check(now), 0);
        s2.touch();
        let later = now + Duration::from_millis(1500).as_nanos() as u64;
        s2.active_ns.store(later, Ordering::Release);
        assert_eq!(m.time_check(later), 1);
        assert!(m.get(s1.id()).is_none());
        assert!(m.get(s2.id()).is_some());
        m.close_all();
        assert!(m.is_empty());
    }
}
