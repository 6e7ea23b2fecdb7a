use rtrpc_core::Stream;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(strum::Display, strum::FromRepr, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum RecordStatus {
    Idle = 0,
    Running = 1,
    Done = 2,
}

/// One callback slot: the right to run exactly one request and to cache its response.
pub struct SessionRecord {
    id: u64,
    status: AtomicU8,
    mark: AtomicBool,
    response: OnceLock<Stream>,
}

impl SessionRecord {
    #[inline]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            status: AtomicU8::new(RecordStatus::Idle as u8),
            mark: AtomicBool::new(false),
            response: OnceLock::new(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn status(&self) -> RecordStatus {
        RecordStatus::from_repr(self.status.load(Ordering::Acquire)).unwrap_or(RecordStatus::Done)
    }

    /// True exactly once, for the first caller seeing the record Idle
    #[inline]
    pub fn set_running(&self) -> bool {
        self.status
            .compare_exchange(
                RecordStatus::Idle as u8,
                RecordStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// True exactly once, on Running -> Done. A losing stream is dropped here.
    ///
    /// The response is installed before the status moves, so a record seen Done
    /// always has its response cached.
    pub fn set_response(&self, stream: Stream) -> bool {
        if self.status() != RecordStatus::Running {
            return false;
        }
        if self.response.set(stream).is_err() {
            return false;
        }
        self.status.store(RecordStatus::Done as u8, Ordering::Release);
        true
    }

    /// The cached response, may be Some while the status still reads Running
    #[inline]
    pub fn get_response(&self) -> Option<&Stream> {
        self.response.get()
    }

    #[inline]
    pub fn set_mark(&self) {
        self.mark.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Acquire)
    }

    /// Read and clear the mark
    #[inline]
    pub fn take_mark(&self) -> bool {
        self.mark.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "record({} {} mark={})", self.id, self.status(), self.is_marked())
    }
}
