//! Process-wide pool of fixed size frames

use std::sync::Mutex;

pub const FRAME_SIZE: usize = 512;

/// Frames kept in the free list above this count are returned to the allocator
const POOL_HIGH_WATER: usize = 16384;

pub type Frame = Box<[u8; FRAME_SIZE]>;

static POOL: Mutex<Vec<Frame>> = Mutex::new(Vec::new());

/// Get a frame, content is unspecified
#[inline]
pub fn acquire_frame() -> Frame {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(frame) = pool.pop() {
        return frame;
    }
    drop(pool);
    Box::new([0u8; FRAME_SIZE])
}

#[inline]
pub fn release_frame(frame: Frame) {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    if pool.len() < POOL_HIGH_WATER {
        pool.push(frame);
    }
}

#[cfg(test)]
pub fn pooled_frames() -> usize {
    POOL.lock().unwrap_or_else(|e| e.into_inner()).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_reuse() {
        let mut f = acquire_frame();
        f[0] = 7;
        release_frame(f);
        assert!(pooled_frames() > 0);
        let f = acquire_frame();
        assert_eq!(f.len(), FRAME_SIZE);
        release_frame(f);
    }
}
