//! Pooled request/response scratch space.
//!
//! Workers check a [`ProbeScratch`] out of a [`ScratchPool`] and hold it while
//! they run. Every checkout is reset first, and the probe resets it again
//! before each attempt, so nothing leaks from one target or protocol into
//! the next.
use reqwest::header::HeaderMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Body buffers that grew past this are dropped instead of kept for reuse.
const MAX_RETAINED_BODY: usize = 1024 * 1024;

pub trait Reset {
    fn reset(&mut self);
}

/// Headers and body of one HTTP exchange.
#[derive(Debug, Default)]
pub struct ProbeScratch {
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub status: u16,
    pub body: Vec<u8>,
}

impl ProbeScratch {
    /// Clear only the response half, keeping the prepared request headers.
    pub fn reset_response(&mut self) {
        self.response_headers.clear();
        self.status = 0;
        self.body.clear();
    }
}

impl Reset for ProbeScratch {
    fn reset(&mut self) {
        self.request_headers.clear();
        self.response_headers.clear();
        self.status = 0;
        if self.body.capacity() > MAX_RETAINED_BODY {
            self.body = Vec::new();
        } else {
            self.body.clear();
        }
    }
}

#[derive(Debug)]
pub struct ScratchPool<T> {
    free: Mutex<Vec<T>>,
}

impl<T: Reset + Default> ScratchPool<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// Take an item out of the pool (or make a new one), reset and ready.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let mut item = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default();
        item.reset();
        Pooled {
            item: Some(item),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, item: T) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(item);
    }

    /// Items currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Checked-out item; goes back to its pool on drop.
pub struct Pooled<T: Reset + Default> {
    item: Option<T>,
    pool: Arc<ScratchPool<T>>,
}

impl<T: Reset + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T: Reset + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T: Reset + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, HOST};

    #[test]
    fn acquire_resets_reused_items() {
        let pool = ScratchPool::<ProbeScratch>::new();
        {
            let mut s = pool.acquire();
            s.status = 404;
            s.body.extend_from_slice(b"stale body");
            s.request_headers.insert(HOST, HeaderValue::from_static("old.example"));
        }
        assert_eq!(pool.idle(), 1);

        let s = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert_eq!(s.status, 0);
        assert!(s.body.is_empty());
        assert!(s.request_headers.is_empty());
    }

    #[test]
    fn concurrent_checkouts_are_distinct() {
        let pool = ScratchPool::<ProbeScratch>::new();
        let mut a = pool.acquire();
        let b = pool.acquire();
        a.body.push(1);
        assert!(b.body.is_empty());
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn oversized_body_not_retained() {
        let mut s = ProbeScratch::default();
        s.body = vec![0; MAX_RETAINED_BODY + 1];
        s.reset();
        assert_eq!(s.body.capacity(), 0);
    }
}
