//! Per-thread buffer pools for scratch tensors.
//!
//! Each worker thread owns its own arena: buffers are bucketed at powers of
//! two between 64 and 65536 float elements, requests above the top bucket
//! bypass the pool. A buffer rented on one thread must be released on the
//! same thread; [`Scratch`] guards do this on every exit path, including
//! unwinding out of a failed forward pass.

use std::cell::RefCell;

use thiserror::Error;

use crate::tensor::{Shape, Tensor};

const MIN_BUCKET_ELEMS: usize = 64;
const MAX_BUCKET_ELEMS: usize = 65536;
const N_BUCKETS: usize = 11; // 64, 128, ..., 65536

/// Default ceiling on bytes a single thread's arena may hold live.
/// Large enough for the per-token scratch of small models; the engine may
/// raise it for long prefills.
pub const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// The pool is exhausted and the byte budget forbids a fresh allocation.
    #[error("arena out of memory: {requested} bytes requested, {live} live of {budget} budget")]
    OutOfMemory {
        requested: usize,
        live: usize,
        budget: usize,
    },
}

/// A size-bucketed pool of fp32 buffers.
pub struct Arena {
    buckets: [Vec<Box<[f32]>>; N_BUCKETS],
    /// Bytes in rented-out buffers plus pooled buffers.
    live_bytes: usize,
    max_bytes: usize,
}

fn bucket_for(elems: usize) -> Option<usize> {
    if elems > MAX_BUCKET_ELEMS {
        return None;
    }
    let rounded = elems.max(MIN_BUCKET_ELEMS).next_power_of_two();
    Some(rounded.trailing_zeros() as usize - MIN_BUCKET_ELEMS.trailing_zeros() as usize)
}

fn bucket_elems(bucket: usize) -> usize {
    MIN_BUCKET_ELEMS << bucket
}

impl Arena {
    pub fn new(max_bytes: usize) -> Self {
        Arena {
            buckets: Default::default(),
            live_bytes: 0,
            max_bytes,
        }
    }

    /// Obtain a tensor whose buffer holds at least `shape.product()`
    /// elements. Reuses a pooled buffer when one fits; otherwise allocates,
    /// subject to the byte budget.
    pub fn rent(&mut self, shape: Shape) -> Result<Tensor, ArenaError> {
        let elems = shape.product();
        let (capacity, pooled) = match bucket_for(elems) {
            Some(b) => (bucket_elems(b), self.buckets[b].pop()),
            // Oversized requests bypass the pool entirely.
            None => (elems, None),
        };

        let buffer = match pooled {
            Some(buf) => buf,
            None => {
                let bytes = capacity * std::mem::size_of::<f32>();
                if self.live_bytes + bytes > self.max_bytes {
                    log::warn!(
                        "arena refused {bytes}-byte buffer: {} live of {} budget",
                        self.live_bytes,
                        self.max_bytes
                    );
                    return Err(ArenaError::OutOfMemory {
                        requested: bytes,
                        live: self.live_bytes,
                        budget: self.max_bytes,
                    });
                }
                log::trace!("arena grows by {bytes} bytes for {elems} elements");
                self.live_bytes += bytes;
                vec![0.0f32; capacity].into_boxed_slice()
            }
        };

        Ok(Tensor::from_buffer(buffer, shape))
    }

    /// Return a tensor's buffer to the pool. When `sensitive` is set the
    /// buffer is zeroed before it becomes reusable.
    pub fn release(&mut self, mut tensor: Tensor, sensitive: bool) {
        if sensitive {
            tensor.scrub();
        }
        let buffer = tensor.into_buffer();
        match bucket_for(buffer.len()) {
            Some(b) if bucket_elems(b) == buffer.len() => self.buckets[b].push(buffer),
            // Oversized or foreign buffers are dropped, not pooled.
            _ => {
                self.live_bytes = self
                    .live_bytes
                    .saturating_sub(buffer.len() * std::mem::size_of::<f32>());
            }
        }
    }

    /// Bytes currently owned by this arena (pooled + rented).
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Number of buffers waiting in the pool, across all buckets.
    pub fn pooled_buffers(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new(DEFAULT_MAX_BYTES)
    }
}

thread_local! {
    static THREAD_ARENA: RefCell<Arena> = RefCell::new(Arena::default());
}

/// Run `f` with mutable access to the calling thread's arena.
pub fn with_thread_arena<R>(f: impl FnOnce(&mut Arena) -> R) -> R {
    THREAD_ARENA.with(|a| f(&mut a.borrow_mut()))
}

/// Rent a scratch tensor from the calling thread's arena. The buffer is
/// returned automatically when the guard drops.
pub fn scratch(shape: Shape) -> Result<Scratch, ArenaError> {
    let tensor = with_thread_arena(|a| a.rent(shape))?;
    Ok(Scratch {
        tensor: Some(tensor),
        sensitive: false,
    })
}

/// A scoped scratch tensor. Dereferences to [`Tensor`]; the backing buffer
/// goes back to the thread arena on drop, on every exit path.
pub struct Scratch {
    tensor: Option<Tensor>,
    sensitive: bool,
}

impl Scratch {
    /// Request that the buffer be zeroed when it returns to the pool.
    pub fn mark_sensitive(&mut self) {
        self.sensitive = true;
    }
}

impl std::ops::Deref for Scratch {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        self.tensor.as_ref().expect("scratch tensor already released")
    }
}

impl std::ops::DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut Tensor {
        self.tensor.as_mut().expect("scratch tensor already released")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(tensor) = self.tensor.take() {
            with_thread_arena(|a| a.release(tensor, self.sensitive));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounding() {
        assert_eq!(bucket_for(1), Some(0));
        assert_eq!(bucket_for(64), Some(0));
        assert_eq!(bucket_for(65), Some(1));
        assert_eq!(bucket_for(65536), Some(10));
        assert_eq!(bucket_for(65537), None);
    }

    #[test]
    fn rent_reuses_buffers() {
        let mut arena = Arena::new(1 << 20);
        let t = arena.rent(Shape::d1(100)).unwrap();
        assert_eq!(t.capacity(), 128);
        let bytes = arena.live_bytes();
        arena.release(t, false);
        assert_eq!(arena.pooled_buffers(), 1);

        // Same bucket: no new allocation.
        let t2 = arena.rent(Shape::d1(120)).unwrap();
        assert_eq!(arena.live_bytes(), bytes);
        assert_eq!(arena.pooled_buffers(), 0);
        arena.release(t2, false);
    }

    #[test]
    fn oversized_bypasses_pool() {
        let mut arena = Arena::new(16 << 20);
        let t = arena.rent(Shape::d1(MAX_BUCKET_ELEMS + 1)).unwrap();
        assert_eq!(t.capacity(), MAX_BUCKET_ELEMS + 1);
        arena.release(t, false);
        assert_eq!(arena.pooled_buffers(), 0);
        assert_eq!(arena.live_bytes(), 0);
    }

    #[test]
    fn budget_is_enforced() {
        let mut arena = Arena::new(256); // one 64-element buffer max
        let t = arena.rent(Shape::d1(64)).unwrap();
        let err = arena.rent(Shape::d1(64)).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory { .. }));
        arena.release(t, false);
        // The pooled buffer satisfies the next request without allocating.
        assert!(arena.rent(Shape::d1(64)).is_ok());
    }

    #[test]
    fn sensitive_release_scrubs() {
        let mut arena = Arena::new(1 << 20);
        let mut t = arena.rent(Shape::d1(64)).unwrap();
        t.as_mut_slice().fill(7.0);
        arena.release(t, true);
        let t2 = arena.rent(Shape::d1(64)).unwrap();
        assert!(t2.as_slice().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn scratch_guard_returns_on_drop() {
        let before = with_thread_arena(|a| a.pooled_buffers());
        {
            let mut s = scratch(Shape::d2(8, 8)).unwrap();
            s.as_mut_slice()[0] = 1.0;
        }
        let after = with_thread_arena(|a| a.pooled_buffers());
        assert_eq!(after, before + 1);
    }
}
