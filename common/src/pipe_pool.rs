//! Fixed pool of kernel pipes used as splice conduits.
//!
//! Pipe capacity is set to the chunk size at construction. This matters:
//! with a pipe smaller than the chunk, a single splice cannot fill it and
//! the zero-copy path degrades to many short transfers.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use nix::unistd::pipe;

use crate::error::{EngineError, EngineResult};

struct PipeSlot {
    read: OwnedFd,
    write: OwnedFd,
}

pub struct PipePool {
    slots: Vec<PipeSlot>,
    available: Vec<bool>,
}

impl PipePool {
    pub fn new(count: usize, capacity: usize) -> EngineResult<Self> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let (read, write) = pipe().map_err(|e| EngineError::Io(e.into()))?;
            // Safety: plain fcntl on a descriptor we own.
            let ret = unsafe {
                libc::fcntl(
                    write.as_raw_fd(),
                    libc::F_SETPIPE_SZ,
                    capacity as libc::c_int,
                )
            };
            if ret < 0 {
                tracing::warn!(
                    "failed to set pipe capacity to {}: {}",
                    capacity,
                    std::io::Error::last_os_error()
                );
            }
            slots.push(PipeSlot { read, write });
        }
        Ok(Self {
            available: vec![true; count],
            slots,
        })
    }

    /// A pool that never lends anything; used when the buffered path is
    /// selected for the whole run.
    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            available: Vec::new(),
        }
    }

    pub fn acquire(&mut self) -> Option<usize> {
        let idx = self.available.iter().position(|a| *a)?;
        self.available[idx] = false;
        Some(idx)
    }

    /// Invalid or repeated indices are a no-op.
    pub fn release(&mut self, idx: usize) {
        if let Some(slot) = self.available.get_mut(idx) {
            *slot = true;
        }
    }

    pub fn fds(&self, idx: usize) -> (RawFd, RawFd) {
        let slot = &self.slots[idx];
        (slot.read.as_raw_fd(), slot.write.as_raw_fd())
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.available.iter().filter(|a| **a).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balance() {
        let mut pool = PipePool::new(2, 64 * 1024).unwrap();
        let a = pool.acquire().unwrap();
        let (r, w) = pool.fds(a);
        assert!(r >= 0 && w >= 0 && r != w);
        assert_eq!(pool.available(), 1);
        pool.release(a);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn empty_pool_never_lends() {
        let mut pool = PipePool::empty();
        assert!(pool.acquire().is_none());
        pool.release(0);
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn pipes_actually_carry_data() {
        let mut pool = PipePool::new(1, 4096).unwrap();
        let idx = pool.acquire().unwrap();
        let (r, w) = pool.fds(idx);
        let msg = b"ping";
        let mut buf = [0u8; 4];
        // Safety: descriptors are owned by the pool slot for the duration.
        unsafe {
            assert_eq!(libc::write(w, msg.as_ptr().cast(), msg.len()), 4);
            assert_eq!(libc::read(r, buf.as_mut_ptr().cast(), buf.len()), 4);
        }
        assert_eq!(&buf, b"ping");
        pool.release(idx);
    }
}
