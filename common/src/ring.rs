//! Thin facade over one io_uring instance.
//!
//! One `Ring` per worker thread; nothing here is `Sync`. Every push verb
//! tags the submission with an opaque `u64` token that comes back on the
//! matching [`Completion`]. The ring never owns the memory behind the
//! pointers it is handed: callers must keep buffers, path strings, statx
//! blocks and descriptors alive until the completion for that token has
//! been reaped. The buffer/pipe pools and the boxed job slab uphold this.

use std::ffi::CStr;
use std::os::unix::io::RawFd;

use io_uring::{opcode, squeue, types, IoUring};

use crate::error::{EngineError, EngineResult};

/// One reaped completion: the token passed at submission time and the raw
/// kernel result (>= 0 success, < 0 negated errno).
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub token: u64,
    pub result: i32,
}

impl Completion {
    /// Linked submissions cancelled because their predecessor failed
    /// complete with this; it is not an error in its own right.
    pub fn is_cancelled(&self) -> bool {
        self.result == -libc::ECANCELED
    }
}

pub struct Ring {
    ring: IoUring,
    depth: u32,
}

impl Ring {
    pub fn new(depth: u32) -> EngineResult<Self> {
        let ring = IoUring::new(depth)?;
        Ok(Self { ring, depth })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn finish(entry: squeue::Entry, token: u64, link: bool) -> squeue::Entry {
        let entry = entry.user_data(token);
        if link {
            entry.flags(squeue::Flags::IO_LINK)
        } else {
            entry
        }
    }

    /// Queue one entry; when the submission queue is full, drain it to the
    /// kernel once and retry. A second failure is fatal.
    fn push(&mut self, entry: squeue::Entry) -> EngineResult<()> {
        // Safety: per the module contract, the caller keeps all memory
        // referenced by the entry alive until its completion is reaped.
        unsafe {
            if self.ring.submission().push(&entry).is_ok() {
                return Ok(());
            }
            self.ring.submit()?;
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| EngineError::RingFull)
        }
    }

    pub fn push_openat(
        &mut self,
        dirfd: RawFd,
        path: &CStr,
        flags: i32,
        mode: u32,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::OpenAt::new(types::Fd(dirfd), path.as_ptr())
            .flags(flags)
            .mode(mode)
            .build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_statx(
        &mut self,
        dirfd: RawFd,
        path: &CStr,
        flags: i32,
        mask: u32,
        out: *mut libc::statx,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::Statx::new(types::Fd(dirfd), path.as_ptr(), out.cast())
            .flags(flags)
            .mask(mask)
            .build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::Read::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_write(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::Write::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build();
        self.push(Self::finish(entry, token, link))
    }

    /// Pipe-side offsets must be -1 ("not applicable"); file-side offsets
    /// are absolute byte positions.
    pub fn push_splice(
        &mut self,
        fd_in: RawFd,
        off_in: i64,
        fd_out: RawFd,
        off_out: i64,
        len: u32,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::Splice::new(types::Fd(fd_in), off_in, types::Fd(fd_out), off_out, len)
            .flags(libc::SPLICE_F_MOVE)
            .build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_close(&mut self, fd: RawFd, token: u64, link: bool) -> EngineResult<()> {
        let entry = opcode::Close::new(types::Fd(fd)).build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_mkdirat(&mut self, path: &CStr, mode: u32, token: u64) -> EngineResult<()> {
        let entry = opcode::MkDirAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
            .mode(mode)
            .build();
        self.push(Self::finish(entry, token, false))
    }

    pub fn push_connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        token: u64,
    ) -> EngineResult<()> {
        let entry = opcode::Connect::new(types::Fd(fd), addr, addrlen).build();
        self.push(Self::finish(entry, token, false))
    }

    pub fn push_accept(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        token: u64,
    ) -> EngineResult<()> {
        let entry = opcode::Accept::new(types::Fd(fd), addr, addrlen).build();
        self.push(Self::finish(entry, token, false))
    }

    pub fn push_send(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        flags: i32,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::Send::new(types::Fd(fd), buf, len).flags(flags).build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_recv(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        flags: i32,
        token: u64,
        link: bool,
    ) -> EngineResult<()> {
        let entry = opcode::Recv::new(types::Fd(fd), buf, len).flags(flags).build();
        self.push(Self::finish(entry, token, link))
    }

    pub fn push_shutdown(&mut self, fd: RawFd, how: i32, token: u64) -> EngineResult<()> {
        let entry = opcode::Shutdown::new(types::Fd(fd), how).build();
        self.push(Self::finish(entry, token, false))
    }

    /// Hand queued entries to the kernel without blocking.
    pub fn submit(&mut self) -> EngineResult<usize> {
        Ok(self.ring.submit()?)
    }

    /// Submit anything pending, block until at least one completion is
    /// available, then drain the completion queue into `out`.
    pub fn wait_completions(&mut self, out: &mut Vec<Completion>) -> EngineResult<usize> {
        self.ring.submit_and_wait(1)?;
        let before = out.len();
        for cqe in self.ring.completion() {
            out.push(Completion {
                token: cqe.user_data(),
                result: cqe.result(),
            });
        }
        Ok(out.len() - before)
    }

    /// Drain any already-available completions without blocking.
    pub fn peek_completions(&mut self, out: &mut Vec<Completion>) -> usize {
        let before = out.len();
        for cqe in self.ring.completion() {
            out.push(Completion {
                token: cqe.user_data(),
                result: cqe.result(),
            });
        }
        out.len() - before
    }
}
