//! Per-file copy state machine, driven entirely by ring completions.
//!
//! A job advances one stage per completion:
//!
//! ```text
//! QUEUED -> OPENING_SRC -> STATING -> OPENING_DST
//!                                         | (size == 0)
//!                                         +------------------> CLOSING_SRC
//!               READING <-> WRITING       |                         |
//!               SPLICE_IN <-> SPLICE_OUT  |                         v
//!                                         +--> ... --> CLOSING_SRC -> CLOSING_DST -> DONE
//! any error -> FAILED
//! ```
//!
//! The job never blocks and never issues more than one ring submission at
//! a time, so completion ordering between jobs is irrelevant. Buffer and
//! pipe loans are held by index into the worker's pools; exactly one loan
//! kind is held while data moves, and the choice of data path is made once
//! per job.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::buffer_pool::BufferPool;
use crate::error::EngineResult;
use crate::pipe_pool::PipePool;
use crate::ring::Ring;
use crate::scanner::WorkItem;
use crate::stats::CopyStats;

static EMPTY_PATH: &CStr = c"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    OpeningSrc,
    Stating,
    OpeningDst,
    Reading,
    Writing,
    SpliceIn,
    SpliceOut,
    ClosingSrc,
    ClosingDst,
    Done,
    Failed,
}

pub struct FileJob {
    src: CString,
    dst: CString,
    src_path: PathBuf,
    dst_path: PathBuf,
    state: JobState,
    src_fd: RawFd,
    dst_fd: RawFd,
    size: u64,
    pos: u64,
    mode: u32,
    buf_idx: Option<usize>,
    buf_ptr: *mut u8,
    pipe_idx: Option<usize>,
    pipe_read: RawFd,
    pipe_write: RawFd,
    want_splice: bool,
    stx: libc::statx,
}

impl FileJob {
    pub fn new(item: WorkItem, want_splice: bool) -> Option<Self> {
        let src = CString::new(item.src.as_os_str().as_bytes()).ok()?;
        let dst = CString::new(item.dst.as_os_str().as_bytes()).ok()?;
        Some(Self {
            src,
            dst,
            src_path: item.src,
            dst_path: item.dst,
            state: JobState::Queued,
            src_fd: -1,
            dst_fd: -1,
            size: 0,
            pos: 0,
            mode: 0o644,
            buf_idx: None,
            buf_ptr: std::ptr::null_mut(),
            pipe_idx: None,
            pipe_read: -1,
            pipe_write: -1,
            want_splice,
            // Safety: statx is a plain C struct; the kernel fills it.
            stx: unsafe { std::mem::zeroed() },
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Done | JobState::Failed)
    }

    pub fn set_buffer(&mut self, idx: usize, ptr: *mut u8) {
        self.buf_idx = Some(idx);
        self.buf_ptr = ptr;
    }

    /// Loan a pipe for the zero-copy path. Without one the job runs
    /// buffered even when splice was requested for the run.
    pub fn set_pipe(&mut self, idx: usize, read: RawFd, write: RawFd) {
        self.pipe_idx = Some(idx);
        self.pipe_read = read;
        self.pipe_write = write;
    }

    /// Submit the source open; the job's token rides along as user data.
    pub fn start(&mut self, ring: &mut Ring, token: u64) -> EngineResult<()> {
        self.state = JobState::OpeningSrc;
        ring.push_openat(libc::AT_FDCWD, &self.src, libc::O_RDONLY, 0, token, false)
    }

    /// Advance by one completion. `result` is the raw CQE result for the
    /// submission this job had outstanding.
    pub fn advance(
        &mut self,
        result: i32,
        token: u64,
        ring: &mut Ring,
        chunk: u32,
        stats: &CopyStats,
        buffers: &mut BufferPool,
    ) -> EngineResult<()> {
        if result < 0 {
            // A linked submission cancelled by its failed predecessor is
            // not an event of its own.
            if result == -libc::ECANCELED && self.state == JobState::Failed {
                return Ok(());
            }
            self.fail(result, stats);
            return Ok(());
        }

        match self.state {
            JobState::OpeningSrc => {
                self.src_fd = result;
                self.state = JobState::Stating;
                // statx through the descriptor we just opened, not the
                // path: the file may have been renamed since the scan.
                ring.push_statx(
                    self.src_fd,
                    EMPTY_PATH,
                    libc::AT_EMPTY_PATH,
                    libc::STATX_SIZE | libc::STATX_MODE,
                    &mut self.stx,
                    token,
                    false,
                )?;
            }
            JobState::Stating => {
                self.size = self.stx.stx_size;
                self.mode = u32::from(self.stx.stx_mode) & 0o777;
                stats.add_bytes_total(self.size);
                self.state = JobState::OpeningDst;
                ring.push_openat(
                    libc::AT_FDCWD,
                    &self.dst,
                    libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                    self.mode,
                    token,
                    false,
                )?;
            }
            JobState::OpeningDst => {
                self.dst_fd = result;
                if self.size == 0 {
                    self.state = JobState::ClosingSrc;
                    ring.push_close(self.src_fd, token, false)?;
                } else {
                    self.enter_data_path(token, ring, chunk, buffers)?;
                }
            }
            JobState::Reading => {
                if result == 0 {
                    // EOF before the stat-reported size: the file shrank
                    // underneath us.
                    self.fail(-libc::EIO, stats);
                    return Ok(());
                }
                self.state = JobState::Writing;
                ring.push_write(self.dst_fd, self.buf_ptr, result as u32, self.pos, token, false)?;
            }
            JobState::Writing => {
                self.pos += result as u64;
                stats.add_bytes_copied(result as u64);
                if self.pos >= self.size {
                    self.state = JobState::ClosingSrc;
                    ring.push_close(self.src_fd, token, false)?;
                } else {
                    // Short writes land here too; the next read picks up
                    // at the new position.
                    self.state = JobState::Reading;
                    let len = self.next_len(chunk);
                    ring.push_read(self.src_fd, self.buf_ptr, len, self.pos, token, false)?;
                }
            }
            JobState::SpliceIn => {
                if result == 0 {
                    self.fail(-libc::EIO, stats);
                    return Ok(());
                }
                self.state = JobState::SpliceOut;
                ring.push_splice(
                    self.pipe_read,
                    -1,
                    self.dst_fd,
                    self.pos as i64,
                    result as u32,
                    token,
                    false,
                )?;
            }
            JobState::SpliceOut => {
                self.pos += result as u64;
                stats.add_bytes_copied(result as u64);
                if self.pos >= self.size {
                    self.state = JobState::ClosingSrc;
                    ring.push_close(self.src_fd, token, false)?;
                } else {
                    self.state = JobState::SpliceIn;
                    let len = self.next_len(chunk);
                    ring.push_splice(
                        self.src_fd,
                        self.pos as i64,
                        self.pipe_write,
                        -1,
                        len,
                        token,
                        false,
                    )?;
                }
            }
            JobState::ClosingSrc => {
                self.src_fd = -1;
                self.state = JobState::ClosingDst;
                ring.push_close(self.dst_fd, token, false)?;
            }
            JobState::ClosingDst => {
                self.dst_fd = -1;
                self.state = JobState::Done;
                stats.file_completed();
                // openat's mode goes through the umask; restore the source
                // bits exactly.
                if let Err(e) = std::fs::set_permissions(
                    &self.dst_path,
                    std::fs::Permissions::from_mode(self.mode),
                ) {
                    tracing::debug!("chmod {}: {}", self.dst_path.display(), e);
                }
            }
            JobState::Queued | JobState::Done | JobState::Failed => {
                tracing::debug!(
                    "stray completion for {} in state {:?}",
                    self.src_path.display(),
                    self.state
                );
            }
        }
        Ok(())
    }

    fn enter_data_path(
        &mut self,
        token: u64,
        ring: &mut Ring,
        chunk: u32,
        buffers: &mut BufferPool,
    ) -> EngineResult<()> {
        let len = self.next_len(chunk);
        if self.want_splice && self.pipe_idx.is_some() {
            // One loan kind during data transfer: the buffer goes back
            // now that the pipe carries the bytes.
            if let Some(buf_idx) = self.buf_idx.take() {
                buffers.release(buf_idx);
                self.buf_ptr = std::ptr::null_mut();
            }
            self.state = JobState::SpliceIn;
            return ring.push_splice(
                self.src_fd,
                self.pos as i64,
                self.pipe_write,
                -1,
                len,
                token,
                false,
            );
        }
        self.state = JobState::Reading;
        ring.push_read(self.src_fd, self.buf_ptr, len, self.pos, token, false)
    }

    fn next_len(&self, chunk: u32) -> u32 {
        u64::from(chunk).min(self.size - self.pos) as u32
    }

    fn fail(&mut self, result: i32, stats: &CopyStats) {
        if self.is_terminal() {
            return;
        }
        tracing::warn!(
            "{}: {} (state {:?})",
            self.src_path.display(),
            std::io::Error::from_raw_os_error(-result),
            self.state
        );
        self.state = JobState::Failed;
        stats.file_failed();
        // Descriptors are torn down synchronously, source before
        // destination.
        if self.src_fd >= 0 {
            // Safety: fd was returned by the kernel for this job and is
            // closed exactly once.
            unsafe { libc::close(self.src_fd) };
            self.src_fd = -1;
        }
        if self.dst_fd >= 0 {
            unsafe { libc::close(self.dst_fd) };
            self.dst_fd = -1;
        }
    }

    /// Hand loans back; called exactly once when the job leaves the
    /// in-flight set.
    pub fn release_loans(&mut self, buffers: &mut BufferPool, pipes: &mut PipePool) {
        if let Some(idx) = self.buf_idx.take() {
            buffers.release(idx);
            self.buf_ptr = std::ptr::null_mut();
        }
        if let Some(idx) = self.pipe_idx.take() {
            pipes.release(idx);
            self.pipe_read = -1;
            self.pipe_write = -1;
        }
    }
}
