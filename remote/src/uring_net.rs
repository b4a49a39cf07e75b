//! Pipelined network engines on the ring.
//!
//! The wire format is identical to the blocking engines; what changes is
//! how I/O is scheduled. The sender keeps up to queue-depth files in the
//! open/stat/read pipeline so disk latency hides behind the socket, while
//! the byte stream itself stays strictly ordered: one file is "sending"
//! at a time, its chunks flowing through ring send submissions. The
//! receiver reads the 5-byte frame headers synchronously (TCP already
//! serializes them) and moves body bytes and file open/write/close
//! through the ring.
//!
//! These engines run plaintext only; the record layer is not armed here.

use std::ffi::{CStr, CString};
use std::io::Write;
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;

use common::buffer_pool::BufferPool;
use common::ring::{Completion, Ring};
use common::scanner::{scan_relative, SendItem};
use common::stats::CopyStats;

use crate::error::{NetError, NetResult};
use crate::protocol;
use crate::receiver::{bind_listener, contained_path, server_handshake, RecvConfig};
use crate::sender::{client_handshake, read_control_payload, read_frame_header, SendConfig};

static EMPTY_PATH: &CStr = c"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Opening,
    Stating,
    /// Opened and measured, waiting for its turn on the wire.
    Ready,
    Reading,
    /// Pushing the just-read chunk into the socket.
    Sending,
    Closing,
    Done,
    Failed,
}

struct SendJob {
    abs: CString,
    rel: String,
    phase: SendPhase,
    fd: RawFd,
    size: u64,
    mode: u32,
    offset: u64,
    buf_idx: usize,
    /// Bytes of the current chunk, and how many of them reached the
    /// socket so far.
    chunk_len: u32,
    chunk_sent: u32,
    stx: libc::statx,
}

impl SendJob {
    fn is_terminal(&self) -> bool {
        matches!(self.phase, SendPhase::Done | SendPhase::Failed)
    }
}

fn skip_job(job: &mut SendJob, buffers: &mut BufferPool, stats: &CopyStats) {
    if job.fd >= 0 {
        // Safety: descriptor belongs to this job and is closed once.
        unsafe { libc::close(job.fd) };
        job.fd = -1;
    }
    buffers.release(job.buf_idx);
    job.phase = SendPhase::Failed;
    stats.file_failed();
}

pub fn run_uring_sender(cfg: &SendConfig, stats: &CopyStats) -> NetResult<()> {
    if cfg.tls {
        return Err(NetError::Protocol(
            "encryption is not supported with the pipelined sender".into(),
        ));
    }
    let (items, sizes) = scan_relative(&cfg.src, stats)?;
    let chunk = cfg.chunk_size.unwrap_or_else(|| sizes.pick_chunk_size());
    stats.add_files_total(items.len() as u64);

    tracing::info!(
        "connecting to {}:{} (pipelined, {} files)",
        cfg.host,
        cfg.port,
        items.len()
    );
    let mut stream = TcpStream::connect((cfg.host.as_str(), cfg.port))?;
    client_handshake(&mut stream, &cfg.secret)?;

    let mut jobs = build_jobs(items, stats);
    if !jobs.is_empty() {
        let depth = cfg.queue_depth.clamp(1, jobs.len().max(1));
        pipelined_send(&mut stream, &mut jobs, chunk as u32, depth, stats)?;
    }
    stream.write_all(&protocol::encode_all_done())?;
    tracing::info!("transfer complete");
    Ok(())
}

fn build_jobs(items: Vec<SendItem>, stats: &CopyStats) -> Vec<Box<SendJob>> {
    let mut jobs = Vec::with_capacity(items.len());
    for item in items {
        let Ok(abs) = CString::new(item.abs.as_os_str().as_bytes()) else {
            stats.file_failed();
            continue;
        };
        jobs.push(Box::new(SendJob {
            abs,
            rel: item.rel,
            phase: SendPhase::Ready, // placeholder; set at open submit
            fd: -1,
            size: 0,
            mode: 0o644,
            offset: 0,
            buf_idx: usize::MAX,
            chunk_len: 0,
            chunk_sent: 0,
            // Safety: plain C struct filled by the kernel.
            stx: unsafe { std::mem::zeroed() },
        }));
    }
    jobs
}

fn pipelined_send(
    stream: &mut TcpStream,
    jobs: &mut [Box<SendJob>],
    chunk: u32,
    depth: usize,
    stats: &CopyStats,
) -> NetResult<()> {
    use std::os::unix::io::AsRawFd;

    let sock = stream.as_raw_fd();
    let mut ring = Ring::new(depth as u32)?;
    let mut buffers = BufferPool::new(depth, chunk as usize)?;
    let mut completions: Vec<Completion> = Vec::with_capacity(depth * 2);
    let mut next_open = 0usize;
    let mut next_send = 0usize;
    let mut in_flight = 0usize;
    let mut sending = false;

    loop {
        // Prefetch: open and stat ahead of the wire cursor.
        while next_open < jobs.len() && in_flight < depth {
            let Some(buf_idx) = buffers.acquire() else { break };
            let job = &mut jobs[next_open];
            job.buf_idx = buf_idx;
            job.phase = SendPhase::Opening;
            ring.push_openat(
                libc::AT_FDCWD,
                &job.abs,
                libc::O_RDONLY,
                0,
                next_open as u64,
                false,
            )?;
            next_open += 1;
            in_flight += 1;
        }

        while next_send < jobs.len() && jobs[next_send].is_terminal() {
            next_send += 1;
        }
        if next_send >= jobs.len() {
            break;
        }

        if !sending && jobs[next_send].phase == SendPhase::Ready {
            let idx = next_send;
            let job = &mut jobs[idx];
            match protocol::encode_file_hdr(job.size, job.mode, &job.rel) {
                Ok(header) => {
                    stream.write_all(&header)?;
                    stats.add_bytes_total(job.size);
                    if job.size == 0 {
                        job.phase = SendPhase::Closing;
                        ring.push_close(job.fd, idx as u64, false)?;
                    } else {
                        job.phase = SendPhase::Reading;
                        let len = u64::from(chunk).min(job.size) as u32;
                        ring.push_read(job.fd, buffers.ptr(job.buf_idx), len, 0, idx as u64, false)?;
                    }
                    sending = true;
                }
                Err(e) => {
                    tracing::warn!("{}: {}", job.rel, e);
                    skip_job(job, &mut buffers, stats);
                    in_flight -= 1;
                }
            }
            continue;
        }

        if in_flight == 0 {
            // Cannot happen while the cursor points at a live job; the
            // job ahead of the cursor always has an outstanding op.
            return Err(NetError::Protocol("pipelined sender stalled".into()));
        }

        completions.clear();
        ring.wait_completions(&mut completions)?;
        for c in &completions {
            let idx = c.token as usize;
            let Some(job) = jobs.get_mut(idx) else {
                continue;
            };
            match job.phase {
                SendPhase::Opening => {
                    if c.result < 0 {
                        tracing::warn!(
                            "open {}: {}",
                            job.rel,
                            std::io::Error::from_raw_os_error(-c.result)
                        );
                        skip_job(job, &mut buffers, stats);
                        in_flight -= 1;
                    } else {
                        job.fd = c.result;
                        job.phase = SendPhase::Stating;
                        ring.push_statx(
                            job.fd,
                            EMPTY_PATH,
                            libc::AT_EMPTY_PATH,
                            libc::STATX_SIZE | libc::STATX_MODE,
                            &mut job.stx,
                            idx as u64,
                            false,
                        )?;
                    }
                }
                SendPhase::Stating => {
                    if c.result < 0 {
                        tracing::warn!(
                            "stat {}: {}",
                            job.rel,
                            std::io::Error::from_raw_os_error(-c.result)
                        );
                        skip_job(job, &mut buffers, stats);
                        in_flight -= 1;
                    } else {
                        job.size = job.stx.stx_size;
                        job.mode = u32::from(job.stx.stx_mode) & 0o777;
                        job.phase = SendPhase::Ready;
                    }
                }
                SendPhase::Reading => {
                    // The header already promised `size` bytes; any
                    // failure here desynchronizes the stream.
                    if c.result < 0 {
                        return Err(NetError::Io(std::io::Error::from_raw_os_error(-c.result)));
                    }
                    if c.result == 0 {
                        return Err(NetError::Protocol(format!(
                            "{}: source shrank mid-transfer",
                            job.rel
                        )));
                    }
                    job.chunk_len = c.result as u32;
                    job.chunk_sent = 0;
                    job.phase = SendPhase::Sending;
                    let more = job.offset + u64::from(job.chunk_len) < job.size;
                    ring.push_send(
                        sock,
                        buffers.ptr(job.buf_idx),
                        job.chunk_len,
                        if more { libc::MSG_MORE } else { 0 },
                        idx as u64,
                        false,
                    )?;
                }
                SendPhase::Sending => {
                    if c.result < 0 {
                        return Err(NetError::Io(std::io::Error::from_raw_os_error(-c.result)));
                    }
                    if c.result == 0 {
                        return Err(NetError::Protocol("socket closed mid-send".into()));
                    }
                    job.chunk_sent += c.result as u32;
                    if job.chunk_sent < job.chunk_len {
                        // Partial send: push the rest of the chunk.
                        let ptr = buffers.ptr(job.buf_idx);
                        // Safety: offsetting within the loaned buffer.
                        let rest = unsafe { ptr.add(job.chunk_sent as usize) };
                        ring.push_send(
                            sock,
                            rest,
                            job.chunk_len - job.chunk_sent,
                            0,
                            idx as u64,
                            false,
                        )?;
                        continue;
                    }
                    job.offset += u64::from(job.chunk_len);
                    stats.add_bytes_copied(u64::from(job.chunk_len));
                    if job.offset >= job.size {
                        job.phase = SendPhase::Closing;
                        ring.push_close(job.fd, idx as u64, false)?;
                    } else {
                        job.phase = SendPhase::Reading;
                        let len = u64::from(chunk).min(job.size - job.offset) as u32;
                        ring.push_read(
                            job.fd,
                            buffers.ptr(job.buf_idx),
                            len,
                            job.offset,
                            idx as u64,
                            false,
                        )?;
                    }
                }
                SendPhase::Closing => {
                    job.fd = -1;
                    if c.result < 0 {
                        job.phase = SendPhase::Failed;
                        stats.file_failed();
                    } else {
                        job.phase = SendPhase::Done;
                        stats.file_completed();
                    }
                    buffers.release(job.buf_idx);
                    in_flight -= 1;
                    if idx == next_send {
                        sending = false;
                        next_send += 1;
                    }
                }
                SendPhase::Ready | SendPhase::Done | SendPhase::Failed => {
                    tracing::debug!("stray completion for {} ({:?})", job.rel, job.phase);
                }
            }
        }
    }
    Ok(())
}

fn wait_single(ring: &mut Ring) -> NetResult<i32> {
    let mut completions = Vec::with_capacity(1);
    ring.wait_completions(&mut completions)?;
    Ok(completions[0].result)
}

pub fn run_uring_receiver(cfg: &RecvConfig, stats: &CopyStats) -> NetResult<()> {
    if cfg.tls {
        return Err(NetError::Protocol(
            "encryption is not supported with the pipelined receiver".into(),
        ));
    }
    std::fs::create_dir_all(&cfg.dst)?;
    let listener = bind_listener(cfg.port)?;
    tracing::info!(
        "listening on port {} (pipelined)",
        listener.local_addr()?.port()
    );
    let (mut stream, peer) = listener.accept()?;
    drop(listener);
    tracing::info!("connection from {}", peer);
    server_handshake(&mut stream, &cfg.secret)?;

    let root = cfg.dst.canonicalize()?;
    let chunk = cfg.chunk_size.unwrap_or(common::config::DEFAULT_CHUNK_SIZE);
    let mut ring = Ring::new(8)?;
    let mut buffer = vec![0u8; chunk];
    let mut received = 0u64;

    loop {
        let (ty, len) = read_frame_header(&mut stream)?;
        match ty {
            protocol::MsgType::AllDone => break,
            protocol::MsgType::FileHdr => {
                let payload = read_control_payload(&mut stream, ty, len)?;
                let hdr = protocol::decode_file_hdr(&payload)?;
                receive_one(&mut stream, &mut ring, &root, &hdr, &mut buffer, stats)?;
                received += 1;
            }
            other => {
                return Err(NetError::Protocol(format!(
                    "unexpected {:?} frame between files",
                    other
                )))
            }
        }
    }
    tracing::info!("transfer complete: {} files received", received);
    Ok(())
}

fn receive_one(
    stream: &mut TcpStream,
    ring: &mut Ring,
    root: &std::path::Path,
    hdr: &protocol::FileHdr,
    buffer: &mut [u8],
    stats: &CopyStats,
) -> NetResult<()> {
    use std::os::unix::io::AsRawFd;

    let sock = stream.as_raw_fd();
    stats.add_files_total(1);
    stats.add_bytes_total(hdr.size);
    let full = contained_path(root, &hdr.path, stats)?;
    let path = CString::new(full.as_os_str().as_bytes())
        .map_err(|_| NetError::Protocol(format!("NUL in path {}", hdr.path)))?;

    let mode = hdr.mode & 0o777;
    // O_NOFOLLOW mirrors the blocking receiver: a symlink at the final
    // component must not redirect the write outside the root.
    ring.push_openat(
        libc::AT_FDCWD,
        &path,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_NOFOLLOW,
        mode,
        0,
        false,
    )?;
    let fd = wait_single(ring)?;
    if fd < 0 {
        return Err(NetError::Io(std::io::Error::from_raw_os_error(-fd)));
    }

    let mut received = 0u64;
    while received < hdr.size {
        let want = (buffer.len() as u64).min(hdr.size - received) as usize;
        // Body bytes come off the socket through the ring; short receives
        // just repost for the remainder.
        let mut got = 0usize;
        while got < want {
            ring.push_recv(
                sock,
                buffer[got..].as_mut_ptr(),
                (want - got) as u32,
                0,
                0,
                false,
            )?;
            let res = wait_single(ring)?;
            if res < 0 {
                // Safety: fd came from the openat above.
                unsafe { libc::close(fd) };
                return Err(NetError::Io(std::io::Error::from_raw_os_error(-res)));
            }
            if res == 0 {
                unsafe { libc::close(fd) };
                return Err(NetError::Protocol("connection closed mid-file".into()));
            }
            got += res as usize;
        }
        let mut written = 0usize;
        while written < want {
            ring.push_write(
                fd,
                buffer[written..].as_ptr(),
                (want - written) as u32,
                received + written as u64,
                0,
                false,
            )?;
            let res = wait_single(ring)?;
            if res <= 0 {
                // Safety: fd came from the openat above.
                unsafe { libc::close(fd) };
                let errno = if res < 0 { -res } else { libc::EIO };
                return Err(NetError::Io(std::io::Error::from_raw_os_error(errno)));
            }
            written += res as usize;
        }
        received += want as u64;
        stats.add_bytes_copied(want as u64);
    }

    ring.push_close(fd, 0, false)?;
    let res = wait_single(ring)?;
    if res < 0 {
        stats.file_failed();
        return Ok(());
    }
    if let Err(e) = std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)) {
        tracing::debug!("chmod {}: {}", full.display(), e);
    }
    stats.file_completed();
    Ok(())
}
