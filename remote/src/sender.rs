//! Blocking network sender.
//!
//! Connects, authenticates with the pre-shared secret, optionally arms
//! kernel TLS, then streams each file as FILE_HDR followed by exactly
//! `size` raw bytes, finishing with ALL_DONE. One TCP connection per run.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::fcntl::SpliceFFlags;

use common::scanner::{scan_relative, SendItem};
use common::stats::CopyStats;

use crate::error::{NetError, NetResult};
use crate::keys::{derive_session_keys, generate_nonce};
use crate::ktls;
use crate::protocol::{self, MsgType, NONCE_LEN};

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub src: PathBuf,
    pub host: String,
    pub port: u16,
    pub secret: String,
    /// file -> pipe -> socket zero-copy data path. Benchmarks favor plain
    /// read+send for many-small-files workloads, so this is opt-in.
    pub use_splice: bool,
    pub tls: bool,
    pub queue_depth: usize,
    /// None picks a chunk from the scanned size distribution.
    pub chunk_size: Option<usize>,
}

pub(crate) fn read_frame_header(stream: &mut impl Read) -> NetResult<(MsgType, u32)> {
    let mut header = [0u8; protocol::HEADER_LEN];
    stream.read_exact(&mut header)?;
    protocol::decode_header(&header)
}

pub(crate) fn read_control_payload(
    stream: &mut impl Read,
    ty: MsgType,
    len: u32,
) -> NetResult<Vec<u8>> {
    let len = protocol::check_control_len(ty, len)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// HELLO out, HELLO_OK (or HELLO_FAIL) back. Returns (our nonce, peer
/// nonce) for key derivation.
pub(crate) fn client_handshake(
    stream: &mut TcpStream,
    secret: &str,
) -> NetResult<([u8; NONCE_LEN], [u8; NONCE_LEN])> {
    let sender_nonce = generate_nonce();
    let hello = protocol::encode_hello(secret.as_bytes(), &sender_nonce)?;
    stream.write_all(&hello)?;

    let (ty, len) = read_frame_header(stream)?;
    match ty {
        MsgType::HelloOk => {
            let payload = read_control_payload(stream, ty, len)?;
            let receiver_nonce = protocol::decode_hello_ok(&payload)?;
            Ok((sender_nonce, receiver_nonce))
        }
        MsgType::HelloFail => {
            let payload = read_control_payload(stream, ty, len)?;
            let reason = protocol::decode_hello_fail(&payload)?;
            Err(NetError::AuthFailed(reason))
        }
        other => Err(NetError::Protocol(format!(
            "expected HELLO_OK, got {:?}",
            other
        ))),
    }
}

struct SplicePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SplicePipe {
    fn new(capacity: usize) -> NetResult<Self> {
        let (read, write) = nix::unistd::pipe().map_err(|e| NetError::Io(e.into()))?;
        // Pipe capacity below the chunk size makes every splice a short
        // transfer.
        // Safety: plain fcntl on our own descriptor.
        unsafe {
            libc::fcntl(write.as_raw_fd(), libc::F_SETPIPE_SZ, capacity as libc::c_int);
        }
        Ok(Self { read, write })
    }
}

pub fn run_sender(cfg: &SendConfig, stats: &CopyStats) -> NetResult<()> {
    let (items, sizes) = scan_relative(&cfg.src, stats)?;
    let chunk = cfg.chunk_size.unwrap_or_else(|| sizes.pick_chunk_size());
    stats.add_files_total(items.len() as u64);

    tracing::info!(
        "connecting to {}:{} ({} files, chunk {})",
        cfg.host,
        cfg.port,
        items.len(),
        chunk
    );
    let mut stream = TcpStream::connect((cfg.host.as_str(), cfg.port))?;
    let (sender_nonce, receiver_nonce) = client_handshake(&mut stream, &cfg.secret)?;

    if cfg.tls {
        let keys = derive_session_keys(cfg.secret.as_bytes(), &sender_nonce, &receiver_nonce)?;
        ktls::arm_sender(stream.as_raw_fd(), &keys)?;
    }

    let splice = if cfg.use_splice && cfg.tls {
        // splice into an encrypted socket stalls on ACKs; buffered send
        // wins for these workloads.
        tracing::warn!("--splice ignored with encryption enabled; using buffered send");
        false
    } else {
        cfg.use_splice
    };
    let pipe = if splice { Some(SplicePipe::new(chunk)?) } else { None };
    let mut buffer = vec![0u8; chunk];

    for item in &items {
        send_file(&mut stream, item, &mut buffer, pipe.as_ref(), stats)?;
    }

    stream.write_all(&protocol::encode_all_done())?;
    stream.shutdown(Shutdown::Write)?;
    tracing::info!("transfer complete: {} files", items.len());
    Ok(())
}

fn send_file(
    stream: &mut TcpStream,
    item: &SendItem,
    buffer: &mut [u8],
    pipe: Option<&SplicePipe>,
    stats: &CopyStats,
) -> NetResult<()> {
    // Failures before FILE_HDR leave the wire clean, so they only fail
    // this file. Failures after it would desynchronize the stream and
    // abort the run.
    let mut file = match File::open(&item.abs) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("open {}: {}", item.abs.display(), e);
            stats.file_failed();
            return Ok(());
        }
    };
    let md = match file.metadata() {
        Ok(md) => md,
        Err(e) => {
            tracing::warn!("stat {}: {}", item.abs.display(), e);
            stats.file_failed();
            return Ok(());
        }
    };
    let size = md.len();
    let mode = md.permissions().mode() & 0o777;
    stats.add_bytes_total(size);

    let header = match protocol::encode_file_hdr(size, mode, &item.rel) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("{}: {}", item.rel, e);
            stats.file_failed();
            return Ok(());
        }
    };
    stream.write_all(&header)?;

    let mut remaining = size;
    let mut offset: i64 = 0;
    while remaining > 0 {
        let want = (buffer.len() as u64).min(remaining) as usize;
        if let Some(pipe) = pipe {
            let spliced = nix::fcntl::splice(
                &file,
                Some(&mut offset),
                &pipe.write,
                None,
                want,
                SpliceFFlags::SPLICE_F_MOVE,
            )
            .map_err(|e| NetError::Io(e.into()))?;
            if spliced == 0 {
                return Err(NetError::Protocol(format!(
                    "{}: source shrank mid-transfer",
                    item.rel
                )));
            }
            splice_pipe_to_socket(pipe, stream, spliced)?;
            remaining -= spliced as u64;
            stats.add_bytes_copied(spliced as u64);
        } else {
            let n = file.read(&mut buffer[..want])? as u64;
            if n == 0 {
                return Err(NetError::Protocol(format!(
                    "{}: source shrank mid-transfer",
                    item.rel
                )));
            }
            stream.write_all(&buffer[..n as usize])?;
            remaining -= n;
            stats.add_bytes_copied(n);
        }
    }

    stats.file_completed();
    Ok(())
}

fn splice_pipe_to_socket(pipe: &SplicePipe, stream: &TcpStream, len: usize) -> NetResult<()> {
    let mut remaining = len;
    while remaining > 0 {
        match nix::fcntl::splice(
            &pipe.read,
            None,
            stream,
            None,
            remaining,
            SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_MORE,
        ) {
            Ok(0) => return Err(NetError::Protocol("socket closed mid-splice".into())),
            Ok(n) => remaining -= n,
            Err(nix::errno::Errno::EAGAIN) => continue,
            Err(e) => return Err(NetError::Io(e.into())),
        }
    }
    Ok(())
}
