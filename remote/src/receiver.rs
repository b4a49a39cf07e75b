//! Blocking network receiver.
//!
//! Binds, accepts exactly one connection, verifies the pre-shared secret
//! (constant time), answers HELLO_OK with its own nonce, optionally arms
//! kernel TLS, then consumes FILE_HDR + body sequences until ALL_DONE.
//! Every path from the wire is validated and contained under the
//! destination root before anything touches the filesystem.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use subtle::ConstantTimeEq;

use common::stats::CopyStats;

use crate::error::{NetError, NetResult};
use crate::keys::{derive_session_keys, generate_nonce};
use crate::ktls;
use crate::protocol::{self, FileHdr, MsgType, NONCE_LEN};
use crate::sender::{read_control_payload, read_frame_header};

#[derive(Debug, Clone)]
pub struct RecvConfig {
    pub dst: PathBuf,
    pub port: u16,
    pub secret: String,
    pub tls: bool,
    pub chunk_size: Option<usize>,
}

pub(crate) fn bind_listener(port: u16) -> NetResult<TcpListener> {
    // Dual-stack where the host allows it, plain IPv4 otherwise.
    match TcpListener::bind(("::", port)) {
        Ok(listener) => Ok(listener),
        Err(_) => Ok(TcpListener::bind(("0.0.0.0", port))?),
    }
}

/// HELLO in, HELLO_OK (or HELLO_FAIL) out. Returns (sender nonce, our
/// nonce) for key derivation.
pub(crate) fn server_handshake(
    stream: &mut TcpStream,
    secret: &str,
) -> NetResult<([u8; NONCE_LEN], [u8; NONCE_LEN])> {
    let (ty, len) = read_frame_header(stream)?;
    if ty != MsgType::Hello {
        return Err(NetError::Protocol(format!("expected HELLO, got {:?}", ty)));
    }
    let payload = read_control_payload(stream, ty, len)?;
    let hello = protocol::decode_hello(&payload)?;

    if hello.version != protocol::PROTOCOL_VERSION {
        let _ = stream.write_all(&protocol::encode_hello_fail(protocol::REASON_VERSION_MISMATCH));
        return Err(NetError::Protocol(format!(
            "protocol version {} (want {})",
            hello.version,
            protocol::PROTOCOL_VERSION
        )));
    }
    if !secret.is_empty() {
        let ok: bool = secret.as_bytes().ct_eq(&hello.secret).into();
        if !ok {
            let _ = stream.write_all(&protocol::encode_hello_fail(protocol::REASON_BAD_SECRET));
            return Err(NetError::AuthFailed(protocol::REASON_BAD_SECRET));
        }
    }

    let receiver_nonce = generate_nonce();
    stream.write_all(&protocol::encode_hello_ok(&receiver_nonce))?;
    Ok((hello.nonce, receiver_nonce))
}

pub struct Receiver {
    listener: TcpListener,
    cfg: RecvConfig,
}

impl Receiver {
    pub fn bind(cfg: RecvConfig) -> NetResult<Self> {
        fs::create_dir_all(&cfg.dst)?;
        let listener = bind_listener(cfg.port)?;
        Ok(Self { listener, cfg })
    }

    /// The actually-bound port; useful when the config asked for 0.
    pub fn local_port(&self) -> NetResult<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept one connection and run the transfer to completion.
    pub fn serve(self, stats: &CopyStats) -> NetResult<()> {
        let Receiver { listener, cfg } = self;
        tracing::info!("listening on port {}", listener.local_addr()?.port());
        let (mut stream, peer) = listener.accept()?;
        drop(listener);
        tracing::info!("connection from {}", peer);

        let (sender_nonce, receiver_nonce) = server_handshake(&mut stream, &cfg.secret)?;
        if cfg.tls {
            let keys =
                derive_session_keys(cfg.secret.as_bytes(), &sender_nonce, &receiver_nonce)?;
            ktls::arm_receiver(stream.as_raw_fd(), &keys)?;
        }

        let root = cfg.dst.canonicalize()?;
        let chunk = cfg.chunk_size.unwrap_or(common::config::DEFAULT_CHUNK_SIZE);
        let mut buffer = vec![0u8; chunk];
        let mut received = 0u64;

        loop {
            let (ty, len) = read_frame_header(&mut stream)?;
            match ty {
                MsgType::AllDone => break,
                MsgType::FileHdr => {
                    let payload = read_control_payload(&mut stream, ty, len)?;
                    let hdr = protocol::decode_file_hdr(&payload)?;
                    receive_file(&mut stream, &root, &hdr, &mut buffer, stats)?;
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
}

/// Resolve the wire path under the destination root and refuse anything
/// that escapes it once symlinks are resolved. The nearest existing
/// ancestor is proven to resolve under the root before any directory is
/// created, so a pre-existing symlink inside the tree cannot be used to
/// grow directories outside it.
pub(crate) fn contained_path(root: &Path, wire_path: &str, stats: &CopyStats) -> NetResult<PathBuf> {
    protocol::validate_path(wire_path)?;
    let full = root.join(wire_path);
    let parent = full
        .parent()
        .ok_or_else(|| NetError::Protocol(format!("no parent for {}", wire_path)))?;

    let mut existing = parent;
    while !existing.exists() {
        existing = existing
            .parent()
            .ok_or_else(|| NetError::Protocol(format!("no parent for {}", wire_path)))?;
    }
    let canonical_existing = existing.canonicalize()?;
    if !canonical_existing.starts_with(root) {
        return Err(NetError::Protocol(format!(
            "path escapes destination root: {}",
            wire_path
        )));
    }

    if parent != existing {
        fs::create_dir_all(parent)?;
        stats.dir_created();
        // The freshly created chain must resolve under the root as well.
        let canonical_parent = parent.canonicalize()?;
        if !canonical_parent.starts_with(root) {
            return Err(NetError::Protocol(format!(
                "path escapes destination root: {}",
                wire_path
            )));
        }
    }
    Ok(full)
}

fn receive_file(
    stream: &mut TcpStream,
    root: &Path,
    hdr: &FileHdr,
    buffer: &mut [u8],
    stats: &CopyStats,
) -> NetResult<()> {
    stats.add_files_total(1);
    stats.add_bytes_total(hdr.size);
    let full = contained_path(root, &hdr.path, stats)?;

    let mode = hdr.mode & 0o777;
    // O_NOFOLLOW: a pre-existing symlink at the final component must not
    // redirect the write outside the root either.
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&full)?;

    // Exactly the advertised byte count follows the header; the next
    // frame header begins right after it.
    let mut remaining = hdr.size;
    while remaining > 0 {
        let want = (buffer.len() as u64).min(remaining) as usize;
        stream.read_exact(&mut buffer[..want])?;
        file.write_all(&buffer[..want])?;
        remaining -= want as u64;
        stats.add_bytes_copied(want as u64);
    }
    drop(file);

    if let Err(e) = fs::set_permissions(&full, fs::Permissions::from_mode(mode)) {
        tracing::debug!("chmod {}: {}", full.display(), e);
    }
    stats.file_completed();
    Ok(())
}

pub fn run_receiver(cfg: RecvConfig, stats: &CopyStats) -> NetResult<()> {
    Receiver::bind(cfg)?.serve(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_path_accepts_nested() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let stats = CopyStats::new();
        let full = contained_path(&root, "a/b/c.txt", &stats).unwrap();
        assert!(full.starts_with(&root));
        assert!(root.join("a/b").is_dir());
        assert!(stats.snapshot().dirs_created >= 1);
    }

    #[test]
    fn contained_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let stats = CopyStats::new();
        for path in ["../evil", "/abs", "a/../../evil"] {
            assert!(contained_path(&root, path, &stats).is_err(), "{}", path);
        }
    }

    #[test]
    fn contained_path_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root_dir = dir.path().join("root");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&root_dir).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root_dir.join("link")).unwrap();
        let root = root_dir.canonicalize().unwrap();
        let stats = CopyStats::new();
        assert!(contained_path(&root, "link/evil.txt", &stats).is_err());
    }

    #[test]
    fn symlink_escape_creates_no_directories_outside_root() {
        // The escaping ancestor is rejected before anything is created:
        // the wire path names a directory that does not exist yet and
        // would only come into being through the symlink.
        let dir = tempfile::tempdir().unwrap();
        let root_dir = dir.path().join("root");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&root_dir).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root_dir.join("link")).unwrap();
        let root = root_dir.canonicalize().unwrap();
        let stats = CopyStats::new();

        assert!(contained_path(&root, "link/sub/evil.txt", &stats).is_err());
        assert!(!outside.join("sub").exists());
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
        assert_eq!(stats.snapshot().dirs_created, 0);
    }
}
