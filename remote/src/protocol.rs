//! Wire protocol for network transfers.
//!
//! Every frame is a 5-byte header (type tag + little-endian payload
//! length) followed by the payload. All multi-byte integers are
//! little-endian. File bodies are not framed: after FILE_HDR the sender
//! writes exactly `size` raw bytes, then the next frame header follows.
//! FILE_DATA and FILE_END exist in the frame set for implementations that
//! chunk bodies explicitly; this codec encodes and decodes them, the
//! engines in this crate do not emit them.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{NetError, NetResult};

pub const HEADER_LEN: usize = 5;

/// Version 1 was plaintext-only; version 2 added the nonce exchange that
/// feeds kernel-TLS key derivation.
pub const PROTOCOL_VERSION: u8 = 2;

pub const NONCE_LEN: usize = 16;
pub const MAX_SECRET_LEN: usize = 64;
pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_ERROR_MSG_LEN: usize = 256;

/// Ceiling for any control payload (handshake and metadata frames). File
/// bodies bypass framing entirely, so nothing legitimate comes close.
pub const MAX_CONTROL_PAYLOAD: usize = 64 * 1024;

pub const REASON_BAD_SECRET: u8 = 1;
pub const REASON_VERSION_MISMATCH: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    HelloOk = 0x02,
    HelloFail = 0x03,
    FileHdr = 0x10,
    FileData = 0x11,
    FileEnd = 0x12,
    AllDone = 0x20,
    Error = 0xFF,
}

impl TryFrom<u8> for MsgType {
    type Error = NetError;

    fn try_from(value: u8) -> NetResult<Self> {
        Ok(match value {
            0x01 => MsgType::Hello,
            0x02 => MsgType::HelloOk,
            0x03 => MsgType::HelloFail,
            0x10 => MsgType::FileHdr,
            0x11 => MsgType::FileData,
            0x12 => MsgType::FileEnd,
            0x20 => MsgType::AllDone,
            0xFF => MsgType::Error,
            other => {
                return Err(NetError::Protocol(format!(
                    "unknown message type 0x{:02x}",
                    other
                )))
            }
        })
    }
}

pub fn encode_header(ty: MsgType, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = ty as u8;
    header[1..5].copy_from_slice(&payload_len.to_le_bytes());
    header
}

pub fn decode_header(header: &[u8; HEADER_LEN]) -> NetResult<(MsgType, u32)> {
    let ty = MsgType::try_from(header[0])?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    Ok((ty, len))
}

/// Reject a control payload length before allocating for it.
pub fn check_control_len(ty: MsgType, len: u32) -> NetResult<usize> {
    let len = len as usize;
    if len > MAX_CONTROL_PAYLOAD {
        return Err(NetError::Protocol(format!(
            "{:?} payload of {} bytes exceeds the {} byte ceiling",
            ty, len, MAX_CONTROL_PAYLOAD
        )));
    }
    Ok(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub secret: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// HELLO: version:u8, secret_len:u8, secret, nonce[16].
pub fn encode_hello(secret: &[u8], nonce: &[u8; NONCE_LEN]) -> NetResult<BytesMut> {
    if secret.len() > MAX_SECRET_LEN {
        return Err(NetError::Protocol(format!(
            "secret of {} bytes exceeds the {} byte limit",
            secret.len(),
            MAX_SECRET_LEN
        )));
    }
    let payload_len = 2 + secret.len() + NONCE_LEN;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload_len);
    frame.put_slice(&encode_header(MsgType::Hello, payload_len as u32));
    frame.put_u8(PROTOCOL_VERSION);
    frame.put_u8(secret.len() as u8);
    frame.put_slice(secret);
    frame.put_slice(nonce);
    Ok(frame)
}

pub fn decode_hello(mut payload: &[u8]) -> NetResult<Hello> {
    if payload.len() < 2 {
        return Err(NetError::Protocol("truncated HELLO".into()));
    }
    let version = payload.get_u8();
    let secret_len = payload.get_u8() as usize;
    if secret_len > MAX_SECRET_LEN {
        return Err(NetError::Protocol(format!(
            "HELLO secret length {} exceeds the {} byte limit",
            secret_len, MAX_SECRET_LEN
        )));
    }
    if payload.len() < secret_len + NONCE_LEN {
        return Err(NetError::Protocol("truncated HELLO".into()));
    }
    let secret = payload[..secret_len].to_vec();
    payload.advance(secret_len);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);
    Ok(Hello {
        version,
        secret,
        nonce,
    })
}

/// HELLO_OK: nonce[16].
pub fn encode_hello_ok(nonce: &[u8; NONCE_LEN]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + NONCE_LEN);
    frame.put_slice(&encode_header(MsgType::HelloOk, NONCE_LEN as u32));
    frame.put_slice(nonce);
    frame
}

pub fn decode_hello_ok(payload: &[u8]) -> NetResult<[u8; NONCE_LEN]> {
    if payload.len() < NONCE_LEN {
        return Err(NetError::Protocol("truncated HELLO_OK".into()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);
    Ok(nonce)
}

/// HELLO_FAIL: reason:u8.
pub fn encode_hello_fail(reason: u8) -> BytesMut {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + 1);
    frame.put_slice(&encode_header(MsgType::HelloFail, 1));
    frame.put_u8(reason);
    frame
}

pub fn decode_hello_fail(payload: &[u8]) -> NetResult<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| NetError::Protocol("truncated HELLO_FAIL".into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHdr {
    pub size: u64,
    pub mode: u32,
    pub path: String,
}

/// FILE_HDR: size:u64, mode:u32, path_len:u16, path.
pub fn encode_file_hdr(size: u64, mode: u32, path: &str) -> NetResult<BytesMut> {
    validate_path(path)?;
    let payload_len = 8 + 4 + 2 + path.len();
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload_len);
    frame.put_slice(&encode_header(MsgType::FileHdr, payload_len as u32));
    frame.put_u64_le(size);
    frame.put_u32_le(mode);
    frame.put_u16_le(path.len() as u16);
    frame.put_slice(path.as_bytes());
    Ok(frame)
}

pub fn decode_file_hdr(mut payload: &[u8]) -> NetResult<FileHdr> {
    if payload.len() < 14 {
        return Err(NetError::Protocol("truncated FILE_HDR".into()));
    }
    let size = payload.get_u64_le();
    let mode = payload.get_u32_le();
    let path_len = payload.get_u16_le() as usize;
    if payload.len() < path_len {
        return Err(NetError::Protocol("truncated FILE_HDR path".into()));
    }
    let path = std::str::from_utf8(&payload[..path_len])
        .map_err(|_| NetError::Protocol("FILE_HDR path is not UTF-8".into()))?
        .to_string();
    validate_path(&path)?;
    Ok(FileHdr { size, mode, path })
}

/// FILE_DATA header; the payload itself follows on the wire.
pub fn encode_file_data_header(data_len: u32) -> [u8; HEADER_LEN] {
    encode_header(MsgType::FileData, data_len)
}

pub fn encode_file_end() -> [u8; HEADER_LEN] {
    encode_header(MsgType::FileEnd, 0)
}

pub fn encode_all_done() -> [u8; HEADER_LEN] {
    encode_header(MsgType::AllDone, 0)
}

/// ERROR: code:u8, msg_len:u16, msg.
pub fn encode_error(code: u8, msg: &str) -> BytesMut {
    let msg = &msg.as_bytes()[..msg.len().min(MAX_ERROR_MSG_LEN)];
    let payload_len = 1 + 2 + msg.len();
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload_len);
    frame.put_slice(&encode_header(MsgType::Error, payload_len as u32));
    frame.put_u8(code);
    frame.put_u16_le(msg.len() as u16);
    frame.put_slice(msg);
    frame
}

pub fn decode_error(mut payload: &[u8]) -> NetResult<(u8, String)> {
    if payload.len() < 3 {
        return Err(NetError::Protocol("truncated ERROR".into()));
    }
    let code = payload.get_u8();
    let msg_len = payload.get_u16_le() as usize;
    if msg_len > MAX_ERROR_MSG_LEN || payload.len() < msg_len {
        return Err(NetError::Protocol("truncated ERROR message".into()));
    }
    let msg = String::from_utf8_lossy(&payload[..msg_len]).into_owned();
    Ok((code, msg))
}

/// A wire path must stay inside the destination root once joined:
/// relative, no `..` segments, no NUL, bounded length. UTF-8 is enforced
/// where the bytes are decoded.
pub fn validate_path(path: &str) -> NetResult<()> {
    if path.is_empty() {
        return Err(NetError::Protocol("empty path".into()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(NetError::Protocol(format!(
            "path of {} bytes exceeds the {} byte limit",
            path.len(),
            MAX_PATH_LEN
        )));
    }
    if path.starts_with('/') {
        return Err(NetError::Protocol(format!("absolute path rejected: {}", path)));
    }
    if path.bytes().any(|b| b == 0) {
        return Err(NetError::Protocol("path contains NUL".into()));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(NetError::Protocol(format!(
            "path traversal rejected: {}",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for (ty, len) in [
            (MsgType::Hello, 0u32),
            (MsgType::FileHdr, 19),
            (MsgType::FileData, u32::MAX),
            (MsgType::AllDone, 0),
            (MsgType::Error, 300),
        ] {
            let bytes = encode_header(ty, len);
            let (got_ty, got_len) = decode_header(&bytes).unwrap();
            assert_eq!(got_ty, ty);
            assert_eq!(got_len, len);
        }
    }

    #[test]
    fn header_length_is_little_endian() {
        let bytes = encode_header(MsgType::FileHdr, 0x0102_0304);
        assert_eq!(bytes, [0x10, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(decode_header(&[0x42, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn hello_round_trip() {
        let nonce = [7u8; NONCE_LEN];
        let frame = encode_hello(b"test123", &nonce).unwrap();
        let (ty, len) = decode_header(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(ty, MsgType::Hello);
        assert_eq!(len as usize, frame.len() - HEADER_LEN);
        let hello = decode_hello(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert_eq!(hello.secret, b"test123");
        assert_eq!(hello.nonce, nonce);
    }

    #[test]
    fn hello_empty_secret() {
        let nonce = [0u8; NONCE_LEN];
        let frame = encode_hello(b"", &nonce).unwrap();
        let hello = decode_hello(&frame[HEADER_LEN..]).unwrap();
        assert!(hello.secret.is_empty());
    }

    #[test]
    fn hello_oversize_secret_rejected() {
        let nonce = [0u8; NONCE_LEN];
        assert!(encode_hello(&[0u8; MAX_SECRET_LEN + 1], &nonce).is_err());
    }

    #[test]
    fn hello_truncated_rejected() {
        let nonce = [1u8; NONCE_LEN];
        let frame = encode_hello(b"secret", &nonce).unwrap();
        let payload = &frame[HEADER_LEN..];
        assert!(decode_hello(&payload[..payload.len() - 1]).is_err());
        assert!(decode_hello(&[]).is_err());
    }

    #[test]
    fn hello_ok_round_trip() {
        let nonce = [0xabu8; NONCE_LEN];
        let frame = encode_hello_ok(&nonce);
        assert_eq!(decode_hello_ok(&frame[HEADER_LEN..]).unwrap(), nonce);
    }

    #[test]
    fn hello_fail_round_trip() {
        let frame = encode_hello_fail(REASON_BAD_SECRET);
        assert_eq!(
            decode_hello_fail(&frame[HEADER_LEN..]).unwrap(),
            REASON_BAD_SECRET
        );
    }

    #[test]
    fn file_hdr_round_trip() {
        let frame = encode_file_hdr(123_456_789, 0o644, "dir/sub dir/ünïcode-file_01.txt").unwrap();
        let hdr = decode_file_hdr(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(hdr.size, 123_456_789);
        assert_eq!(hdr.mode, 0o644);
        assert_eq!(hdr.path, "dir/sub dir/ünïcode-file_01.txt");
    }

    #[test]
    fn file_hdr_rejects_bad_paths_on_decode() {
        for path in ["/etc/passwd", "../evil", "a/../../b", "a/.."] {
            let payload_len = 8 + 4 + 2 + path.len();
            let mut frame = BytesMut::new();
            frame.put_slice(&encode_header(MsgType::FileHdr, payload_len as u32));
            frame.put_u64_le(1);
            frame.put_u32_le(0o644);
            frame.put_u16_le(path.len() as u16);
            frame.put_slice(path.as_bytes());
            assert!(decode_file_hdr(&frame[HEADER_LEN..]).is_err(), "{}", path);
        }
    }

    #[test]
    fn error_round_trip() {
        let frame = encode_error(3, "disk full");
        let (code, msg) = decode_error(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(code, 3);
        assert_eq!(msg, "disk full");
    }

    #[test]
    fn error_message_truncated_to_limit() {
        let long = "x".repeat(MAX_ERROR_MSG_LEN * 2);
        let frame = encode_error(1, &long);
        let (_, msg) = decode_error(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(msg.len(), MAX_ERROR_MSG_LEN);
    }

    #[test]
    fn empty_frames() {
        let (ty, len) = decode_header(&encode_all_done()).unwrap();
        assert_eq!((ty, len), (MsgType::AllDone, 0));
        let (ty, len) = decode_header(&encode_file_end()).unwrap();
        assert_eq!((ty, len), (MsgType::FileEnd, 0));
        let (ty, len) = decode_header(&encode_file_data_header(512)).unwrap();
        assert_eq!((ty, len), (MsgType::FileData, 512));
    }

    #[test]
    fn path_validation_table() {
        assert!(validate_path("ok/file.txt").is_ok());
        assert!(validate_path("with space/and-dash/und_er.txt").is_ok());
        assert!(validate_path("..hidden/file").is_ok());
        assert!(validate_path("dots..in..name").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/absolute").is_err());
        assert!(validate_path("..").is_err());
        assert!(validate_path("../up").is_err());
        assert!(validate_path("deep/../../out").is_err());
        assert!(validate_path(&"p".repeat(MAX_PATH_LEN + 1)).is_err());
        assert!(validate_path("nul\0byte").is_err());
    }

    #[test]
    fn control_len_ceiling() {
        assert!(check_control_len(MsgType::Hello, 100).is_ok());
        assert!(check_control_len(MsgType::Hello, MAX_CONTROL_PAYLOAD as u32).is_ok());
        assert!(check_control_len(MsgType::Hello, MAX_CONTROL_PAYLOAD as u32 + 1).is_err());
    }
}
