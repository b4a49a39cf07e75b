//! Kernel record-layer setup.
//!
//! After the handshake both peers attach the TLS upper-layer protocol to
//! the TCP socket and install the derived AES-128-GCM keys for each
//! direction. From then on plain send/recv on the descriptor moves
//! TLS 1.2 records; no user-space TLS stack is involved.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::error::{NetError, NetResult};
use crate::keys::{DirectionKeys, SessionKeys};

fn setsockopt(fd: RawFd, level: i32, name: i32, value: *const libc::c_void, len: u32) -> io::Result<()> {
    // Safety: value points at `len` valid bytes for the duration of the
    // call.
    let ret = unsafe { libc::setsockopt(fd, level, name, value, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn attach_ulp(fd: RawFd) -> NetResult<()> {
    let name = b"tls\0";
    setsockopt(
        fd,
        libc::SOL_TCP,
        libc::TCP_ULP,
        name.as_ptr().cast(),
        name.len() as u32,
    )
    .map_err(|e| NetError::CryptoSetup(format!("TCP_ULP: {}", e)))
}

fn install_key(fd: RawFd, direction: i32, keys: &DirectionKeys) -> NetResult<()> {
    let mut info: libc::tls12_crypto_info_aes_gcm_128 = unsafe { mem::zeroed() };
    info.info.version = libc::TLS_1_2_VERSION;
    info.info.cipher_type = libc::TLS_CIPHER_AES_GCM_128;
    info.key = keys.key;
    info.salt = keys.salt;
    info.rec_seq = keys.rec_seq;
    // The 8-byte explicit IV stays zero; the kernel carries the per-record
    // nonce in the record itself, so both sides agree.
    let which = if direction == libc::TLS_TX { "TLS_TX" } else { "TLS_RX" };
    setsockopt(
        fd,
        libc::SOL_TLS,
        direction,
        (&info as *const libc::tls12_crypto_info_aes_gcm_128).cast(),
        mem::size_of::<libc::tls12_crypto_info_aes_gcm_128>() as u32,
    )
    .map_err(|e| NetError::CryptoSetup(format!("{}: {}", which, e)))
}

/// Arm the socket on the sending side: tx keys encrypt, rx keys decrypt.
pub fn arm_sender(fd: RawFd, keys: &SessionKeys) -> NetResult<()> {
    attach_ulp(fd)?;
    install_key(fd, libc::TLS_TX, &keys.tx)?;
    install_key(fd, libc::TLS_RX, &keys.rx)?;
    tracing::debug!("kernel TLS armed (sender, AES-128-GCM)");
    Ok(())
}

/// Arm the socket on the receiving side; directions swap.
pub fn arm_receiver(fd: RawFd, keys: &SessionKeys) -> NetResult<()> {
    attach_ulp(fd)?;
    install_key(fd, libc::TLS_TX, &keys.rx)?;
    install_key(fd, libc::TLS_RX, &keys.tx)?;
    tracing::debug!("kernel TLS armed (receiver, AES-128-GCM)");
    Ok(())
}

/// Whether this kernel will accept the TLS upper-layer protocol at all
/// (the tls module may not be loaded).
pub fn is_available() -> bool {
    // Safety: probe socket is closed before returning.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return false;
        }
        let name = b"tls\0";
        let ret = libc::setsockopt(
            fd,
            libc::SOL_TCP,
            libc::TCP_ULP,
            name.as_ptr().cast(),
            name.len() as u32,
        );
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        libc::close(fd);
        // Setting the ULP on an unconnected socket fails, but only
        // ENOPROTOOPT means the record layer is missing.
        ret == 0 || errno != libc::ENOPROTOOPT
    }
}
