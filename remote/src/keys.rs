//! PSK key derivation for the kernel record layer.
//!
//! Both peers feed the shared secret and the two handshake nonces through
//! HKDF-SHA256 and split the output into two direction blocks, so the
//! sender's transmit keys are byte-identical to the receiver's receive
//! keys without any key material crossing the wire.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{NetError, NetResult};
use crate::protocol::NONCE_LEN;

pub const KEY_LEN: usize = 16;
pub const SALT_LEN: usize = 4;
pub const REC_SEQ_LEN: usize = 8;
pub const DIRECTION_LEN: usize = KEY_LEN + SALT_LEN + REC_SEQ_LEN;

/// Domain-separation label; fixed for wire compatibility.
const HKDF_INFO: &[u8] = b"uring-sync-ktls-v1";

/// Key material for one traffic direction, laid out as the kernel record
/// layer wants it: AES-128 key, 4-byte implicit IV, initial record
/// sequence number.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    pub key: [u8; KEY_LEN],
    pub salt: [u8; SALT_LEN],
    pub rec_seq: [u8; REC_SEQ_LEN],
}

/// Both directions of a session. `tx` is sender-to-receiver; the receiver
/// arms the same blocks swapped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub tx: DirectionKeys,
    pub rx: DirectionKeys,
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn derive_session_keys(
    secret: &[u8],
    sender_nonce: &[u8; NONCE_LEN],
    receiver_nonce: &[u8; NONCE_LEN],
) -> NetResult<SessionKeys> {
    let mut salt = [0u8; 2 * NONCE_LEN];
    salt[..NONCE_LEN].copy_from_slice(sender_nonce);
    salt[NONCE_LEN..].copy_from_slice(receiver_nonce);

    let hk = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut okm = [0u8; 2 * DIRECTION_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| NetError::CryptoSetup("HKDF expand failed".into()))?;

    let keys = SessionKeys {
        tx: split_direction(&okm[..DIRECTION_LEN]),
        rx: split_direction(&okm[DIRECTION_LEN..]),
    };
    okm.zeroize();
    Ok(keys)
}

fn split_direction(material: &[u8]) -> DirectionKeys {
    let mut keys = DirectionKeys {
        key: [0u8; KEY_LEN],
        salt: [0u8; SALT_LEN],
        rec_seq: [0u8; REC_SEQ_LEN],
    };
    keys.key.copy_from_slice(&material[..KEY_LEN]);
    keys.salt
        .copy_from_slice(&material[KEY_LEN..KEY_LEN + SALT_LEN]);
    keys.rec_seq
        .copy_from_slice(&material[KEY_LEN + SALT_LEN..DIRECTION_LEN]);
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_keys() {
        let sender_nonce = generate_nonce();
        let receiver_nonce = generate_nonce();
        let a = derive_session_keys(b"shared", &sender_nonce, &receiver_nonce).unwrap();
        let b = derive_session_keys(b"shared", &sender_nonce, &receiver_nonce).unwrap();
        assert_eq!(a.tx.key, b.tx.key);
        assert_eq!(a.tx.salt, b.tx.salt);
        assert_eq!(a.tx.rec_seq, b.tx.rec_seq);
        assert_eq!(a.rx.key, b.rx.key);
    }

    #[test]
    fn directions_are_independent() {
        let keys = derive_session_keys(b"s", &[1u8; NONCE_LEN], &[2u8; NONCE_LEN]).unwrap();
        assert_ne!(keys.tx.key, keys.rx.key);
    }

    #[test]
    fn different_inputs_give_different_keys() {
        let n1 = [1u8; NONCE_LEN];
        let n2 = [2u8; NONCE_LEN];
        let base = derive_session_keys(b"secret", &n1, &n2).unwrap();
        let other_secret = derive_session_keys(b"secret2", &n1, &n2).unwrap();
        assert_ne!(base.tx.key, other_secret.tx.key);
        let swapped = derive_session_keys(b"secret", &n2, &n1).unwrap();
        assert_ne!(base.tx.key, swapped.tx.key);
    }

    #[test]
    fn nonces_are_fresh() {
        // Sixteen random bytes colliding means the RNG is broken.
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn empty_secret_still_derives() {
        let keys = derive_session_keys(b"", &[0u8; NONCE_LEN], &[0u8; NONCE_LEN]).unwrap();
        assert_ne!(keys.tx.key, [0u8; KEY_LEN]);
    }
}
