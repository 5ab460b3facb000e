//! Packet sealing with ChaCha20-Poly1305: see [`encrypt_packet`] and
//! [`decrypt_packet`].
//!
//! An encrypted datagram looks like:
//!
//! ```text
//! [ prefix : 1 byte ][ sequence : 1..8 bytes LE ][ ciphertext || tag ]
//! ```
//!
//! The prefix's top bit flags the datagram as encrypted; its low bits hold
//! the byte length of the compressed sequence number. The sequence doubles as
//! the AEAD nonce (extended to 12 bytes with leading zeros), so it is never
//! reused under one key, and tampering with it breaks authentication.

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key as ChaChaKey, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of an encryption key.
pub const KEY_BYTES: usize = 32;

/// Byte length of the AEAD authentication tag.
pub const MAC_BYTES: usize = 16;

/// Maximum byte length of a compressed sequence number.
pub const MAX_SEQUENCE_BYTES: usize = 8;

/// Worst-case overhead added to a packet by encryption: prefix byte,
/// sequence, tag.
pub const MAX_OVERHEAD_BYTES: usize = 1 + MAX_SEQUENCE_BYTES + MAC_BYTES;

const ENCRYPTED_FLAG: u8 = 1 << 7;

/// A 256-bit symmetric key.
///
/// The bytes are zeroed when the key is dropped, so session keys do not
/// linger in freed memory after a disconnect.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_BYTES]);

impl Key {
    /// Generates a fresh random key from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps existing key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Key([REDACTED])")
    }
}

/// Error sealing or opening an AEAD payload.
///
/// Decryption failures are expected under attack or corruption; callers drop
/// the datagram and bump a counter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Datagram too short to hold a prefix, sequence, and tag.
    #[error("datagram too small")]
    TooSmall,
    /// Datagram's prefix byte does not carry the encrypted flag.
    #[error("datagram is not encrypted")]
    NotEncrypted,
    /// Prefix byte encodes a sequence length outside `1..=8`.
    #[error("invalid sequence length `{0}`")]
    InvalidSequenceLength(u8),
    /// Authentication failed; the payload was tampered with, or the key or
    /// nonce is wrong.
    #[error("authentication failed")]
    Failed,
}

fn cipher(key: &Key) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(ChaChaKey::from_slice(key.as_bytes()))
}

fn nonce_bytes(sequence: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&sequence.to_le_bytes());
    Nonce::from(bytes)
}

/// Number of bytes needed to hold `sequence`, at least one.
fn sequence_bytes(sequence: u64) -> usize {
    let bytes = (64 - u64::leading_zeros(sequence) as usize + 7) / 8;
    bytes.max(1)
}

/// Seals `plaintext` under `key`, producing a self-describing encrypted
/// datagram carrying `sequence` in compressed form.
///
/// # Errors
///
/// Errors if the cipher rejects the input (practically impossible for
/// packet-sized payloads).
pub fn encrypt_packet(plaintext: &[u8], sequence: u64, key: &Key) -> Result<Bytes, CryptoError> {
    let seq_len = sequence_bytes(sequence);
    let mut out = Vec::with_capacity(1 + seq_len + plaintext.len() + MAC_BYTES);
    #[allow(clippy::cast_possible_truncation)]
    out.push(ENCRYPTED_FLAG | seq_len as u8);
    out.extend_from_slice(&sequence.to_le_bytes()[..seq_len]);

    let sealed = cipher(key)
        .encrypt(&nonce_bytes(sequence), plaintext)
        .map_err(|_| CryptoError::Failed)?;
    out.extend_from_slice(&sealed);
    Ok(Bytes::from(out))
}

/// Opens an encrypted datagram, returning the plaintext and the sequence it
/// carried.
///
/// # Errors
///
/// Errors if the datagram is malformed or fails authentication. Either way
/// the datagram should be silently dropped.
pub fn decrypt_packet(datagram: &[u8], key: &Key) -> Result<(Bytes, u64), CryptoError> {
    let &prefix = datagram.first().ok_or(CryptoError::TooSmall)?;
    if prefix & ENCRYPTED_FLAG == 0 {
        return Err(CryptoError::NotEncrypted);
    }
    let seq_len = usize::from(prefix & !ENCRYPTED_FLAG);
    if seq_len < 1 || seq_len > MAX_SEQUENCE_BYTES {
        return Err(CryptoError::InvalidSequenceLength(prefix & !ENCRYPTED_FLAG));
    }
    if datagram.len() <= 1 + seq_len + MAC_BYTES {
        return Err(CryptoError::TooSmall);
    }

    let mut seq_bytes = [0u8; 8];
    seq_bytes[..seq_len].copy_from_slice(&datagram[1..=seq_len]);
    let sequence = u64::from_le_bytes(seq_bytes);

    let plaintext = cipher(key)
        .decrypt(&nonce_bytes(sequence), &datagram[1 + seq_len..])
        .map_err(|_| CryptoError::Failed)?;
    Ok((Bytes::from(plaintext), sequence))
}

/// Whether a datagram's prefix byte carries the encrypted flag.
#[must_use]
pub fn is_encrypted(datagram: &[u8]) -> bool {
    datagram.first().is_some_and(|&prefix| prefix & ENCRYPTED_FLAG != 0)
}

/// Seals `plaintext` with explicit additional data and an out-of-band nonce.
/// Used for connect tokens, where the nonce travels beside the sealed bytes.
///
/// # Errors
///
/// Errors if the cipher rejects the input.
pub fn seal(
    plaintext: &[u8],
    additional: &[u8],
    nonce: u64,
    key: &Key,
) -> Result<Vec<u8>, CryptoError> {
    cipher(key)
        .encrypt(
            &nonce_bytes(nonce),
            Payload {
                msg: plaintext,
                aad: additional,
            },
        )
        .map_err(|_| CryptoError::Failed)
}

/// Opens a payload sealed by [`seal`].
///
/// # Errors
///
/// Errors if authentication fails.
pub fn open(
    sealed: &[u8],
    additional: &[u8],
    nonce: u64,
    key: &Key,
) -> Result<Vec<u8>, CryptoError> {
    cipher(key)
        .decrypt(
            &nonce_bytes(nonce),
            Payload {
                msg: sealed,
                aad: additional,
            },
        )
        .map_err(|_| CryptoError::Failed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn packet_round_trip() {
        let key = Key::generate();
        let plaintext = b"some packet payload";

        for sequence in [0u64, 1, 255, 256, 0x0123_4567_89AB_CDEF, u64::MAX] {
            let sealed = encrypt_packet(plaintext, sequence, &key).unwrap();
            let (opened, got_seq) = decrypt_packet(&sealed, &key).unwrap();
            assert_eq!(plaintext.as_slice(), &opened[..]);
            assert_eq!(sequence, got_seq);
        }
    }

    #[test]
    fn sequence_compression_is_minimal() {
        let key = Key::generate();
        let plaintext = [0u8; 4];

        let small = encrypt_packet(&plaintext, 7, &key).unwrap();
        let large = encrypt_packet(&plaintext, u64::MAX, &key).unwrap();
        assert_eq!(1 + 1 + 4 + MAC_BYTES, small.len());
        assert_eq!(1 + 8 + 4 + MAC_BYTES, large.len());
    }

    #[test]
    fn bit_flips_fail_authentication() {
        let key = Key::generate();
        let sealed = encrypt_packet(b"payload", 42, &key).unwrap();

        // flip one bit in every position after the prefix: sequence bytes
        // change the nonce, body bytes corrupt the ciphertext or tag
        for i in 1..sealed.len() {
            let mut tampered = sealed.to_vec();
            tampered[i] ^= 0x01;
            assert_matches!(decrypt_packet(&tampered, &key), Err(CryptoError::Failed));
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt_packet(b"payload", 1, &Key::generate()).unwrap();
        assert_matches!(
            decrypt_packet(&sealed, &Key::generate()),
            Err(CryptoError::Failed)
        );
    }

    #[test]
    fn malformed_prefixes_rejected() {
        let key = Key::generate();
        assert_matches!(decrypt_packet(&[], &key), Err(CryptoError::TooSmall));
        assert_matches!(
            decrypt_packet(&[0x00, 1, 2, 3], &key),
            Err(CryptoError::NotEncrypted)
        );
        assert_matches!(
            decrypt_packet(&[ENCRYPTED_FLAG | 9; 64], &key),
            Err(CryptoError::InvalidSequenceLength(9))
        );
        assert_matches!(
            decrypt_packet(&[ENCRYPTED_FLAG | 1, 0, 0], &key),
            Err(CryptoError::TooSmall)
        );
    }

    #[test]
    fn sealed_payload_binds_additional_data() {
        let key = Key::generate();
        let sealed = seal(b"token body", b"context", 9, &key).unwrap();

        assert_eq!(
            b"token body".as_slice(),
            open(&sealed, b"context", 9, &key).unwrap()
        );
        assert_matches!(
            open(&sealed, b"other context", 9, &key),
            Err(CryptoError::Failed)
        );
        assert_matches!(open(&sealed, b"context", 10, &key), Err(CryptoError::Failed));
    }
}
