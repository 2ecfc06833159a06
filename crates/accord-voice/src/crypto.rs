use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::error::EncryptionError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Abstract encrypt/decrypt contract the rest of the voice subsystem
/// depends on, so nothing outside this module knows which cryptographic
/// backend is in use.
///
/// Both operations are stateless and safe to call from multiple threads.
/// Neither produces partial output on failure.
pub trait AeadCipher: Send + Sync {
    /// Encrypts `plaintext`, authenticating `aad` alongside it. The
    /// returned buffer is the ciphertext with the tag appended.
    fn encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;

    /// Verifies and decrypts `ciphertext` (with trailing tag). Fails with
    /// [`EncryptionError::Authentication`] if the tag does not verify.
    fn decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XChaCha20Poly1305Engine;

fn check_sizes(key: &[u8], nonce: &[u8]) -> Result<(), EncryptionError> {
    if key.len() != KEY_LEN {
        return Err(EncryptionError::KeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    if nonce.len() != NONCE_LEN {
        return Err(EncryptionError::NonceLength {
            expected: NONCE_LEN,
            got: nonce.len(),
        });
    }
    Ok(())
}

impl AeadCipher for XChaCha20Poly1305Engine {
    fn encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        check_sizes(key, nonce)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .encrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::Cipher)
    }

    fn decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        check_sizes(key, nonce)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::Authentication)
    }
}

/// Encryption modes this client can speak, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// XChaCha20-Poly1305 with a 32-bit counter nonce; only the first
    /// four nonce bytes travel on the wire, appended to each packet.
    AeadXChaCha20Poly1305RtpSize,
}

impl EncryptionMode {
    pub const PREFERRED: &'static [EncryptionMode] =
        &[EncryptionMode::AeadXChaCha20Poly1305RtpSize];

    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => "aead_xchacha20_poly1305_rtpsize",
        }
    }

    pub fn from_name(name: &str) -> Option<EncryptionMode> {
        Self::PREFERRED
            .iter()
            .copied()
            .find(|mode| mode.as_str() == name)
    }

    /// Picks the first client-preferred mode that the server also
    /// supports. Unknown server mode names are skipped.
    pub fn negotiate(server_modes: &[String]) -> Option<EncryptionMode> {
        Self::PREFERRED
            .iter()
            .copied()
            .find(|mode| server_modes.iter().any(|name| name == mode.as_str()))
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
