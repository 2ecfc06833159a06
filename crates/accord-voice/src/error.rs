use thiserror::Error;

/// Any failure that aborts a voice connection attempt. Handshake errors
/// are fatal to that attempt and are never retried internally.
#[derive(Debug, Error)]
pub enum VoiceConnectError {
    #[error("control channel error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode control payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("no encryption mode shared with the server")]
    NoSupportedMode,
    #[error("invalid discovery reply")]
    Discovery,
    #[error("control channel closed during handshake")]
    UnexpectedClose,
    #[error("voice session is closed")]
    Closed,
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

/// AEAD failures are always surfaced: silently dropping a forged inbound
/// packet would be acceptable, silently sending plaintext is not.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("expected a {expected} byte key, got {got}")]
    KeyLength { expected: usize, got: usize },
    #[error("expected a {expected} byte nonce, got {got}")]
    NonceLength { expected: usize, got: usize },
    #[error("cipher failure")]
    Cipher,
    #[error("authentication failed")]
    Authentication,
    #[error("no secret key has been negotiated yet")]
    NoSecretKey,
}
