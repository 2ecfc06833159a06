//! Voice transport for the chat platform: the control-channel handshake
//! state machine and the UDP audio pipeline.
//!
//! A [`VoiceSession`] drives the handshake (identify, session
//! description, UDP address discovery, protocol selection, secret key)
//! and keeps the connection alive with heartbeats. The resulting
//! [`VoiceUdpChannel`] frames, encrypts and transmits audio packets; the
//! calling audio source owns the 20 ms frame cadence.

mod crypto;
mod error;
pub mod payload;
mod session;
mod udp;

pub use crypto::{AeadCipher, EncryptionMode, XChaCha20Poly1305Engine, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use error::{EncryptionError, VoiceConnectError};
pub use session::{speaking, ConnectionInfo, HandshakeState, VoiceSession, VOICE_GATEWAY_VERSION};
pub use udp::{VoiceUdpChannel, DISCOVERY_LEN, SAMPLES_PER_FRAME, SILENCE_FRAME};
