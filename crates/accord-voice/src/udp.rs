use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;

use crate::crypto::{AeadCipher, EncryptionMode, XChaCha20Poly1305Engine, KEY_LEN, NONCE_LEN};
use crate::error::{EncryptionError, VoiceConnectError};

/// Total size of the discovery probe and its reply.
pub const DISCOVERY_LEN: usize = 74;
const DISCOVERY_REQUEST: u16 = 0x0001;
const DISCOVERY_RESPONSE: u16 = 0x0002;
/// Payload length advertised in the probe (everything after type+length).
const DISCOVERY_PAYLOAD_LEN: u16 = 70;

const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION_FLAGS: u8 = 0x80;
const RTP_PAYLOAD_TYPE: u8 = 0x78;
/// How many nonce bytes travel on the wire (the rest are zero padding).
const NONCE_SUFFIX_LEN: usize = 4;

/// PCM samples per 20 ms frame at 48 kHz; the conventional timestamp
/// increment per packet.
pub const SAMPLES_PER_FRAME: u32 = 960;
/// Opus silence frame, sent by producers to signal end-of-speech.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

struct Secret {
    mode: EncryptionMode,
    key: [u8; KEY_LEN],
}

/// The UDP leg of a voice connection: address discovery, then framing,
/// encryption and transmission of audio packets.
///
/// The channel does no pacing or buffering; the audio producer owns the
/// 20 ms cadence and calls [`send_audio`](Self::send_audio) per frame.
pub struct VoiceUdpChannel {
    socket: UdpSocket,
    ssrc: u32,
    cipher: Box<dyn AeadCipher>,
    secret: RwLock<Option<Secret>>,
    nonce_counter: AtomicU32,
}

impl std::fmt::Debug for VoiceUdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceUdpChannel")
            .field("socket", &self.socket)
            .field("ssrc", &self.ssrc)
            .finish_non_exhaustive()
    }
}

impl VoiceUdpChannel {
    /// Binds a fresh local socket and stores the target address and SSRC.
    /// Nothing is sent yet.
    pub async fn connect(ip: &str, port: u16, ssrc: u32) -> Result<Self, VoiceConnectError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((ip, port)).await?;
        Ok(VoiceUdpChannel {
            socket,
            ssrc,
            cipher: Box::new(XChaCha20Poly1305Engine),
            secret: RwLock::new(None),
            nonce_counter: AtomicU32::new(0),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Runs the hole-punch discovery round trip and returns our public
    /// address as seen by the voice server.
    pub async fn discover(&self) -> Result<(String, u16), VoiceConnectError> {
        self.send_discovery().await?;
        self.receive_discovery_reply().await
    }

    pub async fn send_discovery(&self) -> Result<(), VoiceConnectError> {
        let probe = discovery_request(self.ssrc)?;
        self.socket.send(&probe).await?;
        Ok(())
    }

    pub async fn receive_discovery_reply(&self) -> Result<(String, u16), VoiceConnectError> {
        let mut buf = [0u8; DISCOVERY_LEN];
        let len = self.socket.recv(&mut buf).await?;
        parse_discovery_reply(&buf[..len])
    }

    /// Installs the negotiated mode and secret key and restarts the nonce
    /// counter. Must be called before the first [`send_audio`](Self::send_audio).
    pub fn set_secret(&self, mode: EncryptionMode, key: &[u8]) -> Result<(), EncryptionError> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::KeyLength {
                expected: KEY_LEN,
                got: key.len(),
            });
        }
        let mut fixed = [0u8; KEY_LEN];
        fixed.copy_from_slice(key);
        *self.secret.write().unwrap() = Some(Secret { mode, key: fixed });
        self.nonce_counter.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Frames, encrypts and transmits one audio frame.
    ///
    /// Fails with [`EncryptionError::NoSecretKey`] if no key has been
    /// negotiated yet; a frame is never sent unencrypted.
    pub async fn send_audio(
        &self,
        frame: &[u8],
        sequence: u16,
        timestamp: u32,
    ) -> Result<(), VoiceConnectError> {
        let packet = self.seal(frame, sequence, timestamp)?;
        self.socket.send(&packet).await?;
        Ok(())
    }

    /// Builds the on-wire packet: `header || ciphertext+tag || nonce[0..4]`,
    /// with the 12-byte header doubling as the AEAD associated data.
    fn seal(&self, frame: &[u8], sequence: u16, timestamp: u32) -> Result<Bytes, EncryptionError> {
        let secret = self.secret.read().unwrap();
        let secret = secret.as_ref().ok_or(EncryptionError::NoSecretKey)?;

        let header = rtp_header(sequence, timestamp, self.ssrc);
        // fetch_add wraps from 0xFFFFFFFF back to 0
        let counter = self.nonce_counter.fetch_add(1, Ordering::SeqCst);
        let nonce = nonce_from_counter(counter);

        let ciphertext = match secret.mode {
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => {
                self.cipher.encrypt(&secret.key, &nonce, &header, frame)?
            }
        };

        let mut packet =
            BytesMut::with_capacity(RTP_HEADER_LEN + ciphertext.len() + NONCE_SUFFIX_LEN);
        packet.put_slice(&header);
        packet.put_slice(&ciphertext);
        packet.put_slice(&nonce[..NONCE_SUFFIX_LEN]);
        Ok(packet.freeze())
    }
}

fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = RTP_VERSION_FLAGS;
    header[1] = RTP_PAYLOAD_TYPE;
    BigEndian::write_u16(&mut header[2..4], sequence);
    BigEndian::write_u32(&mut header[4..8], timestamp);
    BigEndian::write_u32(&mut header[8..12], ssrc);
    header
}

/// The 24-byte nonce for the counter-based mode: the counter big-endian
/// in the first four bytes, zero-padded to the right.
fn nonce_from_counter(counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    BigEndian::write_u32(&mut nonce[..4], counter);
    nonce
}

fn discovery_request(ssrc: u32) -> Result<[u8; DISCOVERY_LEN], VoiceConnectError> {
    let mut wd = Cursor::new([0u8; DISCOVERY_LEN]);
    wd.write_u16::<BigEndian>(DISCOVERY_REQUEST)?;
    wd.write_u16::<BigEndian>(DISCOVERY_PAYLOAD_LEN)?;
    wd.write_u32::<BigEndian>(ssrc)?;
    // remaining 66 bytes stay zero
    Ok(wd.into_inner())
}

fn parse_discovery_reply(buf: &[u8]) -> Result<(String, u16), VoiceConnectError> {
    if buf.len() != DISCOVERY_LEN || BigEndian::read_u16(&buf[..2]) != DISCOVERY_RESPONSE {
        return Err(VoiceConnectError::Discovery);
    }

    let ip_bytes = &buf[8..DISCOVERY_LEN - 2];
    let end = ip_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(ip_bytes.len());
    let ip = std::str::from_utf8(&ip_bytes[..end])
        .map_err(|_| VoiceConnectError::Discovery)?
        .to_string();
    let port = BigEndian::read_u16(&buf[DISCOVERY_LEN - 2..]);

    Ok((ip, port))
}
