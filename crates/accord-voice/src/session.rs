use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::crypto::EncryptionMode;
use crate::error::VoiceConnectError;
use crate::payload::{
    Identify, SelectProtocol, SelectProtocolData, SessionDescription, Speaking, VoiceMessage,
};
use crate::udp::VoiceUdpChannel;

/// Control channel protocol version, sent as a query parameter.
pub const VOICE_GATEWAY_VERSION: u8 = 8;

/// Speaking-state flags for [`VoiceSession::send_speaking`].
pub mod speaking {
    pub const NONE: u8 = 0;
    pub const MICROPHONE: u8 = 1;
    pub const SOUNDSHARE: u8 = 1 << 1;
    pub const PRIORITY: u8 = 1 << 2;
}

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsConn, WsMessage>;
type WsStream = SplitStream<WsConn>;

/// Everything needed to join one voice session, as handed over by the
/// text gateway's voice-state/voice-server updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
    /// Control channel host, e.g. `region-0001.example.media`.
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitingSessionDescription,
    DiscoveringUdp,
    AwaitingSecretKey,
    Ready,
    Closed,
}

/// What the connection driver has to do next after feeding one inbound
/// message to the handshake.
#[derive(Debug, PartialEq)]
enum HandshakeStep {
    /// Nothing to send, keep reading.
    Continue,
    /// Hello arrived: send one heartbeat immediately.
    SendHeartbeat,
    /// Session was described: run UDP discovery against the endpoint,
    /// then answer with a select-protocol payload.
    Discover {
        ip: String,
        port: u16,
        ssrc: u32,
        mode: EncryptionMode,
    },
    /// The secret key is stored; the session is ready.
    Complete,
}

/// The handshake state machine, kept free of any I/O so every transition
/// can be checked exhaustively.
struct Handshake {
    state: HandshakeState,
    mode: Option<EncryptionMode>,
    secret_key: Option<Vec<u8>>,
    heartbeat_interval: Option<Duration>,
}

impl Handshake {
    fn new() -> Self {
        Handshake {
            state: HandshakeState::Connecting,
            mode: None,
            secret_key: None,
            heartbeat_interval: None,
        }
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    /// The identify payload went out; session description is next.
    fn identify_sent(&mut self) {
        self.state = HandshakeState::AwaitingSessionDescription;
    }

    /// Discovery finished and select-protocol went out. Only the driver's
    /// discovery path calls this, which is what makes a premature
    /// select-protocol impossible.
    fn protocol_selected(&mut self) {
        self.state = HandshakeState::AwaitingSecretKey;
    }

    /// The control channel dropped; no further transitions happen.
    fn closed(&mut self) {
        self.state = HandshakeState::Closed;
    }

    fn on_message(&mut self, message: VoiceMessage) -> Result<HandshakeStep, VoiceConnectError> {
        match (self.state, message) {
            (HandshakeState::AwaitingSessionDescription, VoiceMessage::SessionDescription(desc)) => {
                self.describe(desc)
            }
            (HandshakeState::AwaitingSecretKey, VoiceMessage::SessionReady(ready)) => {
                // the server must confirm the mode we selected
                if EncryptionMode::from_name(&ready.mode) != self.mode {
                    return Err(VoiceConnectError::MalformedPayload("session ready"));
                }
                self.secret_key = Some(ready.secret_key);
                self.state = HandshakeState::Ready;
                Ok(HandshakeStep::Complete)
            }
            // the heartbeat interval may arrive at any point after connect
            (_, VoiceMessage::Hello(hello)) => {
                self.heartbeat_interval =
                    Some(Duration::from_millis(hello.heartbeat_interval as u64));
                Ok(HandshakeStep::SendHeartbeat)
            }
            (_, VoiceMessage::HeartbeatAck(nonce)) => {
                log::debug!("voice heartbeat ack {}", nonce);
                Ok(HandshakeStep::Continue)
            }
            (state, VoiceMessage::Unknown(op)) => {
                log::debug!("ignoring unknown voice opcode {} in {:?}", op, state);
                Ok(HandshakeStep::Continue)
            }
            (state, message) => {
                log::debug!("ignoring out-of-order {:?} in {:?}", message, state);
                Ok(HandshakeStep::Continue)
            }
        }
    }

    fn describe(&mut self, desc: SessionDescription) -> Result<HandshakeStep, VoiceConnectError> {
        let mode =
            EncryptionMode::negotiate(&desc.modes).ok_or(VoiceConnectError::NoSupportedMode)?;
        self.mode = Some(mode);
        self.state = HandshakeState::DiscoveringUdp;
        Ok(HandshakeStep::Discover {
            ip: desc.ip,
            port: desc.port,
            ssrc: desc.ssrc,
            mode,
        })
    }
}

enum Command {
    Speaking(u8),
    Close,
}

/// A live voice connection: the control channel has completed its
/// handshake and the UDP channel holds the secret key.
///
/// Heartbeats and speaking-state updates go through one writer task, so
/// the outbound control channel has a single writer. Audio frames bypass
/// the control channel entirely via [`send_audio`](Self::send_audio).
pub struct VoiceSession {
    udp: Arc<VoiceUdpChannel>,
    ssrc: u32,
    mode: EncryptionMode,
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl VoiceSession {
    /// Performs the full control-channel handshake and UDP discovery.
    ///
    /// Any failure (channel error, malformed payload, no shared
    /// encryption mode) aborts the attempt; callers decide whether to
    /// try again.
    pub async fn connect(info: ConnectionInfo) -> Result<VoiceSession, VoiceConnectError> {
        let endpoint = info
            .endpoint
            .strip_suffix(":80")
            .unwrap_or(&info.endpoint);
        let url = format!("wss://{}/?v={}", endpoint, VOICE_GATEWAY_VERSION);
        log::debug!("connecting voice control channel {}", url);
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let mut handshake = Handshake::new();
        send(
            &mut sink,
            VoiceMessage::Identify(Identify {
                server_id: info.server_id,
                user_id: info.user_id,
                session_id: info.session_id,
                token: info.token,
            }),
        )
        .await?;
        handshake.identify_sent();

        let mut seq_ack: u64 = 0;
        let udp = drive_handshake(&mut sink, &mut stream, &mut handshake, &mut seq_ack).await?;
        let ssrc = udp.ssrc();
        let mode = handshake
            .mode
            .ok_or(VoiceConnectError::MalformedPayload("session description"))?;
        let secret_key = handshake
            .secret_key
            .take()
            .ok_or(VoiceConnectError::MalformedPayload("session ready"))?;
        udp.set_secret(mode, &secret_key)?;

        let (commands, command_rx) = mpsc::channel(16);
        let worker = tokio::spawn(run_control_loop(
            sink,
            stream,
            command_rx,
            handshake.heartbeat_interval,
            // the sequence ack restarts with the fresh secret key
            0,
            ssrc,
        ));

        Ok(VoiceSession {
            udp,
            ssrc,
            mode,
            commands,
            worker,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn encryption_mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Handle to the UDP channel for audio producers that want to own
    /// their own send loop.
    pub fn udp(&self) -> Arc<VoiceUdpChannel> {
        self.udp.clone()
    }

    /// Encrypts and transmits one audio frame; see
    /// [`VoiceUdpChannel::send_audio`].
    pub async fn send_audio(
        &self,
        frame: &[u8],
        sequence: u16,
        timestamp: u32,
    ) -> Result<(), VoiceConnectError> {
        self.udp.send_audio(frame, sequence, timestamp).await
    }

    /// Announces the talk/no-talk state, see the [`speaking`] flags.
    pub async fn send_speaking(&self, flags: u8) -> Result<(), VoiceConnectError> {
        self.commands
            .send(Command::Speaking(flags))
            .await
            .map_err(|_| VoiceConnectError::Closed)
    }

    /// Stops the heartbeat loop, closes the control channel and releases
    /// the UDP socket.
    pub async fn destroy(self) {
        let _ = self.commands.send(Command::Close).await;
        let _ = self.worker.await;
    }
}

async fn send<S>(sink: &mut S, message: VoiceMessage) -> Result<(), VoiceConnectError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let json = message.encode()?;
    sink.send(WsMessage::Text(json)).await?;
    Ok(())
}

/// Runs the handshake over an established control channel until the
/// session is ready, returning the discovered UDP channel.
///
/// Heartbeats start the moment hello arrives and keep their cadence
/// through the whole handshake; UDP discovery runs as one more branch of
/// the select loop, so a slow or lost reply never starves the heartbeat.
/// An unanswered probe is resent on every heartbeat tick.
async fn drive_handshake<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    handshake: &mut Handshake,
    seq_ack: &mut u64,
) -> Result<Arc<VoiceUdpChannel>, VoiceConnectError>
where
    Si: Sink<WsMessage, Error = WsError> + Unpin,
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut heartbeat: Option<Interval> = None;
    let mut udp: Option<Arc<VoiceUdpChannel>> = None;
    let mut mode: Option<EncryptionMode> = None;

    while handshake.state() != HandshakeState::Ready {
        tokio::select! {
            _ = tick(&mut heartbeat) => {
                send(sink, VoiceMessage::Heartbeat(*seq_ack)).await?;
                if handshake.state() == HandshakeState::DiscoveringUdp {
                    if let Some(channel) = &udp {
                        channel.send_discovery().await?;
                    }
                }
            }

            reply = discovery_reply(&udp), if handshake.state() == HandshakeState::DiscoveringUdp => {
                let (public_ip, public_port) = reply?;
                log::debug!("discovered public address {}:{}", public_ip, public_port);
                let mode =
                    mode.ok_or(VoiceConnectError::MalformedPayload("session description"))?;
                send(
                    sink,
                    VoiceMessage::SelectProtocol(SelectProtocol {
                        protocol: "udp".to_string(),
                        data: SelectProtocolData {
                            address: public_ip,
                            port: public_port,
                            mode: mode.as_str().to_string(),
                        },
                    }),
                )
                .await?;
                handshake.protocol_selected();
            }

            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        handshake.closed();
                        return Err(VoiceConnectError::UnexpectedClose);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        handshake.closed();
                        return Err(err.into());
                    }
                };

                let (message, seq) = VoiceMessage::decode(&text)?;
                if let Some(seq) = seq {
                    *seq_ack = seq;
                }

                match handshake.on_message(message)? {
                    HandshakeStep::Continue => {}
                    HandshakeStep::SendHeartbeat => {
                        send(sink, VoiceMessage::Heartbeat(*seq_ack)).await?;
                        heartbeat = handshake.heartbeat_interval.map(delayed_interval);
                    }
                    HandshakeStep::Discover { ip, port, ssrc, mode: selected } => {
                        let channel = Arc::new(VoiceUdpChannel::connect(&ip, port, ssrc).await?);
                        channel.send_discovery().await?;
                        udp = Some(channel);
                        mode = Some(selected);
                    }
                    HandshakeStep::Complete => {}
                }
            }
        }
    }

    udp.ok_or(VoiceConnectError::MalformedPayload("session description"))
}

async fn discovery_reply(
    udp: &Option<Arc<VoiceUdpChannel>>,
) -> Result<(String, u16), VoiceConnectError> {
    match udp {
        Some(channel) => channel.receive_discovery_reply().await,
        // no probe in flight yet
        None => future::pending().await,
    }
}

/// Single writer for the outbound control channel once the handshake is
/// done: heartbeats on their interval, speaking updates on demand.
///
/// A failed heartbeat send is logged and the loop keeps going; if the
/// heartbeats truly stop, the server closes the connection and the read
/// half ends the loop.
async fn run_control_loop(
    mut sink: WsSink,
    mut stream: WsStream,
    mut commands: mpsc::Receiver<Command>,
    heartbeat_interval: Option<Duration>,
    mut seq_ack: u64,
    ssrc: u32,
) {
    let mut heartbeat = heartbeat_interval.map(delayed_interval);

    loop {
        tokio::select! {
            _ = tick(&mut heartbeat) => {
                if let Err(err) = send(&mut sink, VoiceMessage::Heartbeat(seq_ack)).await {
                    log::warn!("failed to send voice heartbeat: {}", err);
                }
            }

            command = commands.recv() => match command {
                Some(Command::Speaking(flags)) => {
                    let message = VoiceMessage::Speaking(Speaking {
                        speaking: flags,
                        delay: 0,
                        ssrc,
                    });
                    if let Err(err) = send(&mut sink, message).await {
                        log::error!("failed to send speaking state: {}", err);
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match VoiceMessage::decode(&text) {
                    Ok((message, seq)) => {
                        if let Some(seq) = seq {
                            seq_ack = seq;
                        }
                        match message {
                            VoiceMessage::Hello(hello) => {
                                let interval =
                                    Duration::from_millis(hello.heartbeat_interval as u64);
                                heartbeat = Some(delayed_interval(interval));
                                if let Err(err) =
                                    send(&mut sink, VoiceMessage::Heartbeat(seq_ack)).await
                                {
                                    log::warn!("failed to send voice heartbeat: {}", err);
                                }
                            }
                            VoiceMessage::HeartbeatAck(nonce) => {
                                log::debug!("voice heartbeat ack {}", nonce);
                            }
                            VoiceMessage::Unknown(op) => {
                                log::debug!("ignoring unknown voice opcode {}", op);
                            }
                            other => {
                                log::debug!("ignoring {:?} on live session", other);
                            }
                        }
                    }
                    Err(err) => log::warn!("undecodable voice control frame: {}", err),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    log::debug!("voice control channel closed by the server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    log::warn!("voice control channel error: {}", err);
                    break;
                }
            },
        }
    }
}

/// An interval whose first tick fires one period from now (the immediate
/// heartbeat on hello is sent separately).
fn delayed_interval(period: Duration) -> Interval {
    time::interval_at(Instant::now() + period, period)
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        // no hello yet, nothing to pace
        None => future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payload::{Hello, SessionReady};
    use crate::udp::DISCOVERY_LEN;
    use futures::channel::mpsc;
    use pretty_assertions::assert_eq;
    use tokio::net::UdpSocket;

    fn description() -> VoiceMessage {
        VoiceMessage::SessionDescription(SessionDescription {
            ssrc: 99,
            ip: "203.0.113.5".to_string(),
            port: 50_004,
            modes: vec!["aead_xchacha20_poly1305_rtpsize".to_string()],
        })
    }

    fn ready() -> VoiceMessage {
        VoiceMessage::SessionReady(SessionReady {
            mode: "aead_xchacha20_poly1305_rtpsize".to_string(),
            secret_key: vec![1u8; 32],
        })
    }

    #[test]
    fn happy_path_transitions() {
        let mut handshake = Handshake::new();
        assert_eq!(handshake.state(), HandshakeState::Connecting);

        handshake.identify_sent();
        assert_eq!(handshake.state(), HandshakeState::AwaitingSessionDescription);

        let step = handshake.on_message(description()).unwrap();
        assert_eq!(
            step,
            HandshakeStep::Discover {
                ip: "203.0.113.5".to_string(),
                port: 50_004,
                ssrc: 99,
                mode: EncryptionMode::AeadXChaCha20Poly1305RtpSize,
            }
        );
        assert_eq!(handshake.state(), HandshakeState::DiscoveringUdp);

        handshake.protocol_selected();
        assert_eq!(handshake.state(), HandshakeState::AwaitingSecretKey);

        assert_eq!(handshake.on_message(ready()).unwrap(), HandshakeStep::Complete);
        assert_eq!(handshake.state(), HandshakeState::Ready);
        assert_eq!(handshake.secret_key.as_deref(), Some(&[1u8; 32][..]));
    }

    #[test]
    fn secret_key_is_ignored_until_discovery_finished() {
        let mut handshake = Handshake::new();
        handshake.identify_sent();
        handshake.on_message(description()).unwrap();

        // still discovering; the select-protocol answer has not gone out
        let step = handshake.on_message(ready()).unwrap();
        assert_eq!(step, HandshakeStep::Continue);
        assert_eq!(handshake.state(), HandshakeState::DiscoveringUdp);
        assert_eq!(handshake.secret_key, None);
    }

    #[test]
    fn hello_is_handled_in_any_state() {
        let mut handshake = Handshake::new();
        handshake.identify_sent();

        let step = handshake
            .on_message(VoiceMessage::Hello(Hello {
                heartbeat_interval: 13_750.0,
            }))
            .unwrap();
        assert_eq!(step, HandshakeStep::SendHeartbeat);
        assert_eq!(
            handshake.heartbeat_interval,
            Some(Duration::from_millis(13_750))
        );
        // the handshake state is unaffected
        assert_eq!(handshake.state(), HandshakeState::AwaitingSessionDescription);
    }

    #[test]
    fn a_mode_mismatch_aborts() {
        let mut handshake = Handshake::new();
        handshake.identify_sent();
        handshake.on_message(description()).unwrap();
        handshake.protocol_selected();

        let err = handshake
            .on_message(VoiceMessage::SessionReady(SessionReady {
                mode: "xsalsa20_poly1305".to_string(),
                secret_key: vec![0u8; 32],
            }))
            .unwrap_err();
        assert!(matches!(err, VoiceConnectError::MalformedPayload(_)));
    }

    #[test]
    fn no_common_mode_aborts() {
        let mut handshake = Handshake::new();
        handshake.identify_sent();

        let err = handshake
            .on_message(VoiceMessage::SessionDescription(SessionDescription {
                ssrc: 1,
                ip: "127.0.0.1".to_string(),
                port: 1,
                modes: vec!["xsalsa20_poly1305".to_string()],
            }))
            .unwrap_err();
        assert!(matches!(err, VoiceConnectError::NoSupportedMode));
    }

    #[test]
    fn unknown_opcodes_do_not_advance_the_handshake() {
        let mut handshake = Handshake::new();
        handshake.identify_sent();

        let step = handshake.on_message(VoiceMessage::Unknown(21)).unwrap();
        assert_eq!(step, HandshakeStep::Continue);
        assert_eq!(handshake.state(), HandshakeState::AwaitingSessionDescription);
    }

    fn frame(message: VoiceMessage) -> Result<WsMessage, WsError> {
        Ok(WsMessage::Text(message.encode().unwrap()))
    }

    #[tokio::test]
    async fn heartbeats_continue_while_discovery_is_pending() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_port = server.local_addr().unwrap().port();

        // answer the probe only after a few heartbeat periods have passed
        let udp_server = tokio::spawn(async move {
            let mut buf = [0u8; DISCOVERY_LEN];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            time::sleep(Duration::from_millis(180)).await;
            let mut reply = [0u8; DISCOVERY_LEN];
            reply[1] = 0x02;
            reply[3] = 0x46;
            reply[8..8 + 9].copy_from_slice(b"127.0.0.1");
            reply[DISCOVERY_LEN - 2..].copy_from_slice(&50_004u16.to_be_bytes());
            server.send_to(&reply, peer).await.unwrap();
        });

        let (tx_in, mut rx_in) = mpsc::unbounded();
        let (tx_out, mut rx_out) = mpsc::unbounded();
        let mut sink = tx_out.sink_map_err(|_| WsError::ConnectionClosed);

        tx_in
            .unbounded_send(frame(VoiceMessage::Hello(Hello {
                heartbeat_interval: 50.0,
            })))
            .unwrap();
        tx_in
            .unbounded_send(frame(VoiceMessage::SessionDescription(SessionDescription {
                ssrc: 7,
                ip: "127.0.0.1".to_string(),
                port: server_port,
                modes: vec!["aead_xchacha20_poly1305_rtpsize".to_string()],
            })))
            .unwrap();

        // answer select-protocol with the session key, counting heartbeats
        let responder = tokio::spawn(async move {
            let mut heartbeats = 0;
            while let Some(message) = rx_out.next().await {
                let WsMessage::Text(text) = message else { continue };
                match VoiceMessage::decode(&text).unwrap().0 {
                    VoiceMessage::Heartbeat(_) => heartbeats += 1,
                    VoiceMessage::SelectProtocol(_) => {
                        tx_in.unbounded_send(frame(ready())).unwrap();
                    }
                    _ => {}
                }
            }
            heartbeats
        });

        let mut handshake = Handshake::new();
        handshake.identify_sent();
        let mut seq_ack = 0;
        drive_handshake(&mut sink, &mut rx_in, &mut handshake, &mut seq_ack)
            .await
            .unwrap();
        assert_eq!(handshake.state(), HandshakeState::Ready);

        drop(sink);
        udp_server.await.unwrap();
        let heartbeats = responder.await.unwrap();
        // the immediate beat on hello plus the periodic ones sent while
        // the discovery reply was still outstanding
        assert!(heartbeats >= 3, "only {} heartbeats went out", heartbeats);
    }

    #[tokio::test]
    async fn a_dropped_channel_closes_the_handshake() {
        let (tx_in, mut rx_in) = mpsc::unbounded::<Result<WsMessage, WsError>>();
        let (tx_out, _rx_out) = mpsc::unbounded();
        let mut sink = tx_out.sink_map_err(|_| WsError::ConnectionClosed);

        let mut handshake = Handshake::new();
        handshake.identify_sent();
        let mut seq_ack = 0;

        drop(tx_in);
        let err = drive_handshake(&mut sink, &mut rx_in, &mut handshake, &mut seq_ack)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceConnectError::UnexpectedClose));
        assert_eq!(handshake.state(), HandshakeState::Closed);
    }
}
