//! RTP media relay
//!
//! Each call owns one relay task and one even/odd UDP port pair; both legs
//! are told to send to the even port and datagrams are classified by
//! source address. The task is the only writer to endpoint state and
//! counters, and everything else talks to it over a command channel.
//!
//! The forwarding rules that matter:
//!  - a packet is accepted as soon as its leg is known, even while the
//!    opposite leg is still unset (those packets are dropped silently,
//!    but they still drive symmetric-RTP learning),
//!  - within the learning window a source may rewrite its leg's endpoint;
//!    after the window unknown sources are dropped,
//!  - telephone-event packets are consumed here and surfaced as events,
//!    never forwarded and never recorded.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{PortRange, RtpConfig};
use crate::media::g711::G711Variant;
use crate::media::tone::{event_to_digit, DtmfDetector};
use crate::media::wav;
use crate::protocols::rtp::{Rfc2833Event, RtpPacket, RtpSender, RtpStreamStats, RTP_HEADER_LEN};
use crate::{Error, Result};

/// Samples per 20 ms injection frame at 8 kHz
const FRAME_SAMPLES: usize = 160;

/// Which leg of the call a packet or command refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLeg {
    A,
    B,
}

impl RelayLeg {
    pub fn opposite(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Commands into the relay task
#[derive(Debug)]
pub enum RelayCommand {
    /// None never overwrites a previously set endpoint
    SetEndpoints {
        a: Option<SocketAddr>,
        b: Option<SocketAddr>,
    },
    /// Hold/resume: whether audio may flow toward each leg
    SetForwarding { to_a: bool, to_b: bool },
    /// Queue PCM for injection toward a leg; the sender completes when
    /// playback finishes and is dropped if it is cut short
    Play {
        to: RelayLeg,
        samples: Vec<i16>,
        done: oneshot::Sender<()>,
    },
    StopPlayback,
    /// Record decoded audio arriving from a leg to a WAV file
    RecordTo { path: std::path::PathBuf, from: RelayLeg },
    StopRecording {
        done: oneshot::Sender<Result<()>>,
    },
    /// Enable the in-band DTMF detector on a leg
    DetectInband { from: RelayLeg },
    Stop,
}

/// Events out of the relay task
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// End-marked RFC 2833 digit
    Rfc2833 { digit: char, duration_ms: u32 },
    /// Digit found by the in-band detector
    InbandDigit { digit: char },
    /// A source rewrote its endpoint during the learning window
    EndpointLearned { leg: RelayLeg, endpoint: SocketAddr },
    PlaybackFinished,
    /// The socket has been unusable for longer than the grace period
    Failed { reason: String },
    Stopped,
}

/// Per-direction counters, exported through a watch channel
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub lost: u32,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub from_a: DirectionStats,
    pub from_b: DirectionStats,
    pub runt_packets: u64,
    pub unknown_source_drops: u64,
    pub recording_drops: u64,
}

impl RelayStats {
    /// Simplified E-model MOS from loss and jitter
    pub fn mos(&self, leg: RelayLeg) -> f64 {
        let stats = match leg {
            RelayLeg::A => &self.from_a,
            RelayLeg::B => &self.from_b,
        };
        let total = stats.packets + u64::from(stats.lost);
        let loss_pct = if total == 0 {
            0.0
        } else {
            f64::from(stats.lost) * 100.0 / total as f64
        };
        let r: f64 = 93.2 - (loss_pct * 2.5) - (stats.jitter_ms * 0.1);
        let r = r.clamp(0.0, 100.0);
        (1.0 + 0.035 * r + 7.0e-6 * r * (r - 60.0) * (100.0 - r)).clamp(1.0, 4.5)
    }
}

/// Even/odd RTP port pairs with a cooldown on reuse
pub struct PortPool {
    cooldown: Duration,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    available: VecDeque<u16>,
    cooling: Vec<(u16, Instant)>,
}

impl PortPool {
    pub fn new(range: &PortRange, cooldown: Duration) -> Self {
        let available = (range.min..range.max)
            .filter(|p| p % 2 == 0)
            .collect();
        Self {
            cooldown,
            inner: Mutex::new(PoolInner {
                available,
                cooling: Vec::new(),
            }),
        }
    }

    /// Take an even port; its odd sibling is implicitly reserved
    pub fn allocate(&self) -> Result<u16> {
        let mut inner = self.inner.lock().expect("port pool lock");

        // Reclaim pairs whose cooldown has elapsed
        let now = Instant::now();
        let cooldown = self.cooldown;
        let mut index = 0;
        while index < inner.cooling.len() {
            if now.duration_since(inner.cooling[index].1) >= cooldown {
                let (port, _) = inner.cooling.swap_remove(index);
                inner.available.push_back(port);
            } else {
                index += 1;
            }
        }

        inner
            .available
            .pop_front()
            .ok_or_else(|| Error::rtp("RTP port pool exhausted"))
    }

    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock().expect("port pool lock");
        inner.cooling.push((port, Instant::now()));
    }

    pub fn available(&self) -> usize {
        self.inner.lock().expect("port pool lock").available.len()
    }
}

struct EndpointState {
    addr: Option<SocketAddr>,
    /// A packet has arrived from this endpoint
    seen: bool,
}

struct PlaybackState {
    to: RelayLeg,
    queue: VecDeque<i16>,
    sender: RtpSender,
    first_packet: bool,
    done: oneshot::Sender<()>,
}

struct RecordingState {
    path: std::path::PathBuf,
    from: RelayLeg,
    samples: Vec<i16>,
}

/// Handle to a running relay task
pub struct MediaRelay {
    pub call_id: String,
    pub local_addr: IpAddr,
    pub rtp_port: u16,
    cmd_tx: mpsc::Sender<RelayCommand>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    stats_rx: watch::Receiver<RelayStats>,
    cancel: CancellationToken,
}

impl MediaRelay {
    /// Allocate a port pair, bind the sockets, start the relay task
    pub async fn spawn(
        call_id: String,
        local_addr: IpAddr,
        pool: Arc<PortPool>,
        rtp_config: &RtpConfig,
        codec: G711Variant,
        dtmf_payload_type: Option<u8>,
    ) -> Result<Self> {
        let rtp_port = pool.allocate()?;

        let rtp_socket = match bind_rtp_socket(local_addr, rtp_port).await {
            Ok(socket) => socket,
            Err(e) => {
                pool.release(rtp_port);
                return Err(e);
            }
        };
        // The odd port carries RTCP; bound so the pair stays ours, drained
        // and otherwise ignored
        let rtcp_socket = match bind_rtp_socket(local_addr, rtp_port + 1).await {
            Ok(socket) => socket,
            Err(e) => {
                pool.release(rtp_port);
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(RelayStats::default());
        let cancel = CancellationToken::new();

        let task = RelayTask {
            call_id: call_id.clone(),
            rtp_socket: Arc::new(rtp_socket),
            rtcp_socket: Arc::new(rtcp_socket),
            endpoint_a: EndpointState { addr: None, seen: false },
            endpoint_b: EndpointState { addr: None, seen: false },
            forward_to_a: true,
            forward_to_b: true,
            learn_until: Instant::now() + Duration::from_secs(u64::from(rtp_config.learn_window)),
            codec,
            dtmf_payload_type,
            stats: RelayStats::default(),
            stats_a: RtpStreamStats::new(8000),
            stats_b: RtpStreamStats::new(8000),
            last_rfc2833: None,
            playback: None,
            recording: None,
            inband: None,
            event_tx,
            stats_tx,
            socket_error_since: None,
            packet_timeout: Duration::from_secs(u64::from(rtp_config.packet_timeout)),
        };

        let cancel_task = cancel.clone();
        let pool_release = Arc::clone(&pool);
        let release_port = rtp_port;
        tokio::spawn(async move {
            task.run(cmd_rx, cancel_task).await;
            pool_release.release(release_port);
        });

        info!("Media relay for call {} on {}:{}", call_id, local_addr, rtp_port);

        Ok(Self {
            call_id,
            local_addr,
            rtp_port,
            cmd_tx,
            event_rx: Mutex::new(Some(event_rx)),
            stats_rx,
            cancel,
        })
    }

    /// The event stream can be taken once, by whichever task will drain it
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.event_rx.lock().expect("relay event receiver lock").take()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats_rx.borrow().clone()
    }

    pub async fn set_endpoints(&self, a: Option<SocketAddr>, b: Option<SocketAddr>) -> Result<()> {
        self.send(RelayCommand::SetEndpoints { a, b }).await
    }

    pub async fn set_forwarding(&self, to_a: bool, to_b: bool) -> Result<()> {
        self.send(RelayCommand::SetForwarding { to_a, to_b }).await
    }

    /// Queue a prompt toward a leg; resolves when playback completes
    pub async fn play(&self, to: RelayLeg, samples: Vec<i16>) -> Result<oneshot::Receiver<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(RelayCommand::Play {
            to,
            samples,
            done: done_tx,
        })
        .await?;
        Ok(done_rx)
    }

    pub async fn stop_playback(&self) -> Result<()> {
        self.send(RelayCommand::StopPlayback).await
    }

    pub async fn record_to(&self, path: std::path::PathBuf, from: RelayLeg) -> Result<()> {
        self.send(RelayCommand::RecordTo { path, from }).await
    }

    /// Finish recording and flush the file
    pub async fn stop_recording(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(RelayCommand::StopRecording { done: done_tx }).await?;
        done_rx
            .await
            .map_err(|_| Error::rtp("Relay went away during recording stop"))?
    }

    pub async fn detect_inband(&self, from: RelayLeg) -> Result<()> {
        self.send(RelayCommand::DetectInband { from }).await
    }

    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Stop).await;
        self.cancel.cancel();
    }

    async fn send(&self, command: RelayCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::rtp("Media relay task has exited"))
    }
}

/// Bind a UDP socket with a deep receive buffer; media bursts arrive
/// faster than the scheduler wakes us under load
async fn bind_rtp_socket(local_addr: IpAddr, port: u16) -> Result<UdpSocket> {
    let bind_addr = SocketAddr::new(local_addr, port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::network(format!("RTP socket create: {}", e)))?;
    socket
        .set_recv_buffer_size(256 * 1024)
        .map_err(|e| Error::network(format!("RTP socket buffer: {}", e)))?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&bind_addr.into())
        .map_err(|e| Error::network(format!("RTP bind {}: {}", bind_addr, e)))?;
    UdpSocket::from_std(socket.into())
        .map_err(|e| Error::network(format!("RTP socket register: {}", e)))
}

struct RelayTask {
    call_id: String,
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Arc<UdpSocket>,
    endpoint_a: EndpointState,
    endpoint_b: EndpointState,
    forward_to_a: bool,
    forward_to_b: bool,
    learn_until: Instant,
    codec: G711Variant,
    dtmf_payload_type: Option<u8>,
    stats: RelayStats,
    stats_a: RtpStreamStats,
    stats_b: RtpStreamStats,
    /// (timestamp, event) of the last end-marked tone already reported
    last_rfc2833: Option<(u32, u8)>,
    playback: Option<PlaybackState>,
    recording: Option<RecordingState>,
    inband: Option<(RelayLeg, DtmfDetector)>,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
    stats_tx: watch::Sender<RelayStats>,
    socket_error_since: Option<Instant>,
    packet_timeout: Duration,
}

impl RelayTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>, cancel: CancellationToken) {
        let mut rtp_buf = vec![0u8; 2048];
        let mut rtcp_buf = vec![0u8; 2048];
        let mut pace = interval(Duration::from_millis(20));
        let mut stats_tick = interval(Duration::from_secs(5));

        // Local handles so the select arms do not hold borrows of the task
        let rtp_socket = Arc::clone(&self.rtp_socket);
        let rtcp_socket = Arc::clone(&self.rtcp_socket);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                result = rtp_socket.recv_from(&mut rtp_buf) => {
                    match result {
                        Ok((len, source)) => {
                            self.socket_error_since = None;
                            self.handle_datagram(&rtp_buf[..len], source).await;
                        }
                        Err(e) => {
                            if self.note_socket_error(&e) {
                                break;
                            }
                        }
                    }
                }

                // RTCP is drained so the kernel buffer stays empty
                result = rtcp_socket.recv_from(&mut rtcp_buf) => {
                    if let Ok((len, source)) = result {
                        trace!("RTCP {} bytes from {}", len, source);
                    }
                }

                command = cmd_rx.recv() => {
                    match command {
                        Some(RelayCommand::Stop) | None => break,
                        Some(command) => {
                            if self.handle_command(command) {
                                break;
                            }
                        }
                    }
                }

                _ = pace.tick() => {
                    self.playback_tick().await;
                }

                _ = stats_tick.tick() => {
                    self.publish_stats();
                }
            }
        }

        self.finish_recording().ok();
        self.publish_stats();
        let _ = self.event_tx.send(RelayEvent::Stopped);
        debug!("Media relay for call {} stopped", self.call_id);
    }

    /// Returns true when errors have persisted past the grace period
    fn note_socket_error(&mut self, error: &std::io::Error) -> bool {
        warn!("RTP receive error on call {}: {}", self.call_id, error);
        let since = *self.socket_error_since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.packet_timeout {
            let _ = self.event_tx.send(RelayEvent::Failed {
                reason: format!("Socket unusable for {:?}: {}", self.packet_timeout, error),
            });
            return true;
        }
        false
    }

    /// Returns true if the task should exit
    fn handle_command(&mut self, command: RelayCommand) -> bool {
        match command {
            RelayCommand::SetEndpoints { a, b } => {
                if let Some(a) = a {
                    if self.endpoint_a.addr != Some(a) {
                        self.endpoint_a = EndpointState { addr: Some(a), seen: false };
                        debug!("Call {} endpoint A set to {}", self.call_id, a);
                    }
                }
                if let Some(b) = b {
                    if self.endpoint_b.addr != Some(b) {
                        self.endpoint_b = EndpointState { addr: Some(b), seen: false };
                        debug!("Call {} endpoint B set to {}", self.call_id, b);
                    }
                }
            }
            RelayCommand::SetForwarding { to_a, to_b } => {
                self.forward_to_a = to_a;
                self.forward_to_b = to_b;
            }
            RelayCommand::Play { to, samples, done } => {
                let payload_type = self.codec.payload_type();
                self.playback = Some(PlaybackState {
                    to,
                    queue: samples.into(),
                    sender: RtpSender::new(payload_type),
                    first_packet: true,
                    done,
                });
            }
            RelayCommand::StopPlayback => {
                self.playback = None;
            }
            RelayCommand::RecordTo { path, from } => {
                self.recording = Some(RecordingState {
                    path,
                    from,
                    samples: Vec::with_capacity(8000 * 30),
                });
            }
            RelayCommand::StopRecording { done } => {
                let _ = done.send(self.finish_recording());
            }
            RelayCommand::DetectInband { from } => {
                self.inband = Some((from, DtmfDetector::new(8000)));
            }
            RelayCommand::Stop => return true,
        }
        false
    }

    async fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        // Runts below an RTP header never forward
        if data.len() < RTP_HEADER_LEN {
            self.stats.runt_packets += 1;
            return;
        }

        let leg = match self.classify_source(source) {
            Some(leg) => leg,
            None => {
                self.stats.unknown_source_drops += 1;
                trace!("Call {}: dropping packet from unknown {}", self.call_id, source);
                return;
            }
        };

        let packet = match RtpPacket::decode(Bytes::copy_from_slice(data)) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.runt_packets += 1;
                return;
            }
        };

        // Per-direction counters
        match leg {
            RelayLeg::A => {
                self.stats_a.update(&packet, data.len());
                self.stats.from_a.packets = self.stats_a.packets;
                self.stats.from_a.bytes = self.stats_a.bytes;
                self.stats.from_a.lost = self.stats_a.packets_lost;
                self.stats.from_a.jitter_ms = self.stats_a.jitter_ms();
            }
            RelayLeg::B => {
                self.stats_b.update(&packet, data.len());
                self.stats.from_b.packets = self.stats_b.packets;
                self.stats.from_b.bytes = self.stats_b.bytes;
                self.stats.from_b.lost = self.stats_b.packets_lost;
                self.stats.from_b.jitter_ms = self.stats_b.jitter_ms();
            }
        }

        // Telephone-event packets are consumed, not relayed
        if Some(packet.payload_type) == self.dtmf_payload_type {
            self.handle_telephone_event(&packet);
            return;
        }

        self.tap_audio(leg, &packet);

        // Forward to the opposite endpoint when known and not on hold
        let (dest, allowed) = match leg {
            RelayLeg::A => (self.endpoint_b.addr, self.forward_to_b),
            RelayLeg::B => (self.endpoint_a.addr, self.forward_to_a),
        };
        if let Some(dest) = dest {
            if allowed {
                if let Err(e) = self.rtp_socket.send_to(data, dest).await {
                    trace!("Forward to {} failed: {}", dest, e);
                }
            }
        }
        // No destination yet: silently dropped, per the early-packets rule
    }

    /// Map a source address to a leg, learning as allowed.
    fn classify_source(&mut self, source: SocketAddr) -> Option<RelayLeg> {
        // Exact endpoint match
        if self.endpoint_a.addr == Some(source) {
            self.endpoint_a.seen = true;
            return Some(RelayLeg::A);
        }
        if self.endpoint_b.addr == Some(source) {
            self.endpoint_b.seen = true;
            return Some(RelayLeg::B);
        }

        let learning = Instant::now() < self.learn_until;
        if !learning {
            return None;
        }

        // Same host, different port: symmetric-RTP port rewrite
        if let Some(addr) = self.endpoint_a.addr {
            if addr.ip() == source.ip() {
                self.learn(RelayLeg::A, source);
                return Some(RelayLeg::A);
            }
        }
        if let Some(addr) = self.endpoint_b.addr {
            if addr.ip() == source.ip() {
                self.learn(RelayLeg::B, source);
                return Some(RelayLeg::B);
            }
        }

        // Unknown host inside the window: attribute it to a leg that has a
        // configured endpoint nothing has arrived from yet (the NAT case:
        // the SDP address was private, the packets come from the public
        // mapping)
        if self.endpoint_a.addr.is_some() && !self.endpoint_a.seen {
            self.learn(RelayLeg::A, source);
            return Some(RelayLeg::A);
        }
        if self.endpoint_b.addr.is_some() && !self.endpoint_b.seen {
            self.learn(RelayLeg::B, source);
            return Some(RelayLeg::B);
        }

        None
    }

    fn learn(&mut self, leg: RelayLeg, source: SocketAddr) {
        let endpoint = match leg {
            RelayLeg::A => &mut self.endpoint_a,
            RelayLeg::B => &mut self.endpoint_b,
        };
        if endpoint.addr != Some(source) {
            info!(
                "Call {}: learned endpoint {:?} at {} (was {:?})",
                self.call_id, leg, source, endpoint.addr
            );
            endpoint.addr = Some(source);
            let _ = self.event_tx.send(RelayEvent::EndpointLearned { leg, endpoint: source });
        }
        endpoint.seen = true;
    }

    fn handle_telephone_event(&mut self, packet: &RtpPacket) {
        let event = match Rfc2833Event::decode(&packet.payload) {
            Ok(event) => event,
            Err(_) => return,
        };

        // One report per tone: fire on the end bit, ignore the redundant
        // end copies senders emit (up to three share timestamp and event)
        if !event.end {
            return;
        }
        if self.last_rfc2833 == Some((packet.timestamp, event.event)) {
            return;
        }
        self.last_rfc2833 = Some((packet.timestamp, event.event));

        if let Some(digit) = event_to_digit(event.event) {
            let duration_ms = event.duration_ms(8000);
            debug!("Call {}: RFC 2833 digit {} ({} ms)", self.call_id, digit, duration_ms);
            let _ = self.event_tx.send(RelayEvent::Rfc2833 { digit, duration_ms });
        }
    }

    /// Recording tap and in-band detection on decoded audio
    fn tap_audio(&mut self, leg: RelayLeg, packet: &RtpPacket) {
        let wants_recording = self
            .recording
            .as_ref()
            .map(|r| r.from == leg)
            .unwrap_or(false);
        let wants_inband = self.inband.as_ref().map(|(l, _)| *l == leg).unwrap_or(false);
        if !wants_recording && !wants_inband {
            return;
        }

        let pcm = self.codec.decode(&packet.payload);

        if wants_recording {
            if let Some(recording) = &mut self.recording {
                // A bounded buffer: beyond ~10 minutes we drop rather than
                // grow without limit
                if recording.samples.len() < 8000 * 600 {
                    recording.samples.extend_from_slice(&pcm);
                } else {
                    self.stats.recording_drops += 1;
                }
            }
        }

        if wants_inband {
            if let Some((_, detector)) = &mut self.inband {
                if let Some(digit) = detector.process(&pcm) {
                    debug!("Call {}: in-band digit {}", self.call_id, digit);
                    let _ = self.event_tx.send(RelayEvent::InbandDigit { digit });
                }
            }
        }
    }

    async fn playback_tick(&mut self) {
        let Some(playback) = &mut self.playback else {
            return;
        };

        let dest = match playback.to {
            RelayLeg::A => self.endpoint_a.addr,
            RelayLeg::B => self.endpoint_b.addr,
        };
        let Some(dest) = dest else {
            // Destination still unknown; hold the frame
            return;
        };

        if playback.queue.is_empty() {
            let finished = self.playback.take().unwrap();
            let _ = finished.done.send(());
            let _ = self.event_tx.send(RelayEvent::PlaybackFinished);
            return;
        }

        let frame: Vec<i16> = {
            let take = playback.queue.len().min(FRAME_SAMPLES);
            let mut frame: Vec<i16> = playback.queue.drain(..take).collect();
            // Pad the tail frame with silence
            frame.resize(FRAME_SAMPLES, 0);
            frame
        };

        let payload = Bytes::from(self.codec.encode(&frame));
        let marker = playback.first_packet;
        playback.first_packet = false;
        let packet = playback.sender.next_packet(payload, FRAME_SAMPLES as u32, marker);

        if let Err(e) = self.rtp_socket.send_to(&packet.encode(), dest).await {
            trace!("Playback send to {} failed: {}", dest, e);
        }
    }

    fn finish_recording(&mut self) -> Result<()> {
        if let Some(recording) = self.recording.take() {
            wav::write_wav(&recording.path, &recording.samples)?;
            info!(
                "Call {}: recording written to {} ({} ms)",
                self.call_id,
                recording.path.display(),
                recording.samples.len() / 8
            );
        }
        Ok(())
    }

    fn publish_stats(&self) {
        let _ = self.stats_tx.send(self.stats.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;

    fn rtp_config() -> RtpConfig {
        let mut config = PbxConfig::default_config().rtp;
        config.port_range = PortRange { min: 21000, max: 21100 };
        config
    }

    async fn spawn_relay(pool: Arc<PortPool>) -> MediaRelay {
        MediaRelay::spawn(
            "call-test".to_string(),
            "127.0.0.1".parse().unwrap(),
            pool,
            &rtp_config(),
            G711Variant::MuLaw,
            Some(101),
        )
        .await
        .unwrap()
    }

    fn audio_packet(seq: u16, ts: u32) -> Bytes {
        let mut packet = RtpPacket::new(0, seq, ts, 0x1111);
        packet.payload = Bytes::from(vec![0xFFu8; 160]);
        packet.encode()
    }

    fn dtmf_packet(seq: u16, ts: u32, event: u8, end: bool, duration: u16) -> Bytes {
        let mut packet = RtpPacket::new(101, seq, ts, 0x1111);
        packet.payload = Rfc2833Event {
            event,
            end,
            volume: 10,
            duration,
        }
        .encode();
        packet.encode()
    }

    #[test]
    fn test_port_pool_even_allocation() {
        let pool = PortPool::new(
            &PortRange { min: 10000, max: 10010 },
            Duration::from_secs(30),
        );
        let mut seen = Vec::new();
        while let Ok(port) = pool.allocate() {
            assert_eq!(port % 2, 0);
            seen.push(port);
        }
        assert_eq!(seen, vec![10000, 10002, 10004, 10006, 10008]);
    }

    #[test]
    fn test_port_pool_cooldown() {
        let pool = PortPool::new(
            &PortRange { min: 10000, max: 10002 },
            Duration::from_millis(50),
        );
        let port = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());

        pool.release(port);
        // Still cooling
        assert!(pool.allocate().is_err());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.allocate().unwrap(), port);
    }

    #[tokio::test]
    async fn test_forwarding_between_known_endpoints() {
        let pool = Arc::new(PortPool::new(
            &PortRange { min: 21000, max: 21020 },
            Duration::from_secs(1),
        ));
        let relay = spawn_relay(Arc::clone(&pool)).await;

        let phone_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let phone_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay
            .set_endpoints(
                Some(phone_a.local_addr().unwrap()),
                Some(phone_b.local_addr().unwrap()),
            )
            .await
            .unwrap();

        let relay_addr: SocketAddr = format!("127.0.0.1:{}", relay.rtp_port).parse().unwrap();
        phone_a.send_to(&audio_packet(1, 160), relay_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), phone_b.recv_from(&mut buf))
            .await
            .expect("packet should be forwarded")
            .unwrap();
        assert_eq!(from, relay_addr);
        assert_eq!(&buf[..len], &audio_packet(1, 160)[..]);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_early_packets_accepted_before_b_known() {
        let pool = Arc::new(PortPool::new(
            &PortRange { min: 21020, max: 21040 },
            Duration::from_secs(1),
        ));
        let relay = spawn_relay(Arc::clone(&pool)).await;
        let mut events = relay.take_event_receiver().unwrap();

        let phone_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Endpoint A configured with A's host but a wrong port, B unknown
        let advertised = SocketAddr::new(
            phone_a.local_addr().unwrap().ip(),
            40000,
        );
        relay.set_endpoints(Some(advertised), None).await.unwrap();

        let relay_addr: SocketAddr = format!("127.0.0.1:{}", relay.rtp_port).parse().unwrap();
        phone_a.send_to(&audio_packet(1, 160), relay_addr).await.unwrap();

        // The learned endpoint must be A's real source port
        let learned = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(RelayEvent::EndpointLearned { leg, endpoint }) => {
                        return (leg, endpoint);
                    }
                    Some(_) => continue,
                    None => panic!("relay exited"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(learned.0, RelayLeg::A);
        assert_eq!(learned.1, phone_a.local_addr().unwrap());

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_rfc2833_extracted_not_forwarded() {
        let pool = Arc::new(PortPool::new(
            &PortRange { min: 21040, max: 21060 },
            Duration::from_secs(1),
        ));
        let relay = spawn_relay(Arc::clone(&pool)).await;
        let mut events = relay.take_event_receiver().unwrap();

        let phone_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let phone_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay
            .set_endpoints(
                Some(phone_a.local_addr().unwrap()),
                Some(phone_b.local_addr().unwrap()),
            )
            .await
            .unwrap();

        let relay_addr: SocketAddr = format!("127.0.0.1:{}", relay.rtp_port).parse().unwrap();

        // A '5' keypress: start packet, then three redundant end packets
        phone_a.send_to(&dtmf_packet(10, 8000, 5, false, 160), relay_addr).await.unwrap();
        phone_a.send_to(&dtmf_packet(11, 8000, 5, true, 800), relay_addr).await.unwrap();
        phone_a.send_to(&dtmf_packet(12, 8000, 5, true, 800), relay_addr).await.unwrap();
        phone_a.send_to(&dtmf_packet(13, 8000, 5, true, 800), relay_addr).await.unwrap();

        let mut digits = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(RelayEvent::Rfc2833 { digit, duration_ms })) => {
                    digits.push((digit, duration_ms));
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        // One completed event despite three end-marked copies
        assert_eq!(digits, vec![('5', 100)]);

        // Nothing was forwarded to B
        let mut buf = [0u8; 2048];
        let forwarded =
            tokio::time::timeout(Duration::from_millis(300), phone_b.recv_from(&mut buf)).await;
        assert!(forwarded.is_err(), "telephone-event packets must not be relayed");

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_runt_packets_counted() {
        let pool = Arc::new(PortPool::new(
            &PortRange { min: 21060, max: 21080 },
            Duration::from_secs(1),
        ));
        let relay = spawn_relay(Arc::clone(&pool)).await;

        let phone_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay
            .set_endpoints(Some(phone_a.local_addr().unwrap()), None)
            .await
            .unwrap();

        let relay_addr: SocketAddr = format!("127.0.0.1:{}", relay.rtp_port).parse().unwrap();
        phone_a.send_to(b"tiny", relay_addr).await.unwrap();
        phone_a.send_to(&audio_packet(1, 0), relay_addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        relay.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = relay.stats();
        assert_eq!(stats.runt_packets, 1);
        assert_eq!(stats.from_a.packets, 1);
    }

    #[tokio::test]
    async fn test_playback_reaches_endpoint() {
        let pool = Arc::new(PortPool::new(
            &PortRange { min: 21080, max: 21100 },
            Duration::from_secs(1),
        ));
        let relay = spawn_relay(Arc::clone(&pool)).await;

        let phone_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay
            .set_endpoints(Some(phone_a.local_addr().unwrap()), None)
            .await
            .unwrap();

        // 100 ms prompt: five 20 ms frames
        let done = relay.play(RelayLeg::A, vec![1000i16; 800]).await.unwrap();

        let mut received = 0;
        let mut buf = [0u8; 2048];
        while received < 5 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), phone_a.recv_from(&mut buf))
                .await
                .expect("prompt frames should arrive")
                .unwrap();
            let packet = RtpPacket::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
            assert_eq!(packet.payload.len(), FRAME_SAMPLES);
            if received == 0 {
                assert!(packet.marker);
            }
            received += 1;
        }

        tokio::time::timeout(Duration::from_secs(2), done)
            .await
            .expect("playback should complete")
            .unwrap();

        relay.stop().await;
    }

    #[test]
    fn test_mos_degrades_with_loss() {
        let clean = RelayStats::default();
        let mut lossy = RelayStats::default();
        lossy.from_a.packets = 900;
        lossy.from_a.lost = 100;
        lossy.from_a.jitter_ms = 40.0;

        assert!(clean.mos(RelayLeg::A) > 4.0);
        assert!(lossy.mos(RelayLeg::A) < clean.mos(RelayLeg::A));
    }
}
