//! SIP transport: UDP and TCP listeners, message framing, Via stamping
//!
//! UDP datagrams are one message each; TCP streams are framed by scanning
//! for the header terminator and honoring Content-Length. Incoming
//! requests get `received=`/`rport=` stamped onto their top Via so
//! responses travel back over the NAT path they arrived on.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::SipConfig;
use crate::protocols::sip::SipMessage;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// Transport events
#[derive(Debug)]
pub enum TransportEvent {
    MessageReceived {
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    },
    Error {
        message: String,
    },
}

/// UDP/TCP SIP listener and sender
pub struct SipTransport {
    config: SipConfig,
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    tcp_writers: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    is_running: bool,
}

impl SipTransport {
    pub async fn bind(config: SipConfig) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.bind_address, config.listen_port);
        let udp = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::network(format!("Failed to bind SIP UDP {}: {}", bind_addr, e)))?;
        let local_addr = udp.local_addr()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            udp: Arc::new(udp),
            local_addr,
            tcp_writers: Arc::new(DashMap::new()),
            event_tx,
            event_rx: Some(event_rx),
            is_running: false,
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting SIP transport on {}", self.local_addr);

        // UDP receive loop
        let udp = Arc::clone(&self.udp);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            Self::udp_receive_loop(udp, event_tx).await;
        });

        // TCP accept loop
        if self.config.enable_tcp {
            let bind_addr = SocketAddr::new(self.config.bind_address, self.config.listen_port);
            let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
                Error::network(format!("Failed to bind SIP TCP {}: {}", bind_addr, e))
            })?;
            let event_tx = self.event_tx.clone();
            let writers = Arc::clone(&self.tcp_writers);

            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!("Accepted SIP TCP connection from {}", peer);
                            Self::spawn_tcp_connection(stream, peer, &event_tx, &writers);
                        }
                        Err(e) => {
                            warn!("SIP TCP accept failed: {}", e);
                        }
                    }
                }
            });
        }

        self.is_running = true;
        info!("SIP transport started");
        Ok(())
    }

    async fn udp_receive_loop(
        udp: Arc<UdpSocket>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut buffer = vec![0u8; 65535];

        loop {
            match udp.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = &buffer[..size];
                    // CRLF keep-alives from phones
                    if data.iter().all(|b| b.is_ascii_whitespace()) {
                        trace!("Keep-alive from {}", source);
                        continue;
                    }

                    match SipMessage::parse(data) {
                        Ok(mut message) => {
                            if message.is_request() {
                                stamp_received(&mut message, source);
                            }
                            let _ = event_tx.send(TransportEvent::MessageReceived {
                                message,
                                source,
                                transport: TransportKind::Udp,
                            });
                        }
                        Err(e) => {
                            debug!("Dropping unparseable datagram from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("SIP UDP receive error: {}", e);
                    let _ = event_tx.send(TransportEvent::Error {
                        message: format!("UDP receive: {}", e),
                    });
                }
            }
        }
    }

    fn spawn_tcp_connection(
        stream: TcpStream,
        peer: SocketAddr,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
        writers: &Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(32);
        writers.insert(peer, write_tx);

        // Writer task drains the per-connection queue
        tokio::spawn(async move {
            while let Some(data) = write_rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    debug!("SIP TCP write to {} failed: {}", peer, e);
                    break;
                }
            }
        });

        let event_tx = event_tx.clone();
        let writers = Arc::clone(writers);
        tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(8192);
            let mut chunk = vec![0u8; 8192];

            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        while let Some(frame) = extract_frame(&mut buffer) {
                            match SipMessage::parse(&frame) {
                                Ok(mut message) => {
                                    if message.is_request() {
                                        stamp_received(&mut message, peer);
                                    }
                                    let _ = event_tx.send(TransportEvent::MessageReceived {
                                        message,
                                        source: peer,
                                        transport: TransportKind::Tcp,
                                    });
                                }
                                Err(e) => {
                                    debug!("Dropping bad TCP frame from {}: {}", peer, e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!("SIP TCP read from {} failed: {}", peer, e);
                        break;
                    }
                }
            }

            writers.remove(&peer);
            debug!("SIP TCP connection from {} closed", peer);
        });
    }

    pub async fn send(
        &self,
        message: &SipMessage,
        dest: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        let data = message.to_bytes();
        trace!("Sending {} bytes to {} via {}", data.len(), dest, transport.as_str());

        match transport {
            TransportKind::Udp => {
                self.udp
                    .send_to(&data, dest)
                    .await
                    .map_err(|e| Error::network(format!("UDP send to {}: {}", dest, e)))?;
            }
            TransportKind::Tcp => {
                if let Some(writer) = self.tcp_writers.get(&dest) {
                    writer
                        .send(data)
                        .await
                        .map_err(|_| Error::network(format!("TCP connection to {} gone", dest)))?;
                    return Ok(());
                }

                // No established connection, dial out
                let stream = TcpStream::connect(dest)
                    .await
                    .map_err(|e| Error::network(format!("TCP connect to {}: {}", dest, e)))?;
                Self::spawn_tcp_connection(stream, dest, &self.event_tx, &self.tcp_writers);
                let writer = self
                    .tcp_writers
                    .get(&dest)
                    .ok_or_else(|| Error::network("TCP connection vanished after connect"))?;
                writer
                    .send(data)
                    .await
                    .map_err(|_| Error::network(format!("TCP connection to {} gone", dest)))?;
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping SIP transport");
        self.tcp_writers.clear();
        self.is_running = false;
        Ok(())
    }
}

/// Pull one complete SIP message off the front of a TCP buffer.
///
/// Returns None until the headers and the Content-Length body are fully
/// buffered.
fn extract_frame(buffer: &mut BytesMut) -> Option<Bytes> {
    // Skip leading keep-alive CRLFs
    while buffer.starts_with(b"\r\n") {
        let _ = buffer.split_to(2);
    }

    let head_end = find_subsequence(buffer, b"\r\n\r\n")?;
    let head = &buffer[..head_end];

    let content_length = parse_content_length(head).unwrap_or(0);
    let total = head_end + 4 + content_length;
    if buffer.len() < total {
        return None;
    }

    Some(buffer.split_to(total).freeze())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n") {
        let (name, value) = match line.split_once(':') {
            Some(kv) => kv,
            None => continue,
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().ok();
        }
    }
    None
}

/// Amend the top Via with the observed source address, per RFC 3261 §18.2.1
/// and the rport extension. The stamped Via is what response routing uses.
pub fn stamp_received(message: &mut SipMessage, source: SocketAddr) {
    let via = match message.header("Via") {
        Some(via) => via.to_string(),
        None => return,
    };

    let sent_by_host = via
        .split_whitespace()
        .nth(1)
        .and_then(|hp| hp.split(';').next())
        .map(|hp| hp.split(':').next().unwrap_or(hp).to_string());

    let mut stamped = via.clone();

    // received= when the advertised host differs from the actual source
    let needs_received = sent_by_host
        .as_deref()
        .map(|host| host != source.ip().to_string())
        .unwrap_or(true);
    if needs_received && !via.contains("received=") {
        stamped.push_str(&format!(";received={}", source.ip()));
    }

    // rport= filled in whenever the client asked for it
    if let Some(idx) = stamped.find(";rport") {
        let after = &stamped[idx + 6..];
        if !after.starts_with('=') {
            stamped = format!(
                "{};rport={}{}",
                &stamped[..idx],
                source.port(),
                after.to_string()
            );
        }
    }

    if stamped != via {
        // Replace only the first Via
        for header in &mut message.headers {
            if header.name.eq_ignore_ascii_case("Via") {
                header.value = stamped;
                break;
            }
        }
    }
}

/// The address a response to this request should be sent to: the top Via's
/// received/rport when present, the source address otherwise.
pub fn response_destination(request: &SipMessage, source: SocketAddr) -> SocketAddr {
    let via = match request.header("Via") {
        Some(via) => via,
        None => return source,
    };

    let mut ip = None;
    let mut port = None;
    for param in via.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("received=") {
            ip = value.parse().ok();
        } else if let Some(value) = param.strip_prefix("rport=") {
            port = value.parse().ok();
        }
    }

    SocketAddr::new(ip.unwrap_or_else(|| source.ip()), port.unwrap_or_else(|| source.port()))
}

/// Resolve a SIP URI host to a socket address (A record, port 5060 default)
pub async fn resolve_host(host: &str, port: Option<u16>) -> Result<SocketAddr> {
    let port = port.unwrap_or(5060);

    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::network(format!("DNS lookup for {}: {}", host, e)))?;

    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::network(format!("No A record for {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::sip::SipMethod;

    fn request_with_via(via: &str) -> SipMessage {
        let mut msg = SipMessage::new_request(SipMethod::Register, "sip:pbx.local");
        msg.add_header("Via", via);
        msg.add_header("Call-ID", "t@test");
        msg
    }

    #[test]
    fn test_stamp_received_nat() {
        let mut msg = request_with_via("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKx;rport");
        stamp_received(&mut msg, "203.0.113.7:49152".parse().unwrap());
        let via = msg.header("Via").unwrap();
        assert!(via.contains("received=203.0.113.7"), "via: {}", via);
        assert!(via.contains("rport=49152"), "via: {}", via);
    }

    #[test]
    fn test_stamp_received_matching_host() {
        let mut msg = request_with_via("SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKx");
        stamp_received(&mut msg, "192.168.1.10:5060".parse().unwrap());
        let via = msg.header("Via").unwrap();
        assert!(!via.contains("received="));
    }

    #[test]
    fn test_response_destination_prefers_stamps() {
        let mut msg = request_with_via(
            "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKx;received=203.0.113.7;rport=49152",
        );
        stamp_received(&mut msg, "9.9.9.9:1234".parse().unwrap());
        let dest = response_destination(&msg, "9.9.9.9:1234".parse().unwrap());
        assert_eq!(dest, "203.0.113.7:49152".parse().unwrap());
    }

    #[test]
    fn test_response_destination_falls_back_to_source() {
        let msg = request_with_via("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKx");
        let source: SocketAddr = "192.0.2.1:5062".parse().unwrap();
        assert_eq!(response_destination(&msg, source), source);
    }

    #[test]
    fn test_extract_frame_waits_for_body() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"OPTIONS sip:x SIP/2.0\r\nContent-Length: 5\r\n\r\nhel");
        assert!(extract_frame(&mut buffer).is_none());

        buffer.extend_from_slice(b"lo");
        let frame = extract_frame(&mut buffer).unwrap();
        assert!(frame.ends_with(b"hello"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_extract_frame_two_messages() {
        let one = b"OPTIONS sip:x SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(one);
        buffer.extend_from_slice(one);

        assert!(extract_frame(&mut buffer).is_some());
        assert!(extract_frame(&mut buffer).is_some());
        assert!(extract_frame(&mut buffer).is_none());
    }

    #[test]
    fn test_extract_frame_skips_keepalive() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"\r\n\r\nOPTIONS sip:x SIP/2.0\r\nContent-Length: 0\r\n\r\n");
        let frame = extract_frame(&mut buffer).unwrap();
        assert!(frame.starts_with(b"OPTIONS"));
    }

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let addr = resolve_host("192.168.1.20", Some(5080)).await.unwrap();
        assert_eq!(addr, "192.168.1.20:5080".parse().unwrap());

        let default_port = resolve_host("10.0.0.1", None).await.unwrap();
        assert_eq!(default_port.port(), 5060);
    }

    #[tokio::test]
    async fn test_udp_bind_and_event_channel() {
        let mut config = crate::config::PbxConfig::default_config().sip;
        config.listen_port = 0; // ephemeral
        config.enable_tcp = false;

        let mut transport = SipTransport::bind(config).await.unwrap();
        assert!(transport.take_event_receiver().is_some());
        assert!(transport.take_event_receiver().is_none());
        assert_ne!(transport.local_addr().port(), 0);
    }
}
