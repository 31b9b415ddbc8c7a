//! SIP transactions: retransmission, matching, absorption
//!
//! Client transactions retransmit over UDP on the T1-doubling schedule
//! until a response arrives or Timer B expires. Server transactions absorb
//! request retransmissions and replay the last response. 2xx responses to
//! INVITE that match no client transaction are passed up anyway; the
//! dialog layer deals with them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::protocols::sip::{SipMessage, SipMethod};
use crate::protocols::transport::{response_destination, SipTransport, TransportKind};
use crate::Result;

/// RFC 3261 timer values
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);
/// Timer B/F/H: 64*T1
pub const TIMER_B: Duration = Duration::from_secs(32);
/// How long a completed transaction absorbs stragglers
pub const TIMER_D: Duration = Duration::from_secs(32);

/// Events the transaction layer hands to the transaction user
#[derive(Debug)]
pub enum TransactionEvent {
    /// A new request needing TU processing (retransmissions are absorbed)
    Request {
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
        server_key: String,
    },
    /// A response matched to (or passed through for) the TU
    Response {
        message: SipMessage,
        source: SocketAddr,
    },
    /// A client transaction gave up waiting
    Timeout {
        branch: String,
        method: SipMethod,
    },
}

/// Matching key: branch plus method, CANCEL distinct from its INVITE
fn transaction_key(branch: &str, method: SipMethod) -> String {
    // ACK matches the INVITE transaction it acknowledges
    let method = match method {
        SipMethod::Ack => SipMethod::Invite,
        other => other,
    };
    format!("{}:{}", branch, method.as_str())
}

struct ClientTransaction {
    method: SipMethod,
    stop_tx: watch::Sender<bool>,
}

struct ServerTransaction {
    last_response: Option<SipMessage>,
    dest: SocketAddr,
    transport: TransportKind,
    method: SipMethod,
    ack_tx: watch::Sender<bool>,
}

/// Client and server transaction tables over one transport
pub struct TransactionLayer {
    transport: Arc<SipTransport>,
    client: Arc<DashMap<String, ClientTransaction>>,
    server: Arc<DashMap<String, ServerTransaction>>,
    event_tx: mpsc::UnboundedSender<TransactionEvent>,
}

impl TransactionLayer {
    pub fn new(
        transport: Arc<SipTransport>,
        event_tx: mpsc::UnboundedSender<TransactionEvent>,
    ) -> Self {
        Self {
            transport,
            client: Arc::new(DashMap::new()),
            server: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    /// Send a request inside a new client transaction. The branch must
    /// already be on the top Via.
    pub async fn send_request(
        &self,
        request: SipMessage,
        dest: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        let branch = request
            .top_via_branch()
            .unwrap_or_else(|| "missing".to_string());
        let method = request.method.unwrap_or(SipMethod::Options);
        let key = transaction_key(&branch, method);

        // ACK is fire-and-forget, never a transaction of its own
        if method == SipMethod::Ack {
            return self.transport.send(&request, dest, transport).await;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.client.insert(
            key.clone(),
            ClientTransaction {
                method,
                stop_tx,
            },
        );

        self.transport.send(&request, dest, transport).await?;

        // Retransmission only matters on unreliable transports
        if transport == TransportKind::Udp {
            let transport_handle = Arc::clone(&self.transport);
            let client = Arc::clone(&self.client);
            let event_tx = self.event_tx.clone();
            let branch_clone = branch.clone();

            tokio::spawn(async move {
                Self::client_retransmit_loop(
                    transport_handle,
                    client,
                    event_tx,
                    request,
                    dest,
                    key,
                    branch_clone,
                    method,
                    stop_rx,
                )
                .await;
            });
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn client_retransmit_loop(
        transport: Arc<SipTransport>,
        client: Arc<DashMap<String, ClientTransaction>>,
        event_tx: mpsc::UnboundedSender<TransactionEvent>,
        request: SipMessage,
        dest: SocketAddr,
        key: String,
        branch: String,
        method: SipMethod,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut interval = T1;
        let mut elapsed = Duration::ZERO;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => {
                    trace!("Client transaction {} stopped", key);
                    return;
                }
            }

            elapsed += interval;
            if elapsed >= TIMER_B {
                warn!("Client transaction {} timed out", key);
                client.remove(&key);
                let _ = event_tx.send(TransactionEvent::Timeout { branch, method });
                return;
            }

            trace!("Retransmitting {} to {} (interval {:?})", method, dest, interval);
            if let Err(e) = transport.send(&request, dest, TransportKind::Udp).await {
                debug!("Retransmission failed: {}", e);
            }

            interval *= 2;
            // Non-INVITE retransmissions cap at T2
            if method != SipMethod::Invite && interval > T2 {
                interval = T2;
            }
        }
    }

    /// Route an incoming response. Stops retransmission of the matched
    /// request. Unmatched 2xx INVITE responses (retransmissions after the
    /// transaction completed) still go up to the dialog layer for ACK.
    pub fn on_response(&self, message: SipMessage, source: SocketAddr) {
        let branch = message.top_via_branch().unwrap_or_default();
        let method = message
            .cseq()
            .map(|(_, m)| m)
            .unwrap_or(SipMethod::Options);
        let key = transaction_key(&branch, method);

        let is_final = message.status.map(|s| s >= 200).unwrap_or(false);

        if let Some(entry) = self.client.get(&key) {
            // Stop retransmitting; provisional responses also do this for
            // INVITE (Timer A stops at the first 1xx)
            let _ = entry.stop_tx.send(true);
            drop(entry);
            if is_final {
                self.client.remove(&key);
            }
            let _ = self.event_tx.send(TransactionEvent::Response { message, source });
        } else if method == SipMethod::Invite && message.status.map(|s| (200..300).contains(&s)).unwrap_or(false) {
            // 2xx retransmission after transaction completion
            let _ = self.event_tx.send(TransactionEvent::Response { message, source });
        } else {
            trace!("Dropping response with no matching transaction: {}", key);
        }
    }

    /// Route an incoming request. Retransmissions are absorbed here by
    /// replaying the last response; fresh requests are handed up.
    pub async fn on_request(
        &self,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    ) {
        let branch = message.top_via_branch().unwrap_or_default();
        let method = match message.method {
            Some(m) => m,
            None => return,
        };
        let key = transaction_key(&branch, method);

        if method == SipMethod::Ack {
            if let Some(entry) = self.server.get(&key) {
                // ACK for a non-2xx final: absorb and stop retransmitting
                let _ = entry.ack_tx.send(true);
                drop(entry);
                trace!("ACK absorbed by server transaction {}", key);
                return;
            }
            // ACK for a 2xx travels in its own right, up to the dialog
            let _ = self.event_tx.send(TransactionEvent::Request {
                message,
                source,
                transport,
                server_key: key,
            });
            return;
        }

        if let Some(entry) = self.server.get(&key) {
            if let Some(response) = &entry.last_response {
                trace!("Absorbing retransmission of {} from {}", method, source);
                let _ = self
                    .transport
                    .send(response, entry.dest, entry.transport)
                    .await;
            }
            return;
        }

        let (ack_tx, _) = watch::channel(false);
        // Responses travel the NAT path recorded on the top Via
        let dest = response_destination(&message, source);
        self.server.insert(
            key.clone(),
            ServerTransaction {
                last_response: None,
                dest,
                transport,
                method,
                ack_tx,
            },
        );

        let _ = self.event_tx.send(TransactionEvent::Request {
            message,
            source,
            transport,
            server_key: key,
        });
    }

    /// Send a response inside a server transaction. Final responses to
    /// INVITE keep retransmitting on T1 doubling until the ACK lands.
    pub async fn respond(&self, server_key: &str, response: SipMessage) -> Result<()> {
        let (dest, transport, method, ack_rx) = match self.server.get_mut(server_key) {
            Some(mut entry) => {
                entry.last_response = Some(response.clone());
                (
                    entry.dest,
                    entry.transport,
                    entry.method,
                    entry.ack_tx.subscribe(),
                )
            }
            None => {
                // Stateless fallback
                warn!("Response outside any server transaction: {}", server_key);
                return Ok(());
            }
        };

        self.transport.send(&response, dest, transport).await?;

        let is_final = response.status.map(|s| s >= 200).unwrap_or(false);
        if !is_final {
            return Ok(());
        }

        // Completed: absorb stragglers for Timer D, then forget
        let server = Arc::clone(&self.server);
        let key_cleanup = server_key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(TIMER_D).await;
            server.remove(&key_cleanup);
        });

        // INVITE finals retransmit until ACKed (Timer G/H). This covers
        // 2xx as well: the B2BUA keeps the 200 flowing until the caller
        // acknowledges.
        if method == SipMethod::Invite && transport == TransportKind::Udp {
            let transport_handle = Arc::clone(&self.transport);
            let mut ack_rx = ack_rx;
            tokio::spawn(async move {
                let mut interval = T1;
                let mut elapsed = Duration::ZERO;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = ack_rx.changed() => return,
                    }
                    elapsed += interval;
                    if elapsed >= TIMER_B {
                        debug!("Gave up waiting for ACK to {}", response.status.unwrap_or(0));
                        return;
                    }
                    let _ = transport_handle.send(&response, dest, TransportKind::Udp).await;
                    interval = (interval * 2).min(T2);
                }
            });
        }

        Ok(())
    }

    /// Note an ACK observed at the dialog layer (2xx case), stopping the
    /// 200 retransmission for that INVITE transaction.
    pub fn ack_received(&self, invite_branch: &str) {
        let key = transaction_key(invite_branch, SipMethod::Invite);
        if let Some(entry) = self.server.get(&key) {
            let _ = entry.ack_tx.send(true);
        }
    }

    pub fn client_count(&self) -> usize {
        self.client.len()
    }

    pub fn server_count(&self) -> usize {
        self.server.len()
    }
}
