//! B2BUA call manager
//!
//! Every call terminates one SIP dialog toward the caller and originates
//! another toward each callee candidate, with the media relay in between.
//! 100 Trying goes out before any dialplan work so the caller's INVITE
//! stops retransmitting. Signaling for a call funnels through the service
//! event loop, so per-call state changes are serial; failures are confined
//! to the call they happen in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{B2buaConfig, DialAction, IvrConfig, MediaConfig, SipConfig, VoicemailConfig};
use crate::media::g711::G711Variant;
use crate::protocols::auth::{
    verify_credentials, DigestAlgorithm, DigestChallenge, DigestCredentials, NonceStore,
};
use crate::protocols::dialog::{Dialog, DialogState};
use crate::protocols::sdp::{
    build_answer, build_offer, Direction, NegotiatedMedia, SessionDescription,
};
use crate::protocols::sip::{
    generate_branch, generate_call_id, generate_tag, reason_phrase, uri_host_port, uri_user,
    NameAddr, SipMessage, SipMethod,
};
use crate::protocols::transaction::{TransactionEvent, TransactionLayer};
use crate::protocols::transport::{resolve_host, TransportKind};
use crate::services::cdr::{CallDetailRecord, CdrService, Disposition, QualitySummary};
use crate::services::dialplan::Dialplan;
use crate::services::dtmf::{parse_info_digit, DtmfRouter, DtmfSource};
use crate::services::extensions::ExtensionStore;
use crate::services::ivr::{AttendantOutcome, IvrExecutor};
use crate::services::mailbox::MailboxStore;
use crate::services::media_relay::{MediaRelay, PortPool, RelayEvent, RelayLeg};
use crate::services::registrar::Registrar;
use crate::{Error, Result};

/// Call lifecycle, caller's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Init,
    Calling,
    Ringing,
    Answered,
    Active,
    Terminating,
    Terminated,
}

/// Which side of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLeg {
    A,
    B,
}

/// One outbound candidate (hunt/group fork)
struct Fork {
    target: String,
    branch: String,
    sip_call_id: String,
    invite: SipMessage,
    dest: SocketAddr,
    transport: TransportKind,
}

/// Confirmed remote leg
struct RemoteLeg {
    dialog: Dialog,
    dest: SocketAddr,
    transport: TransportKind,
    /// The INVITE branch that created the leg
    invite_branch: String,
}

/// What the call terminates on
enum Termination {
    /// Bridged to another phone
    Bridge,
    /// Local IVR service
    Ivr(IvrKind),
}

#[derive(Debug, Clone, PartialEq)]
enum IvrKind {
    VoicemailAccess { mailbox: String },
    LeaveMessage { mailbox: String },
    Attendant { menu: String },
}

struct CallRecord {
    id: String,
    state: CallState,
    caller: String,
    caller_display: Option<String>,
    callee: String,
    /// UAS dialog toward the caller
    leg_a: Option<Dialog>,
    /// Originated calls have a UAC dialog on the A side instead
    uac_leg_a: Option<RemoteLeg>,
    leg_a_source: SocketAddr,
    leg_a_transport: TransportKind,
    /// Server transaction key of the caller's INVITE
    leg_a_server_key: String,
    /// The caller's INVITE, for late responses (487 on timeout/cancel)
    leg_a_invite: SipMessage,
    leg_b: Option<RemoteLeg>,
    forks: Vec<Fork>,
    /// Hunt targets not yet tried
    hunt_queue: Vec<String>,
    relay: Arc<MediaRelay>,
    media: Option<NegotiatedMedia>,
    /// Set when the caller sent an offerless INVITE
    late_offer: bool,
    termination: Termination,
    /// Consumer side is held by the active IVR; INFO and relay digits
    /// are pushed through here
    dtmf: Option<Arc<Mutex<DtmfRouter>>>,
    ivr_running: bool,
    recording_path: Option<String>,
    created_at: Instant,
    started_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ring_deadline: Option<Instant>,
}

/// Call lifecycle events for observers
#[derive(Debug, Clone)]
pub enum CallEvent {
    Started {
        call_id: String,
        caller: String,
        callee: String,
    },
    Ringing {
        call_id: String,
    },
    Answered {
        call_id: String,
    },
    TransferRequested {
        call_id: String,
        target: String,
    },
    Ended {
        call_id: String,
        disposition: Disposition,
        duration: Option<Duration>,
    },
}

/// Snapshot handed to inspectors
#[derive(Debug, Clone)]
pub struct Call {
    pub id: String,
    pub state: CallState,
    pub caller: String,
    pub callee: String,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

pub struct B2buaService {
    config: B2buaConfig,
    sip_config: SipConfig,
    media_config: MediaConfig,
    voicemail_config: VoicemailConfig,
    ivr_config: IvrConfig,
    rtp_config: crate::config::RtpConfig,
    transactions: Arc<TransactionLayer>,
    registrar: Arc<Registrar>,
    dialplan: Arc<Dialplan>,
    extensions: Arc<dyn ExtensionStore>,
    mailboxes: Arc<MailboxStore>,
    port_pool: Arc<PortPool>,
    cdr: Arc<CdrService>,
    nonces: Arc<NonceStore>,
    calls: Arc<DashMap<String, CallRecord>>,
    /// SIP Call-ID (any leg) -> internal call id
    call_index: Arc<DashMap<String, String>>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
}

impl B2buaService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: B2buaConfig,
        sip_config: SipConfig,
        media_config: MediaConfig,
        voicemail_config: VoicemailConfig,
        ivr_config: IvrConfig,
        rtp_config: crate::config::RtpConfig,
        transactions: Arc<TransactionLayer>,
        registrar: Arc<Registrar>,
        dialplan: Arc<Dialplan>,
        extensions: Arc<dyn ExtensionStore>,
        mailboxes: Arc<MailboxStore>,
        cdr: Arc<CdrService>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let port_pool = Arc::new(PortPool::new(
            &rtp_config.port_range,
            Duration::from_secs(u64::from(rtp_config.port_cooldown)),
        ));

        Self {
            config,
            sip_config,
            media_config,
            voicemail_config,
            ivr_config,
            rtp_config,
            transactions,
            registrar,
            dialplan,
            extensions,
            mailboxes,
            port_pool,
            cdr,
            nonces: Arc::new(NonceStore::new(300)),
            calls: Arc::new(DashMap::new()),
            call_index: Arc::new(DashMap::new()),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.event_rx.lock().expect("event receiver lock").take()
    }

    /// Start the ring/call timeout sweeper
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                service.sweep().await;
            }
        });
        info!("B2BUA call manager started");
    }

    /// Entry point for everything the transaction layer hands up
    pub async fn process(self: &Arc<Self>, event: TransactionEvent) {
        match event {
            TransactionEvent::Request {
                message,
                source,
                transport,
                server_key,
            } => {
                let method = message.method.unwrap_or(SipMethod::Options);
                let result = match method {
                    SipMethod::Invite => {
                        self.handle_invite(message, source, transport, server_key).await
                    }
                    SipMethod::Ack => self.handle_ack(message).await,
                    SipMethod::Bye => self.handle_bye(message, server_key).await,
                    SipMethod::Cancel => self.handle_cancel(message, server_key).await,
                    SipMethod::Info => self.handle_info(message, server_key).await,
                    SipMethod::Refer => self.handle_refer(message, server_key).await,
                    SipMethod::Options | SipMethod::Update => {
                        self.registrar.note_keepalive(source);
                        let response = SipMessage::response_to(&message, 200, "OK");
                        self.transactions.respond(&server_key, response).await
                    }
                    SipMethod::Register | SipMethod::Notify => {
                        // REGISTER is routed to the registrar upstream;
                        // NOTIFY outside a REFER we just acknowledge
                        let response = SipMessage::response_to(&message, 200, "OK");
                        self.transactions.respond(&server_key, response).await
                    }
                };
                if let Err(e) = result {
                    warn!("Request handling failed: {}", e);
                }
            }
            TransactionEvent::Response { message, source } => {
                if let Err(e) = self.handle_response(message, source).await {
                    warn!("Response handling failed: {}", e);
                }
            }
            TransactionEvent::Timeout { branch, method } => {
                self.handle_client_timeout(&branch, method).await;
            }
        }
    }

    // -- INVITE -----------------------------------------------------------

    async fn handle_invite(
        self: &Arc<Self>,
        invite: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
        server_key: String,
    ) -> Result<()> {
        // Stop the retransmission clock first, then think
        let trying = SipMessage::response_to(&invite, 100, "Trying");
        self.transactions.respond(&server_key, trying).await?;

        // In-dialog re-INVITE: hold/resume
        if invite.to_tag().is_some() {
            return self.handle_reinvite(invite, server_key).await;
        }

        if self.calls.len() >= self.config.max_concurrent_calls as usize {
            warn!("Concurrent call limit reached, rejecting INVITE");
            return self.respond_final(&invite, &server_key, 503, None).await;
        }

        let caller = match invite.from_header().and_then(|f| f.user().map(String::from)) {
            Some(user) => user,
            None => return self.respond_final(&invite, &server_key, 400, None).await,
        };
        let dialed = match invite.uri.as_deref().and_then(uri_user) {
            Some(user) => user.to_string(),
            None => return self.respond_final(&invite, &server_key, 484, None).await,
        };

        // Digest gate on the caller
        let caller_record = self.extensions.get(&caller).await.ok();
        if self.config.authenticate_invites {
            if caller_record.is_none() {
                return self.respond_final(&invite, &server_key, 403, None).await;
            }
            let password = caller_record
                .as_ref()
                .map(|r| r.sip_password.clone())
                .unwrap_or_default();
            if !self.invite_authorized(&invite, &password) {
                let challenge = DigestChallenge {
                    realm: self.sip_config.domain.clone(),
                    nonce: self.nonces.issue(),
                    algorithm: DigestAlgorithm::Sha256,
                    qop: true,
                };
                let mut response =
                    SipMessage::response_to(&invite, 407, "Proxy Authentication Required");
                response.add_header("Proxy-Authenticate", challenge.header_value());
                return self.transactions.respond(&server_key, response).await;
            }
        }

        // Offer, when the caller sent one now
        let offer = if invite.body.is_empty() {
            None
        } else {
            match SessionDescription::parse(&String::from_utf8_lossy(&invite.body)) {
                Ok(sdp) => Some(sdp),
                Err(e) => {
                    debug!("Malformed SDP offer: {}", e);
                    return self.respond_final(&invite, &server_key, 400, None).await;
                }
            }
        };

        let decision = match self.dialplan.route(&dialed) {
            Some(decision) => decision,
            None => return self.respond_final(&invite, &server_key, 404, None).await,
        };

        // Dialog state before media, so a malformed INVITE cannot leak a
        // running relay
        let leg_a_dialog = match Dialog::new_uas(&invite) {
            Ok(dialog) => dialog,
            Err(_) => return self.respond_final(&invite, &server_key, 400, None).await,
        };

        // Media negotiation and relay allocation before any answer
        let negotiated = match &offer {
            Some(offer_sdp) => match build_answer(
                offer_sdp,
                self.sip_config.external_address,
                9, // placeholder, rebuilt with the real port at answer time
                &self.media_config.codec_preference,
            ) {
                Ok((_, negotiated)) => Some(negotiated),
                Err(_) => return self.respond_final(&invite, &server_key, 488, None).await,
            },
            None => None,
        };
        let codec = negotiated
            .as_ref()
            .map(|n| n.codec)
            .or_else(|| self.default_codec());
        let codec = match codec {
            Some(codec) => codec,
            None => return self.respond_final(&invite, &server_key, 488, None).await,
        };

        let relay = match MediaRelay::spawn(
            Uuid::new_v4().to_string(),
            self.sip_config.external_address,
            Arc::clone(&self.port_pool),
            &self.rtp_config,
            codec,
            negotiated.as_ref().and_then(|n| n.dtmf_payload_type),
        )
        .await
        {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                error!("Relay allocation failed: {}", e);
                return self.respond_final(&invite, &server_key, 503, None).await;
            }
        };

        let call_id = Uuid::new_v4().to_string();
        let caller_display = caller_record.as_ref().map(|r| r.display_name.clone());
        let mut record = CallRecord {
            id: call_id.clone(),
            state: CallState::Calling,
            caller: caller.clone(),
            caller_display,
            callee: decision.number.clone(),
            leg_a: Some(leg_a_dialog),
            uac_leg_a: None,
            leg_a_source: source,
            leg_a_transport: transport,
            leg_a_server_key: server_key.clone(),
            leg_a_invite: invite.clone(),
            leg_b: None,
            forks: Vec::new(),
            hunt_queue: Vec::new(),
            relay: Arc::clone(&relay),
            media: negotiated,
            late_offer: offer.is_none(),
            termination: Termination::Bridge,
            dtmf: None,
            ivr_running: false,
            recording_path: None,
            created_at: Instant::now(),
            started_at: Utc::now(),
            answered_at: None,
            ring_deadline: Some(
                Instant::now() + Duration::from_secs(u64::from(self.config.ring_timeout)),
            ),
        };

        // Endpoint A from the offer; symmetric learning fixes NAT lies
        if let Some(offer_sdp) = &offer {
            if let Some(endpoint) = offer_sdp.audio_endpoint() {
                let _ = relay.set_endpoints(Some(endpoint), None).await;
            }
        }

        let sip_call_id = invite.call_id().unwrap_or_default().to_string();
        self.call_index.insert(sip_call_id, call_id.clone());

        let _ = self.event_tx.send(CallEvent::Started {
            call_id: call_id.clone(),
            caller: caller.clone(),
            callee: decision.number.clone(),
        });

        let result = match decision.action {
            DialAction::Reject { status } => {
                self.calls.insert(call_id.clone(), record);
                self.end_call_with_status(&call_id, status).await
            }
            DialAction::Extension { target } => {
                self.calls.insert(call_id.clone(), record);
                self.fork_to_targets(&call_id, vec![target]).await
            }
            DialAction::Group { targets } => {
                self.calls.insert(call_id.clone(), record);
                self.fork_to_targets(&call_id, targets).await
            }
            DialAction::Hunt { targets } => {
                record.hunt_queue = targets;
                self.calls.insert(call_id.clone(), record);
                self.advance_hunt(&call_id).await
            }
            DialAction::Voicemail { mailbox } => {
                record.termination = Termination::Ivr(IvrKind::VoicemailAccess { mailbox });
                record.ring_deadline = None;
                self.calls.insert(call_id.clone(), record);
                self.answer_leg_a(&call_id).await
            }
            DialAction::Ivr { menu } => {
                record.termination = Termination::Ivr(IvrKind::Attendant { menu });
                record.ring_deadline = None;
                self.calls.insert(call_id.clone(), record);
                self.answer_leg_a(&call_id).await
            }
        };

        // Every call gets its relay event pump (DTMF up, failure down)
        self.spawn_relay_pump(&call_id, relay);

        result
    }

    fn invite_authorized(&self, invite: &SipMessage, password: &str) -> bool {
        let header = invite
            .header("Proxy-Authorization")
            .or_else(|| invite.header("Authorization"));
        match header.and_then(|h| DigestCredentials::parse(h).ok()) {
            Some(credentials) => {
                verify_credentials(&credentials, "INVITE", password, &self.nonces)
            }
            None => false,
        }
    }

    fn default_codec(&self) -> Option<G711Variant> {
        self.media_config
            .codec_preference
            .first()
            .and_then(|name| match name.to_ascii_uppercase().as_str() {
                "PCMU" => Some(G711Variant::MuLaw),
                "PCMA" => Some(G711Variant::ALaw),
                _ => None,
            })
    }

    // -- outbound forks ----------------------------------------------------

    /// Launch INVITEs toward every live binding of the targets (parallel
    /// ring, first answer wins)
    async fn fork_to_targets(self: &Arc<Self>, call_id: &str, targets: Vec<String>) -> Result<()> {
        let mut launched = 0;
        let mut offline_mailbox: Option<String> = None;

        for target in &targets {
            let bindings = self.registrar.lookup(target);
            if bindings.is_empty() {
                if let Ok(record) = self.extensions.get(target).await {
                    offline_mailbox = record.mailbox_id;
                }
                continue;
            }
            for binding in bindings {
                match self
                    .launch_fork(call_id, target, binding.target, binding.transport)
                    .await
                {
                    Ok(()) => launched += 1,
                    Err(e) => warn!("Fork to {} failed: {}", target, e),
                }
            }
        }

        if launched == 0 {
            // Nobody reachable: voicemail when the callee has a mailbox
            if let Some(mailbox) = offline_mailbox {
                return self.divert_to_voicemail(call_id, mailbox).await;
            }
            return self.end_call_with_status(call_id, 480).await;
        }

        Ok(())
    }

    /// Ring the next hunt target; 480 when the list is exhausted
    async fn advance_hunt(self: &Arc<Self>, call_id: &str) -> Result<()> {
        loop {
            let next = match self.calls.get_mut(call_id) {
                Some(mut call) => {
                    if call.hunt_queue.is_empty() {
                        None
                    } else {
                        let next = call.hunt_queue.remove(0);
                        call.callee = next.clone();
                        call.ring_deadline = Some(
                            Instant::now()
                                + Duration::from_secs(u64::from(self.config.ring_timeout)),
                        );
                        Some(next)
                    }
                }
                None => return Ok(()),
            };

            let Some(target) = next else {
                // List exhausted; fall back like an unreachable extension
                let mailbox = {
                    let callee = self
                        .calls
                        .get(call_id)
                        .map(|c| c.callee.clone())
                        .unwrap_or_default();
                    self.extensions
                        .get(&callee)
                        .await
                        .ok()
                        .and_then(|r| r.mailbox_id)
                };
                return match mailbox {
                    Some(mailbox) => self.divert_to_voicemail(call_id, mailbox).await,
                    None => self.end_call_with_status(call_id, 480).await,
                };
            };

            if let Some(binding) = self.registrar.lookup(&target).into_iter().next() {
                return self
                    .launch_fork(call_id, &target, binding.target, binding.transport)
                    .await;
            }
            // Unregistered target: try the next one
            debug!("Hunt target {} has no bindings, skipping", target);
        }
    }

    async fn launch_fork(
        self: &Arc<Self>,
        call_id: &str,
        target: &str,
        dest: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        let (relay_port, caller, caller_display) = {
            let call = self
                .calls
                .get(call_id)
                .ok_or_else(|| Error::b2bua("Call vanished during fork"))?;
            (
                call.relay.rtp_port,
                call.caller.clone(),
                call.caller_display.clone(),
            )
        };

        let branch = generate_branch();
        let sip_call_id = generate_call_id(&self.sip_config.domain);
        let offer = build_offer(
            self.sip_config.external_address,
            relay_port,
            &self.media_config.codec_preference,
            self.media_config.dtmf_payload_type,
        );

        let mut invite =
            SipMessage::new_request(SipMethod::Invite, format!("sip:{}@{}", target, dest));
        invite.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                transport.as_str(),
                self.sip_config.external_address,
                self.sip_config.listen_port,
                branch
            ),
        );
        invite.add_header("Max-Forwards", "70");

        let mut from = NameAddr::new(&format!("sip:{}@{}", caller, self.sip_config.domain));
        from.display_name = caller_display;
        from.set_param("tag", &generate_tag());
        invite.add_header("From", from.to_string());
        invite.add_header("To", format!("<sip:{}@{}>", target, self.sip_config.domain));
        invite.add_header("Call-ID", sip_call_id.clone());
        invite.add_header("CSeq", "1 INVITE");
        invite.add_header(
            "Contact",
            format!(
                "<sip:{}@{}:{}>",
                caller, self.sip_config.external_address, self.sip_config.listen_port
            ),
        );
        invite.add_header("User-Agent", self.sip_config.user_agent.clone());
        invite.set_body("application/sdp", Bytes::from(offer.build()));

        self.call_index.insert(sip_call_id.clone(), call_id.to_string());
        if let Some(mut call) = self.calls.get_mut(call_id) {
            call.forks.push(Fork {
                target: target.to_string(),
                branch: branch.clone(),
                sip_call_id,
                invite: invite.clone(),
                dest,
                transport,
            });
        }

        debug!("Call {}: forking INVITE to {} at {}", call_id, target, dest);
        self.transactions.send_request(invite, dest, transport).await
    }

    // -- responses from leg B ----------------------------------------------

    async fn handle_response(
        self: &Arc<Self>,
        message: SipMessage,
        _source: SocketAddr,
    ) -> Result<()> {
        let sip_call_id = message.call_id().unwrap_or_default().to_string();
        let call_id = match self.call_index.get(&sip_call_id) {
            Some(id) => id.clone(),
            None => {
                debug!("Response for unknown Call-ID {}", sip_call_id);
                return Ok(());
            }
        };

        let status = message.status.unwrap_or(0);
        let (_, cseq_method) = message.cseq().unwrap_or((0, SipMethod::Options));

        match cseq_method {
            SipMethod::Invite => self.handle_invite_response(&call_id, message, status).await,
            SipMethod::Bye | SipMethod::Cancel => {
                debug!("Call {}: {} answered with {}", call_id, cseq_method, status);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_invite_response(
        self: &Arc<Self>,
        call_id: &str,
        message: SipMessage,
        status: u16,
    ) -> Result<()> {
        match status {
            100..=199 => {
                if status >= 180 {
                    let forward = {
                        let mut call = match self.calls.get_mut(call_id) {
                            Some(call) => call,
                            None => return Ok(()),
                        };
                        if call.state == CallState::Calling {
                            call.state = CallState::Ringing;
                            let _ = self.event_tx.send(CallEvent::Ringing {
                                call_id: call_id.to_string(),
                            });
                        }
                        call.state == CallState::Ringing
                    };
                    if forward {
                        self.forward_provisional(call_id, status).await?;
                    }
                }
                Ok(())
            }
            200..=299 => self.handle_fork_answered(call_id, message).await,
            _ => {
                let branch = message.top_via_branch().unwrap_or_default();
                self.handle_fork_failed(call_id, &branch, status).await
            }
        }
    }

    async fn forward_provisional(&self, call_id: &str, status: u16) -> Result<()> {
        let (server_key, invite, local_tag) = match self.calls.get(call_id) {
            Some(call) => (
                call.leg_a_server_key.clone(),
                call.leg_a_invite.clone(),
                call.leg_a.as_ref().map(|d| d.local_tag.clone()),
            ),
            None => return Ok(()),
        };
        let mut response = SipMessage::response_to(&invite, status, reason_phrase(status));
        if let Some(tag) = local_tag {
            add_to_tag(&mut response, &tag);
        }
        self.transactions.respond(&server_key, response).await
    }

    /// First 2xx wins: ACK it, cancel the losers, answer leg A
    async fn handle_fork_answered(
        self: &Arc<Self>,
        call_id: &str,
        message: SipMessage,
    ) -> Result<()> {
        let branch = message.top_via_branch().unwrap_or_default();

        let answer_sdp = if message.body.is_empty() {
            None
        } else {
            SessionDescription::parse(&String::from_utf8_lossy(&message.body)).ok()
        };

        enum Outcome {
            Winner(Fork, Vec<Fork>),
            Retransmission,
            Stray,
        }

        let outcome = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return self.ack_and_bye_stray(&message).await,
            };

            if let Some(leg) = &call.leg_b {
                if leg.invite_branch == branch {
                    Outcome::Retransmission
                } else {
                    Outcome::Stray
                }
            } else {
                match call.forks.iter().position(|f| f.branch == branch) {
                    Some(index) => {
                        let winner = call.forks.swap_remove(index);
                        let losers: Vec<Fork> = call.forks.drain(..).collect();
                        Outcome::Winner(winner, losers)
                    }
                    None => Outcome::Stray,
                }
            }
        };

        let (winner, losers) = match outcome {
            Outcome::Winner(winner, losers) => (winner, losers),
            Outcome::Retransmission => return self.ack_200(call_id, &message).await,
            Outcome::Stray => return self.ack_and_bye_stray(&message).await,
        };

        info!("Call {}: {} answered", call_id, winner.target);
        let dialog = Dialog::new_uac(&winner.invite, &message)?;

        // An originated call has no UAS side: the first answer becomes the
        // A leg and the real destination is dialed next
        let originate_a_side = self
            .calls
            .get(call_id)
            .map(|c| c.leg_a.is_none() && c.uac_leg_a.is_none())
            .unwrap_or(false);
        if originate_a_side {
            if let Some(answer) = &answer_sdp {
                if let Some(endpoint) = answer.audio_endpoint() {
                    let relay = self.calls.get(call_id).map(|c| Arc::clone(&c.relay));
                    if let Some(relay) = relay {
                        let _ = relay.set_endpoints(Some(endpoint), None).await;
                    }
                }
            }
            {
                let mut call = match self.calls.get_mut(call_id) {
                    Some(call) => call,
                    None => return Ok(()),
                };
                call.uac_leg_a = Some(RemoteLeg {
                    dialog,
                    dest: winner.dest,
                    transport: winner.transport,
                    invite_branch: winner.branch.clone(),
                });
                call.answered_at = Some(Utc::now());
            }
            self.ack_originate_a(call_id, &message).await?;
            return self.advance_hunt(call_id).await;
        }

        // Point the relay at B's media address
        if let Some(answer) = &answer_sdp {
            if let Some(endpoint) = answer.audio_endpoint() {
                let relay = self.calls.get(call_id).map(|c| Arc::clone(&c.relay));
                if let Some(relay) = relay {
                    let _ = relay.set_endpoints(None, Some(endpoint)).await;
                }
            }
        }

        {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            call.leg_b = Some(RemoteLeg {
                dialog,
                dest: winner.dest,
                transport: winner.transport,
                invite_branch: winner.branch.clone(),
            });
            call.state = CallState::Answered;
            call.answered_at = Some(Utc::now());
            call.ring_deadline = None;
            call.hunt_queue.clear();
        }

        self.ack_200(call_id, &message).await?;

        for loser in losers {
            self.cancel_fork(&loser).await;
        }

        // Originated calls have no caller INVITE waiting for a 200
        let has_uas_leg = self
            .calls
            .get(call_id)
            .map(|c| c.leg_a.is_some())
            .unwrap_or(false);
        if has_uas_leg {
            self.answer_leg_a(call_id).await?;
        }

        let _ = self.event_tx.send(CallEvent::Answered {
            call_id: call_id.to_string(),
        });
        Ok(())
    }

    /// ACK the A-side 200 of an originated call
    async fn ack_originate_a(&self, call_id: &str, response: &SipMessage) -> Result<()> {
        let built = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            match call.uac_leg_a.as_mut() {
                Some(leg) => {
                    if let Some(contact) = response.contact() {
                        leg.dialog.remote_target = contact.uri;
                    }
                    Some((leg.dialog.create_request(SipMethod::Ack), leg.dest, leg.transport))
                }
                None => None,
            }
        };
        let Some((mut ack, dest, transport)) = built else {
            return Ok(());
        };
        ack.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                transport.as_str(),
                self.sip_config.external_address,
                self.sip_config.listen_port,
                generate_branch()
            ),
        );
        self.transactions.send_request(ack, dest, transport).await
    }

    /// ACK a 2xx on leg B through the dialog route
    async fn ack_200(&self, call_id: &str, response: &SipMessage) -> Result<()> {
        let (mut ack, dest, transport) = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            let Some(leg_b) = call.leg_b.as_mut() else {
                return Ok(());
            };
            // Contact in a retransmitted 200 may have moved
            if let Some(contact) = response.contact() {
                leg_b.dialog.remote_target = contact.uri;
            }
            (
                leg_b.dialog.create_request(SipMethod::Ack),
                leg_b.dest,
                leg_b.transport,
            )
        };
        ack.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                transport.as_str(),
                self.sip_config.external_address,
                self.sip_config.listen_port,
                generate_branch()
            ),
        );
        self.transactions.send_request(ack, dest, transport).await
    }

    /// ACK and immediately BYE a 2xx that lost the race
    async fn ack_and_bye_stray(&self, message: &SipMessage) -> Result<()> {
        let call_id = message.call_id().unwrap_or_default().to_string();
        let to = message.to_header().map(|t| t.to_string()).unwrap_or_default();
        let from = message.from_header().map(|f| f.to_string()).unwrap_or_default();
        let contact = match message.contact() {
            Some(contact) => contact.uri,
            None => return Ok(()),
        };
        let Some((host, port)) = uri_host_port(&contact) else {
            return Ok(());
        };
        let dest = resolve_host(&host, port).await?;
        let (cseq, _) = message.cseq().unwrap_or((1, SipMethod::Invite));

        for (method, seq) in [(SipMethod::Ack, cseq), (SipMethod::Bye, cseq + 1)] {
            let mut request = SipMessage::new_request(method, contact.clone());
            request.add_header(
                "Via",
                format!(
                    "SIP/2.0/UDP {}:{};branch={}",
                    self.sip_config.external_address,
                    self.sip_config.listen_port,
                    generate_branch()
                ),
            );
            request.add_header("Max-Forwards", "70");
            request.add_header("From", from.clone());
            request.add_header("To", to.clone());
            request.add_header("Call-ID", call_id.clone());
            request.add_header("CSeq", format!("{} {}", seq, method.as_str()));
            self.transactions
                .send_request(request, dest, TransportKind::Udp)
                .await?;
        }
        Ok(())
    }

    async fn cancel_fork(&self, fork: &Fork) {
        let mut cancel = SipMessage::new_request(
            SipMethod::Cancel,
            fork.invite.uri.clone().unwrap_or_default(),
        );
        // CANCEL copies the INVITE's Via (same branch), From, To, Call-ID
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = fork.invite.header(name) {
                cancel.add_header(name, value.to_string());
            }
        }
        if let Some((seq, _)) = fork.invite.cseq() {
            cancel.add_header("CSeq", format!("{} CANCEL", seq));
        }
        debug!("Cancelling fork to {}", fork.target);
        if let Err(e) = self
            .transactions
            .send_request(cancel, fork.dest, fork.transport)
            .await
        {
            warn!("CANCEL to {} failed: {}", fork.target, e);
        }
        self.call_index.remove(&fork.sip_call_id);
    }

    async fn handle_fork_failed(
        self: &Arc<Self>,
        call_id: &str,
        branch: &str,
        status: u16,
    ) -> Result<()> {
        let (remaining, hunting) = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            if let Some(index) = call.forks.iter().position(|f| f.branch == branch) {
                let fork = call.forks.swap_remove(index);
                self.call_index.remove(&fork.sip_call_id);
            }
            (call.forks.len(), !call.hunt_queue.is_empty())
        };

        if remaining > 0 {
            return Ok(()); // siblings still ringing
        }

        if hunting {
            return self.advance_hunt(call_id).await;
        }

        // Map the downstream answer for the caller
        let mapped = match status {
            486 | 600 => 486,
            603 => 603,
            408 => 480,
            _ => status,
        };
        self.end_call_with_status(call_id, mapped).await
    }

    async fn handle_client_timeout(self: &Arc<Self>, branch: &str, method: SipMethod) {
        if method != SipMethod::Invite {
            return;
        }
        let call_id = self.calls.iter().find_map(|entry| {
            entry
                .forks
                .iter()
                .any(|f| f.branch == branch)
                .then(|| entry.id.clone())
        });
        if let Some(call_id) = call_id {
            let _ = self.handle_fork_failed(&call_id, branch, 408).await;
        }
    }

    // -- answering leg A ---------------------------------------------------

    /// Send the 200 with the relay's SDP to the caller
    async fn answer_leg_a(&self, call_id: &str) -> Result<()> {
        let (server_key, invite, local_tag, relay_port, late_offer) = {
            let call = self
                .calls
                .get(call_id)
                .ok_or_else(|| Error::b2bua("Call vanished before answer"))?;
            let dialog = call
                .leg_a
                .as_ref()
                .ok_or_else(|| Error::b2bua("Leg A dialog missing"))?;
            // Transfers re-fork after the caller was already answered; the
            // media repoint is all they need
            if dialog.state == DialogState::Confirmed {
                return Ok(());
            }
            (
                call.leg_a_server_key.clone(),
                call.leg_a_invite.clone(),
                dialog.local_tag.clone(),
                call.relay.rtp_port,
                call.late_offer,
            )
        };

        let sdp = if late_offer {
            // Offerless INVITE: our offer rides the 200, answer in the ACK
            build_offer(
                self.sip_config.external_address,
                relay_port,
                &self.media_config.codec_preference,
                self.media_config.dtmf_payload_type,
            )
        } else {
            let offer = SessionDescription::parse(&String::from_utf8_lossy(&invite.body))?;
            let (answer, _) = build_answer(
                &offer,
                self.sip_config.external_address,
                relay_port,
                &self.media_config.codec_preference,
            )?;
            answer
        };

        let mut response = SipMessage::response_to(&invite, 200, "OK");
        add_to_tag(&mut response, &local_tag);
        response.add_header(
            "Contact",
            format!(
                "<sip:{}:{}>",
                self.sip_config.external_address, self.sip_config.listen_port
            ),
        );
        response.set_body("application/sdp", Bytes::from(sdp.build()));

        if let Some(mut call) = self.calls.get_mut(call_id) {
            if let Some(dialog) = call.leg_a.as_mut() {
                dialog.confirm();
            }
            if call.state != CallState::Active {
                call.state = CallState::Answered;
            }
            if call.answered_at.is_none() {
                call.answered_at = Some(Utc::now());
            }
        }

        self.transactions.respond(&server_key, response).await
    }

    // -- ACK ----------------------------------------------------------------

    async fn handle_ack(self: &Arc<Self>, ack: SipMessage) -> Result<()> {
        let sip_call_id = ack.call_id().unwrap_or_default().to_string();
        let Some(call_id) = self.call_index.get(&sip_call_id).map(|id| id.clone()) else {
            return Ok(());
        };

        let ack_sdp = if ack.body.is_empty() {
            None
        } else {
            SessionDescription::parse(&String::from_utf8_lossy(&ack.body)).ok()
        };

        let (relay, was_late_offer, invite_branch, start_ivr) = {
            let mut call = match self.calls.get_mut(&call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            if call.state == CallState::Answered {
                call.state = CallState::Active;
            }
            let start_ivr =
                matches!(call.termination, Termination::Ivr(_)) && !call.ivr_running;
            if start_ivr {
                call.ivr_running = true;
            }
            (
                Arc::clone(&call.relay),
                call.late_offer,
                call.leg_a_invite.top_via_branch().unwrap_or_default(),
                start_ivr,
            )
        };

        // Stop retransmitting the 200 toward the caller
        self.transactions.ack_received(&invite_branch);

        // Late-offer answer arrives in the ACK body
        if was_late_offer {
            if let Some(sdp) = &ack_sdp {
                if let Some(endpoint) = sdp.audio_endpoint() {
                    let _ = relay.set_endpoints(Some(endpoint), None).await;
                }
            }
        }

        if start_ivr {
            self.launch_ivr(&call_id).await?;
        }

        debug!("Call {} is active", call_id);
        Ok(())
    }

    // -- IVR termination ----------------------------------------------------

    async fn divert_to_voicemail(self: &Arc<Self>, call_id: &str, mailbox: String) -> Result<()> {
        info!("Call {}: diverting to voicemail for {}", call_id, mailbox);
        let forks: Vec<Fork> = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            call.termination = Termination::Ivr(IvrKind::LeaveMessage { mailbox });
            call.ring_deadline = None;
            call.hunt_queue.clear();
            call.forks.drain(..).collect()
        };
        for fork in &forks {
            self.cancel_fork(fork).await;
        }
        self.answer_leg_a(call_id).await
        // The IVR starts when the ACK lands
    }

    /// Wire a DTMF router to the call and run the IVR to completion
    async fn launch_ivr(self: &Arc<Self>, call_id: &str) -> Result<()> {
        let (relay, kind, caller) = {
            let call = match self.calls.get(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            let kind = match &call.termination {
                Termination::Ivr(kind) => kind.clone(),
                Termination::Bridge => return Ok(()),
            };
            (Arc::clone(&call.relay), kind, call.caller.clone())
        };

        let (router, digit_rx) = DtmfRouter::new(self.media_config.dtmf.dedup_window_ms);
        let router = Arc::new(Mutex::new(router));
        if let Some(mut call) = self.calls.get_mut(call_id) {
            call.dtmf = Some(Arc::clone(&router));
        }

        // In-band detection complements 2833 and INFO
        let _ = relay.detect_inband(RelayLeg::A).await;

        let service = Arc::clone(self);
        let call_id_owned = call_id.to_string();
        let prompt_dir = std::path::PathBuf::from(&self.media_config.prompt_dir);
        let digit_timeout = Duration::from_secs(u64::from(self.ivr_config.digit_timeout));
        let voicemail_config = self.voicemail_config.clone();
        let ivr_menus = self.ivr_config.menus.clone();
        let mailboxes = Arc::clone(&self.mailboxes);
        let extensions = Arc::clone(&self.extensions);
        let dedup_window = self.media_config.dtmf.dedup_window_ms;

        tokio::spawn(async move {
            let (executor, _events) = IvrExecutor::new(
                Arc::clone(&relay),
                digit_rx,
                prompt_dir.clone(),
                digit_timeout,
            );

            let result = match kind {
                IvrKind::VoicemailAccess { mailbox } => match extensions.get(&mailbox).await {
                    Ok(record) => {
                        executor
                            .run_voicemail_access(&voicemail_config, &mailboxes, &record)
                            .await
                    }
                    Err(e) => Err(e),
                },
                IvrKind::LeaveMessage { mailbox } => {
                    executor
                        .run_leave_message(&voicemail_config, &mailboxes, &mailbox, &caller)
                        .await
                }
                IvrKind::Attendant { menu } => {
                    match executor.run_attendant(&ivr_menus, &menu).await {
                        Ok(AttendantOutcome::Transfer(target)) => {
                            let _ = service.attendant_transfer(&call_id_owned, &target).await;
                            return;
                        }
                        Ok(AttendantOutcome::Voicemail(mailbox)) => {
                            // Fresh digit stream for the recording stage
                            let (router, digit_rx) = DtmfRouter::new(dedup_window);
                            if let Some(mut call) = service.calls.get_mut(&call_id_owned) {
                                call.dtmf = Some(Arc::new(Mutex::new(router)));
                            }
                            let (executor, _events) = IvrExecutor::new(
                                Arc::clone(&relay),
                                digit_rx,
                                prompt_dir,
                                digit_timeout,
                            );
                            executor
                                .run_leave_message(
                                    &voicemail_config,
                                    &mailboxes,
                                    &mailbox,
                                    &caller,
                                )
                                .await
                        }
                        Ok(AttendantOutcome::Hangup) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            };

            if let Err(e) = result {
                warn!("IVR for call {} failed: {}", call_id_owned, e);
            }

            let _ = service.hangup_call(&call_id_owned, "IVR complete").await;
        });

        Ok(())
    }

    /// Drain relay events: DTMF up into the router, failures tear the call
    /// down. Spawned once per call.
    fn spawn_relay_pump(self: &Arc<Self>, call_id: &str, relay: Arc<MediaRelay>) {
        let Some(mut events) = relay.take_event_receiver() else {
            return;
        };
        let service = Arc::clone(self);
        let call_id = call_id.to_string();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RelayEvent::Rfc2833 { digit, .. } => {
                        let router = service
                            .calls
                            .get(&call_id)
                            .and_then(|call| call.dtmf.as_ref().map(Arc::clone));
                        if let Some(router) = router {
                            router.lock().await.push(digit, DtmfSource::Rfc2833);
                        }
                    }
                    RelayEvent::InbandDigit { digit } => {
                        let router = service
                            .calls
                            .get(&call_id)
                            .and_then(|call| call.dtmf.as_ref().map(Arc::clone));
                        if let Some(router) = router {
                            router.lock().await.push(digit, DtmfSource::Inband);
                        }
                    }
                    RelayEvent::Failed { reason } => {
                        warn!("Call {} media failed: {}", call_id, reason);
                        service.send_bye_with_cause(&call_id, 41).await;
                        service.send_bye_to_b(&call_id).await;
                        service
                            .finish_call(&call_id, Disposition::Failed, "media failure")
                            .await;
                        break;
                    }
                    RelayEvent::Stopped => break,
                    _ => {}
                }
            }
        });
    }

    /// Attendant handoff: originate leg B toward the chosen extension
    async fn attendant_transfer(self: &Arc<Self>, call_id: &str, target: &str) -> Result<()> {
        let _ = self.event_tx.send(CallEvent::TransferRequested {
            call_id: call_id.to_string(),
            target: target.to_string(),
        });
        {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            call.termination = Termination::Bridge;
            call.ivr_running = false;
            call.dtmf = None;
            call.callee = target.to_string();
            call.ring_deadline = Some(
                Instant::now() + Duration::from_secs(u64::from(self.config.ring_timeout)),
            );
        }
        self.fork_to_targets(call_id, vec![target.to_string()]).await
    }

    // -- BYE / CANCEL / INFO / REFER ---------------------------------------

    async fn handle_bye(self: &Arc<Self>, bye: SipMessage, server_key: String) -> Result<()> {
        let sip_call_id = bye.call_id().unwrap_or_default().to_string();

        let response = SipMessage::response_to(&bye, 200, "OK");
        self.transactions.respond(&server_key, response).await?;

        let Some(call_id) = self.call_index.get(&sip_call_id).map(|id| id.clone()) else {
            return Ok(());
        };

        let from_leg_a = match self.calls.get(&call_id) {
            Some(call) => call
                .leg_a
                .as_ref()
                .map(|d| d.call_id == sip_call_id)
                .unwrap_or(false),
            None => return Ok(()),
        };

        if from_leg_a {
            self.send_bye_to_b(&call_id).await;
        } else {
            self.send_bye_to_a(&call_id).await;
        }

        self.finish_call(&call_id, Disposition::Answered, "BYE").await;
        Ok(())
    }

    async fn handle_cancel(self: &Arc<Self>, cancel: SipMessage, server_key: String) -> Result<()> {
        let response = SipMessage::response_to(&cancel, 200, "OK");
        self.transactions.respond(&server_key, response).await?;

        let sip_call_id = cancel.call_id().unwrap_or_default().to_string();
        let Some(call_id) = self.call_index.get(&sip_call_id).map(|id| id.clone()) else {
            return Ok(());
        };

        let cancellable = match self.calls.get(&call_id) {
            Some(call) => matches!(call.state, CallState::Calling | CallState::Ringing),
            None => false,
        };
        if !cancellable {
            return Ok(());
        }

        info!("Call {} cancelled by caller", call_id);

        // 487 ends the caller's INVITE transaction
        let (server_key_a, invite, local_tag) = match self.calls.get(&call_id) {
            Some(call) => (
                call.leg_a_server_key.clone(),
                call.leg_a_invite.clone(),
                call.leg_a.as_ref().map(|d| d.local_tag.clone()),
            ),
            None => return Ok(()),
        };
        let mut terminated = SipMessage::response_to(&invite, 487, "Request Terminated");
        if let Some(tag) = local_tag {
            add_to_tag(&mut terminated, &tag);
        }
        self.transactions.respond(&server_key_a, terminated).await?;

        let forks: Vec<Fork> = match self.calls.get_mut(&call_id) {
            Some(mut call) => {
                call.state = CallState::Terminating;
                call.forks.drain(..).collect()
            }
            None => Vec::new(),
        };
        for fork in &forks {
            self.cancel_fork(fork).await;
        }

        self.finish_call(&call_id, Disposition::Cancelled, "CANCEL").await;
        Ok(())
    }

    async fn handle_info(self: &Arc<Self>, info: SipMessage, server_key: String) -> Result<()> {
        let response = SipMessage::response_to(&info, 200, "OK");
        self.transactions.respond(&server_key, response).await?;

        let sip_call_id = info.call_id().unwrap_or_default().to_string();
        let Some(call_id) = self.call_index.get(&sip_call_id).map(|id| id.clone()) else {
            return Ok(());
        };

        let digit = info
            .content_type()
            .and_then(|ct| parse_info_digit(ct, &info.body));
        if let Some(digit) = digit {
            let router = self
                .calls
                .get(&call_id)
                .and_then(|call| call.dtmf.as_ref().map(Arc::clone));
            if let Some(router) = router {
                router.lock().await.push(digit, DtmfSource::SipInfo);
            }
        }
        Ok(())
    }

    /// Blind transfer per REFER: new leg toward Refer-To, old leg B BYEd
    async fn handle_refer(self: &Arc<Self>, refer: SipMessage, server_key: String) -> Result<()> {
        let sip_call_id = refer.call_id().unwrap_or_default().to_string();
        let Some(call_id) = self.call_index.get(&sip_call_id).map(|id| id.clone()) else {
            let response =
                SipMessage::response_to(&refer, 481, "Call/Transaction Does Not Exist");
            return self.transactions.respond(&server_key, response).await;
        };

        let refer_to = refer
            .header("Refer-To")
            .and_then(NameAddr::parse)
            .map(|a| a.uri);
        let target = refer_to.as_deref().and_then(uri_user).map(String::from);
        let Some(target) = target else {
            let response = SipMessage::response_to(&refer, 400, "Bad Request");
            return self.transactions.respond(&server_key, response).await;
        };

        let response = SipMessage::response_to(&refer, 202, "Accepted");
        self.transactions.respond(&server_key, response).await?;

        info!("Call {}: blind transfer to {}", call_id, target);
        let _ = self.event_tx.send(CallEvent::TransferRequested {
            call_id: call_id.clone(),
            target: target.clone(),
        });

        // The old remote leg goes away; the replacement's answer repoints
        // the relay's B endpoint
        self.send_bye_to_b(&call_id).await;
        {
            let mut call = match self.calls.get_mut(&call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            call.leg_b = None;
            call.callee = target.clone();
            call.state = CallState::Calling;
            call.ring_deadline = Some(
                Instant::now() + Duration::from_secs(u64::from(self.config.ring_timeout)),
            );
        }
        self.fork_to_targets(&call_id, vec![target]).await?;

        // The transferor learns the outcome via NOTIFY
        self.notify_refer_outcome(&call_id).await;
        Ok(())
    }

    async fn notify_refer_outcome(&self, call_id: &str) {
        let built = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return,
            };
            let source = call.leg_a_source;
            let transport = call.leg_a_transport;
            call.leg_a
                .as_mut()
                .map(|dialog| (dialog.create_request(SipMethod::Notify), source, transport))
        };
        let Some((mut notify, dest, transport)) = built else {
            return;
        };

        notify.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                transport.as_str(),
                self.sip_config.external_address,
                self.sip_config.listen_port,
                generate_branch()
            ),
        );
        notify.add_header("Event", "refer");
        notify.add_header("Subscription-State", "terminated;reason=noresource");
        notify.set_body("message/sipfrag", Bytes::from_static(b"SIP/2.0 200 OK\r\n"));
        if let Err(e) = self.transactions.send_request(notify, dest, transport).await {
            debug!("REFER NOTIFY failed: {}", e);
        }
    }

    // -- re-INVITE (hold/resume) -------------------------------------------

    async fn handle_reinvite(self: &Arc<Self>, invite: SipMessage, server_key: String) -> Result<()> {
        let sip_call_id = invite.call_id().unwrap_or_default().to_string();
        let Some(call_id) = self.call_index.get(&sip_call_id).map(|id| id.clone()) else {
            let response =
                SipMessage::response_to(&invite, 481, "Call/Transaction Does Not Exist");
            return self.transactions.respond(&server_key, response).await;
        };

        let offer = match SessionDescription::parse(&String::from_utf8_lossy(&invite.body)) {
            Ok(sdp) => sdp,
            Err(_) => {
                let response = SipMessage::response_to(&invite, 488, "Not Acceptable Here");
                return self.transactions.respond(&server_key, response).await;
            }
        };

        let hold =
            offer.audio_direction() == Direction::SendOnly || offer.audio_endpoint().is_none();

        let (relay, relay_port, local_tag, from_leg_a) = {
            let call = match self.calls.get(&call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            let from_leg_a = call
                .leg_a
                .as_ref()
                .map(|d| d.call_id == sip_call_id)
                .unwrap_or(false);
            let tag = call
                .leg_a
                .as_ref()
                .map(|d| d.local_tag.clone())
                .unwrap_or_default();
            (Arc::clone(&call.relay), call.relay.rtp_port, tag, from_leg_a)
        };

        // Hold mutes the direction toward the holder
        if from_leg_a {
            let _ = relay.set_forwarding(!hold, true).await;
        } else {
            let _ = relay.set_forwarding(true, !hold).await;
        }
        info!(
            "Call {}: {} by {}",
            call_id,
            if hold { "hold" } else { "resume" },
            if from_leg_a { "caller" } else { "callee" }
        );

        // Fresh endpoint on resume
        if !hold {
            if let Some(endpoint) = offer.audio_endpoint() {
                if from_leg_a {
                    let _ = relay.set_endpoints(Some(endpoint), None).await;
                } else {
                    let _ = relay.set_endpoints(None, Some(endpoint)).await;
                }
            }
        }

        let (answer, _) = build_answer(
            &offer,
            self.sip_config.external_address,
            relay_port,
            &self.media_config.codec_preference,
        )?;
        let mut response = SipMessage::response_to(&invite, 200, "OK");
        add_to_tag(&mut response, &local_tag);
        response.set_body("application/sdp", Bytes::from(answer.build()));
        self.transactions.respond(&server_key, response).await
    }

    // -- termination ---------------------------------------------------------

    async fn send_bye_to_b(&self, call_id: &str) {
        let built = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return,
            };
            call.leg_b
                .as_mut()
                .map(|leg| (leg.dialog.create_request(SipMethod::Bye), leg.dest, leg.transport))
        };
        if let Some((mut bye, dest, transport)) = built {
            bye.add_header(
                "Via",
                format!(
                    "SIP/2.0/{} {}:{};branch={}",
                    transport.as_str(),
                    self.sip_config.external_address,
                    self.sip_config.listen_port,
                    generate_branch()
                ),
            );
            if let Err(e) = self.transactions.send_request(bye, dest, transport).await {
                debug!("BYE to leg B failed: {}", e);
            }
        }
    }

    async fn send_bye_to_a(&self, call_id: &str) {
        self.send_bye_to_a_inner(call_id, None).await;
    }

    /// BYE with a Q.850 cause, for transport-dead peers
    async fn send_bye_with_cause(&self, call_id: &str, cause: u16) {
        self.send_bye_to_a_inner(call_id, Some(cause)).await;
    }

    async fn send_bye_to_a_inner(&self, call_id: &str, cause: Option<u16>) {
        let built = {
            let mut call = match self.calls.get_mut(call_id) {
                Some(call) => call,
                None => return,
            };
            let source = call.leg_a_source;
            let transport = call.leg_a_transport;
            match call.leg_a.as_mut() {
                Some(dialog) if dialog.state == DialogState::Confirmed => {
                    let mut request = dialog.create_request(SipMethod::Bye);
                    if let Some(cause) = cause {
                        request.add_header("Reason", format!("Q.850;cause={}", cause));
                    }
                    Some((request, source, transport))
                }
                _ => call.uac_leg_a.as_mut().map(|leg| {
                    let mut request = leg.dialog.create_request(SipMethod::Bye);
                    if let Some(cause) = cause {
                        request.add_header("Reason", format!("Q.850;cause={}", cause));
                    }
                    (request, leg.dest, leg.transport)
                }),
            }
        };
        if let Some((mut bye, dest, transport)) = built {
            bye.add_header(
                "Via",
                format!(
                    "SIP/2.0/{} {}:{};branch={}",
                    transport.as_str(),
                    self.sip_config.external_address,
                    self.sip_config.listen_port,
                    generate_branch()
                ),
            );
            if let Err(e) = self.transactions.send_request(bye, dest, transport).await {
                debug!("BYE to leg A failed: {}", e);
            }
        }
    }

    /// Final non-2xx straight to the INVITE's server transaction
    async fn respond_final(
        &self,
        invite: &SipMessage,
        server_key: &str,
        status: u16,
        tag: Option<&str>,
    ) -> Result<()> {
        let mut response = SipMessage::response_to(invite, status, reason_phrase(status));
        match tag {
            Some(tag) => add_to_tag(&mut response, tag),
            None => add_to_tag(&mut response, &generate_tag()),
        }
        self.transactions.respond(server_key, response).await
    }

    /// Negative final answer to the caller, then bookkeeping
    async fn end_call_with_status(self: &Arc<Self>, call_id: &str, status: u16) -> Result<()> {
        let (server_key, invite, local_tag, answered) = {
            let call = match self.calls.get(call_id) {
                Some(call) => call,
                None => return Ok(()),
            };
            (
                call.leg_a_server_key.clone(),
                call.leg_a_invite.clone(),
                call.leg_a.as_ref().map(|d| d.local_tag.clone()),
                call.answered_at.is_some(),
            )
        };

        // Once the caller's INVITE got a 200 the only way out is a BYE
        if answered {
            self.send_bye_to_a(call_id).await;
            self.send_bye_to_b(call_id).await;
            self.finish_call(call_id, Disposition::Failed, &status.to_string()).await;
            return Ok(());
        }

        self.respond_final(&invite, &server_key, status, local_tag.as_deref())
            .await?;

        let disposition = match status {
            486 | 600 => Disposition::Busy,
            480 | 408 => Disposition::NoAnswer,
            487 => Disposition::Cancelled,
            _ => Disposition::Failed,
        };
        self.finish_call(call_id, disposition, &status.to_string()).await;
        Ok(())
    }

    /// Administrative hangup (IVR completion, shutdown, API)
    pub async fn hangup_call(self: &Arc<Self>, call_id: &str, reason: &str) -> Result<()> {
        if !self.calls.contains_key(call_id) {
            return Err(Error::b2bua("Call not found"));
        }
        self.send_bye_to_a(call_id).await;
        self.send_bye_to_b(call_id).await;
        self.finish_call(call_id, Disposition::Answered, reason).await;
        Ok(())
    }

    /// Tear down state, stop media, write the CDR
    async fn finish_call(&self, call_id: &str, disposition: Disposition, cause: &str) {
        let Some((_, mut call)) = self.calls.remove(call_id) else {
            return;
        };
        call.state = CallState::Terminated;

        self.call_index.retain(|_, mapped| mapped.as_str() != call_id);

        call.relay.stop().await;
        let stats = call.relay.stats();

        let answered = call.answered_at.is_some();
        let disposition = if !answered && disposition == Disposition::Answered {
            Disposition::Failed
        } else {
            disposition
        };

        let duration = call
            .answered_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);

        self.cdr.submit(CallDetailRecord {
            call_id: call.id.clone(),
            caller: call.caller.clone(),
            callee: call.callee.clone(),
            caller_display: call.caller_display.clone(),
            disposition,
            started_at: call.started_at,
            answered_at: call.answered_at,
            ended_at: Utc::now(),
            duration_secs: duration,
            hangup_cause: cause.to_string(),
            codec: call.media.as_ref().map(|m| m.codec.encoding_name().to_string()),
            quality_a: QualitySummary {
                packets: stats.from_a.packets,
                lost: stats.from_a.lost,
                jitter_ms: stats.from_a.jitter_ms,
                mos: stats.mos(RelayLeg::A),
            },
            quality_b: QualitySummary {
                packets: stats.from_b.packets,
                lost: stats.from_b.lost,
                jitter_ms: stats.from_b.jitter_ms,
                mos: stats.mos(RelayLeg::B),
            },
            recording_path: call.recording_path.clone(),
        });

        let _ = self.event_tx.send(CallEvent::Ended {
            call_id: call_id.to_string(),
            disposition,
            duration: answered.then(|| Duration::from_secs(duration)),
        });

        info!(
            "Call {} finished: {} ({}s, {})",
            call_id, disposition, duration, cause
        );
    }

    /// Periodic ring-timeout and max-duration enforcement
    async fn sweep(self: &Arc<Self>) {
        let now = Instant::now();
        let call_limit = Duration::from_secs(u64::from(self.config.call_timeout));

        let ring_expired: Vec<String> = self
            .calls
            .iter()
            .filter(|call| {
                call.ring_deadline
                    .map(|deadline| now >= deadline)
                    .unwrap_or(false)
            })
            .map(|call| call.id.clone())
            .collect();

        for call_id in ring_expired {
            info!("Call {}: ring timeout", call_id);
            let (forks, hunting, callee) = match self.calls.get_mut(&call_id) {
                Some(mut call) => {
                    call.ring_deadline = None;
                    (
                        call.forks.drain(..).collect::<Vec<Fork>>(),
                        !call.hunt_queue.is_empty(),
                        call.callee.clone(),
                    )
                }
                None => continue,
            };
            for fork in &forks {
                self.cancel_fork(fork).await;
            }

            if hunting {
                let _ = self.advance_hunt(&call_id).await;
                continue;
            }

            // No answer: voicemail when available, 480 otherwise
            let mailbox = self
                .extensions
                .get(&callee)
                .await
                .ok()
                .and_then(|record| record.mailbox_id);
            match mailbox {
                Some(mailbox) => {
                    let _ = self.divert_to_voicemail(&call_id, mailbox).await;
                }
                None => {
                    let _ = self.end_call_with_status(&call_id, 480).await;
                }
            }
        }

        // Hard duration cap
        let overrun: Vec<String> = self
            .calls
            .iter()
            .filter(|call| now.duration_since(call.created_at) > call_limit)
            .map(|call| call.id.clone())
            .collect();
        for call_id in overrun {
            warn!("Call {} exceeded the duration limit", call_id);
            self.send_bye_with_cause(&call_id, 41).await;
            self.send_bye_to_b(&call_id).await;
            self.finish_call(&call_id, Disposition::Answered, "duration limit").await;
        }
    }

    // -- public inspection / origination -------------------------------------

    pub fn active_calls(&self) -> Vec<Call> {
        self.calls
            .iter()
            .map(|call| Call {
                id: call.id.clone(),
                state: call.state,
                caller: call.caller.clone(),
                callee: call.callee.clone(),
                started_at: call.started_at,
                answered_at: call.answered_at,
            })
            .collect()
    }

    pub fn get_call(&self, call_id: &str) -> Option<Call> {
        self.calls.get(call_id).map(|call| Call {
            id: call.id.clone(),
            state: call.state,
            caller: call.caller.clone(),
            callee: call.callee.clone(),
            started_at: call.started_at,
            answered_at: call.answered_at,
        })
    }

    /// Media inspector: QoS per direction for a live call
    pub fn call_qos(&self, call_id: &str) -> Option<(QualitySummary, QualitySummary)> {
        let call = self.calls.get(call_id)?;
        let stats = call.relay.stats();
        Some((
            QualitySummary {
                packets: stats.from_a.packets,
                lost: stats.from_a.lost,
                jitter_ms: stats.from_a.jitter_ms,
                mos: stats.mos(RelayLeg::A),
            },
            QualitySummary {
                packets: stats.from_b.packets,
                lost: stats.from_b.lost,
                jitter_ms: stats.from_b.jitter_ms,
                mos: stats.mos(RelayLeg::B),
            },
        ))
    }

    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    /// Start recording a live call to `recordings/<yyyy-mm-dd>/<id>.wav`
    pub async fn start_recording(&self, call_id: &str) -> Result<String> {
        let relay = self
            .calls
            .get(call_id)
            .map(|call| Arc::clone(&call.relay))
            .ok_or_else(|| Error::b2bua("Call not found"))?;

        let day_dir = std::path::Path::new(&self.media_config.recording_dir)
            .join(Utc::now().format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&day_dir)?;
        let path = day_dir.join(format!("{}.wav", call_id));

        relay.record_to(path.clone(), RelayLeg::A).await?;

        let rendered = path.to_string_lossy().to_string();
        if let Some(mut call) = self.calls.get_mut(call_id) {
            call.recording_path = Some(rendered.clone());
        }
        info!("Call {}: recording to {}", call_id, rendered);
        Ok(rendered)
    }

    /// Stop and flush a call recording
    pub async fn stop_recording(&self, call_id: &str) -> Result<()> {
        let relay = self
            .calls
            .get(call_id)
            .map(|call| Arc::clone(&call.relay))
            .ok_or_else(|| Error::b2bua("Call not found"))?;
        relay.stop_recording().await
    }

    /// Call originator: dial `from_aor` first, bridge to `to_aor` on answer
    pub async fn originate(self: &Arc<Self>, from_aor: &str, to_aor: &str) -> Result<String> {
        let bindings = self.registrar.lookup(from_aor);
        let binding = bindings
            .into_iter()
            .next()
            .ok_or_else(|| Error::b2bua(format!("{} is not registered", from_aor)))?;

        let codec = self
            .default_codec()
            .ok_or_else(|| Error::b2bua("No usable codec configured"))?;
        let relay = Arc::new(
            MediaRelay::spawn(
                Uuid::new_v4().to_string(),
                self.sip_config.external_address,
                Arc::clone(&self.port_pool),
                &self.rtp_config,
                codec,
                Some(self.media_config.dtmf_payload_type),
            )
            .await?,
        );

        let call_id = Uuid::new_v4().to_string();
        // The originate leg is tracked as a fork; its 200 makes it leg B
        // and the B2BUA then rings the real destination
        let record = CallRecord {
            id: call_id.clone(),
            state: CallState::Calling,
            caller: from_aor.to_string(),
            caller_display: None,
            callee: to_aor.to_string(),
            leg_a: None,
            uac_leg_a: None,
            leg_a_source: binding.target,
            leg_a_transport: binding.transport,
            leg_a_server_key: String::new(),
            leg_a_invite: SipMessage::new_request(SipMethod::Invite, "sip:originate"),
            leg_b: None,
            forks: Vec::new(),
            hunt_queue: vec![to_aor.to_string()],
            relay: Arc::clone(&relay),
            media: None,
            late_offer: false,
            termination: Termination::Bridge,
            dtmf: None,
            ivr_running: false,
            recording_path: None,
            created_at: Instant::now(),
            started_at: Utc::now(),
            answered_at: None,
            ring_deadline: Some(
                Instant::now() + Duration::from_secs(u64::from(self.config.ring_timeout)),
            ),
        };
        self.calls.insert(call_id.clone(), record);
        self.spawn_relay_pump(&call_id, relay);

        self.launch_fork(&call_id, from_aor, binding.target, binding.transport)
            .await?;

        let _ = self.event_tx.send(CallEvent::Started {
            call_id: call_id.clone(),
            caller: from_aor.to_string(),
            callee: to_aor.to_string(),
        });

        Ok(call_id)
    }

    /// Stop every call; used at shutdown
    pub async fn stop(self: &Arc<Self>) {
        let call_ids: Vec<String> = self.calls.iter().map(|c| c.id.clone()).collect();
        for call_id in call_ids {
            let _ = self.hangup_call(&call_id, "shutdown").await;
        }
        info!("B2BUA stopped");
    }
}

fn add_to_tag(response: &mut SipMessage, tag: &str) {
    if let Some(to) = response.to_header() {
        if to.param("tag").is_none() {
            let mut tagged = to;
            tagged.set_param("tag", tag);
            response.set_header("To", tagged.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DialplanConfig, DialplanRule, MatchType, PbxConfig, PortRange};
    use crate::protocols::auth::StoredSecret;
    use crate::protocols::transport::SipTransport;
    use crate::services::cdr::MemoryCdrSink;
    use crate::services::extensions::{ExtensionRecord, InMemoryExtensionStore};
    use std::collections::HashSet;
    use tokio::net::UdpSocket;

    struct Fixture {
        service: Arc<B2buaService>,
        _tx_events: mpsc::UnboundedReceiver<TransactionEvent>,
        cdr_sink: Arc<MemoryCdrSink>,
        registrar: Arc<Registrar>,
    }

    async fn fixture() -> Fixture {
        let mut config = PbxConfig::default_config();
        config.sip.listen_port = 0;
        config.sip.enable_tcp = false;
        config.rtp.port_range = PortRange { min: 23000, max: 23200 };
        config.b2bua.authenticate_invites = false;
        config.dialplan = DialplanConfig {
            rules: vec![
                DialplanRule {
                    id: "extensions".to_string(),
                    pattern: "^1[0-9]{3}$".to_string(),
                    match_type: MatchType::Regex,
                    action: DialAction::Extension { target: String::new() },
                    priority: 10,
                    translation: None,
                },
                DialplanRule {
                    id: "group".to_string(),
                    pattern: "8001".to_string(),
                    match_type: MatchType::Exact,
                    action: DialAction::Group {
                        targets: vec!["1003".to_string(), "1004".to_string()],
                    },
                    priority: 5,
                    translation: None,
                },
                DialplanRule {
                    id: "blocked".to_string(),
                    pattern: "0900".to_string(),
                    match_type: MatchType::Prefix,
                    action: DialAction::Reject { status: 403 },
                    priority: 5,
                    translation: None,
                },
            ],
            ring_timeout: 25,
        };

        let transport = Arc::new(SipTransport::bind(config.sip.clone()).await.unwrap());
        let (tx_event_tx, tx_events) = mpsc::unbounded_channel();
        let transactions = Arc::new(TransactionLayer::new(transport, tx_event_tx));

        let store = Arc::new(InMemoryExtensionStore::new());
        for number in ["1001", "1002", "1003", "1004"] {
            store
                .insert(ExtensionRecord {
                    number: number.to_string(),
                    display_name: format!("Ext {}", number),
                    sip_password: "secret".to_string(),
                    pin_hash: Some(StoredSecret::derive_with("1234", &[1; 4], 1000)),
                    permissions: HashSet::new(),
                    allow_external: false,
                    mailbox_id: None,
                })
                .unwrap();
        }

        let registrar = Arc::new(Registrar::new(
            config.registrar.clone(),
            Arc::clone(&store) as Arc<dyn ExtensionStore>,
        ));
        let dialplan = Arc::new(Dialplan::compile(&config.dialplan).unwrap());
        let cdr_sink = Arc::new(MemoryCdrSink::new());
        let cdr = Arc::new(CdrService::start(
            Arc::clone(&cdr_sink) as Arc<dyn crate::services::cdr::CdrSink>,
            64,
        ));
        let mailbox_dir = tempfile::tempdir().unwrap();
        let mailboxes = Arc::new(MailboxStore::new(mailbox_dir.path()));
        std::mem::forget(mailbox_dir);

        let service = Arc::new(B2buaService::new(
            config.b2bua.clone(),
            config.sip.clone(),
            config.media.clone(),
            config.voicemail.clone(),
            config.ivr.clone(),
            config.rtp.clone(),
            transactions,
            Arc::clone(&registrar),
            dialplan,
            Arc::clone(&store) as Arc<dyn ExtensionStore>,
            mailboxes,
            cdr,
        ));

        Fixture {
            service,
            _tx_events: tx_events,
            cdr_sink,
            registrar,
        }
    }

    /// Register a phone socket directly into the registrar's table by
    /// driving a challenge/response REGISTER exchange
    async fn register_phone(registrar: &Registrar, aor: &str, addr: SocketAddr) {
        use crate::protocols::auth::{compute_response, DigestAlgorithm};

        let make_request = |auth: Option<String>| {
            let mut msg = SipMessage::new_request(SipMethod::Register, "sip:redfire-pbx.local");
            msg.add_header("Via", "SIP/2.0/UDP test;branch=z9hG4bKreg");
            msg.add_header("From", format!("<sip:{}@redfire-pbx.local>;tag=r", aor));
            msg.add_header("To", format!("<sip:{}@redfire-pbx.local>", aor));
            msg.add_header("Call-ID", format!("reg-{}@test", aor));
            msg.add_header("CSeq", "1 REGISTER");
            msg.add_header("Contact", format!("<sip:{}@{}>", aor, addr));
            msg.add_header("Expires", "300");
            if let Some(auth) = auth {
                msg.add_header("Authorization", auth);
            }
            msg
        };

        let challenge = registrar
            .process_register(&make_request(None), addr, TransportKind::Udp)
            .await
            .response();
        let www = challenge.header("WWW-Authenticate").unwrap();
        let nonce = www
            .split("nonce=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .to_string();
        let digest = compute_response(
            DigestAlgorithm::Sha256,
            aor,
            "redfire-pbx.local",
            "secret",
            "REGISTER",
            "sip:redfire-pbx.local",
            &nonce,
            Some(1),
            Some("cn"),
            Some("auth"),
        );
        let auth = format!(
            "Digest username=\"{}\", realm=\"redfire-pbx.local\", nonce=\"{}\", \
             uri=\"sip:redfire-pbx.local\", response=\"{}\", algorithm=SHA-256, \
             cnonce=\"cn\", nc=00000001, qop=auth",
            aor, nonce, digest
        );
        let outcome = registrar
            .process_register(&make_request(Some(auth)), addr, TransportKind::Udp)
            .await;
        assert!(matches!(
            outcome,
            crate::services::registrar::RegisterOutcome::Ok(_)
        ));
    }

    fn invite_from(caller: &str, dialed: &str, caller_addr: SocketAddr, sdp: Option<&str>) -> SipMessage {
        let mut invite = SipMessage::new_request(
            SipMethod::Invite,
            format!("sip:{}@redfire-pbx.local", dialed),
        );
        invite.add_header(
            "Via",
            format!("SIP/2.0/UDP {};branch={}", caller_addr, generate_branch()),
        );
        invite.add_header("Max-Forwards", "70");
        invite.add_header("From", format!("<sip:{}@redfire-pbx.local>;tag=caller", caller));
        invite.add_header("To", format!("<sip:{}@redfire-pbx.local>", dialed));
        invite.add_header("Call-ID", format!("{}@{}", Uuid::new_v4(), caller_addr.ip()));
        invite.add_header("CSeq", "1 INVITE");
        invite.add_header("Contact", format!("<sip:{}@{}>", caller, caller_addr));
        if let Some(sdp) = sdp {
            invite.set_body("application/sdp", Bytes::from(sdp.to_string()));
        }
        invite
    }

    fn caller_sdp(addr: &str, port: u16) -> String {
        format!(
            "v=0\r\no=- 1 1 IN IP4 {addr}\r\ns=-\r\nc=IN IP4 {addr}\r\nt=0 0\r\n\
             m=audio {port} RTP/AVP 0 101\r\n\
             a=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\n",
        )
    }

    async fn drive(fixture: &mut Fixture, message: SipMessage, source: SocketAddr) {
        let server_key = format!(
            "{}:{}",
            message.top_via_branch().unwrap_or_default(),
            message.method.map(|m| m.as_str()).unwrap_or("?")
        );
        fixture
            .service
            .process(TransactionEvent::Request {
                message,
                source,
                transport: TransportKind::Udp,
                server_key,
            })
            .await;
    }

    #[tokio::test]
    async fn test_reject_rule_ends_call() {
        let mut fixture = fixture().await;
        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        let invite = invite_from("1001", "0900555", caller, Some(&sdp));

        drive(&mut fixture, invite, caller).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fixture.service.active_call_count(), 0);
        let records = fixture.cdr_sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, Disposition::Failed);
        assert_eq!(records[0].hangup_cause, "403");
    }

    #[tokio::test]
    async fn test_unknown_number_does_not_create_call() {
        let mut fixture = fixture().await;
        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        let invite = invite_from("1001", "99999", caller, Some(&sdp));

        drive(&mut fixture, invite, caller).await;
        assert_eq!(fixture.service.active_call_count(), 0);
    }

    #[tokio::test]
    async fn test_call_forks_to_registered_binding() {
        let mut fixture = fixture().await;

        // A real socket for the callee so the INVITE lands somewhere
        let callee_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let callee_addr = callee_socket.local_addr().unwrap();
        register_phone(&fixture.registrar, "1002", callee_addr).await;

        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        let invite = invite_from("1001", "1002", caller, Some(&sdp));

        drive(&mut fixture, invite, caller).await;

        // The callee's phone receives the outbound INVITE with our SDP
        let mut buf = [0u8; 4096];
        let (len, _) =
            tokio::time::timeout(Duration::from_secs(2), callee_socket.recv_from(&mut buf))
                .await
                .expect("INVITE should reach the callee")
                .unwrap();
        let outbound = SipMessage::parse(&buf[..len]).unwrap();
        assert_eq!(outbound.method, Some(SipMethod::Invite));
        assert!(outbound.header("From").unwrap().contains("Ext 1001"));
        let sdp_body = String::from_utf8_lossy(&outbound.body).to_string();
        assert!(sdp_body.contains("PCMU"));
        assert!(sdp_body.contains("telephone-event"));

        assert_eq!(fixture.service.active_call_count(), 1);
        let call = fixture.service.active_calls().pop().unwrap();
        assert_eq!(call.caller, "1001");
        assert_eq!(call.callee, "1002");
        assert_eq!(call.state, CallState::Calling);
    }

    #[tokio::test]
    async fn test_group_rings_all_members() {
        let mut fixture = fixture().await;

        let member_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let member_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        register_phone(&fixture.registrar, "1003", member_a.local_addr().unwrap()).await;
        register_phone(&fixture.registrar, "1004", member_b.local_addr().unwrap()).await;

        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        drive(&mut fixture, invite_from("1001", "8001", caller, Some(&sdp)), caller).await;

        let mut buf = [0u8; 4096];
        for socket in [&member_a, &member_b] {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("both members should ring")
                .unwrap();
            let invite = SipMessage::parse(&buf[..len]).unwrap();
            assert_eq!(invite.method, Some(SipMethod::Invite));
        }
    }

    #[tokio::test]
    async fn test_answer_bridges_and_bye_finishes() {
        let mut fixture = fixture().await;

        let callee_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let callee_addr = callee_socket.local_addr().unwrap();
        register_phone(&fixture.registrar, "1002", callee_addr).await;

        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        drive(&mut fixture, invite_from("1001", "1002", caller, Some(&sdp)), caller).await;

        // Read the outbound INVITE at the callee
        let mut buf = [0u8; 4096];
        let (len, _) =
            tokio::time::timeout(Duration::from_secs(2), callee_socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        let outbound = SipMessage::parse(&buf[..len]).unwrap();

        // Phone answers with its own SDP
        let mut ok = SipMessage::response_to(&outbound, 200, "OK");
        let to = ok.to_header().unwrap();
        let mut tagged = to;
        tagged.set_param("tag", "callee-tag");
        ok.set_header("To", tagged.to_string());
        ok.add_header("Contact", format!("<sip:1002@{}>", callee_addr));
        ok.set_body(
            "application/sdp",
            Bytes::from(caller_sdp(&callee_addr.ip().to_string(), 41000)),
        );

        fixture
            .service
            .process(TransactionEvent::Response {
                message: ok,
                source: callee_addr,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let call = fixture.service.active_calls().pop().expect("call should exist");
        assert_eq!(call.state, CallState::Answered);

        // Caller hangs up: BYE inside leg A's dialog
        let call_qos = fixture.service.call_qos(&call.id);
        assert!(call_qos.is_some());

        let sip_call_id = {
            // Recover the caller-side SIP Call-ID from the index
            fixture
                .service
                .call_index
                .iter()
                .find(|e| e.value() == &call.id && e.key().contains("192.168.1.10"))
                .map(|e| e.key().clone())
                .unwrap()
        };
        let mut bye = SipMessage::new_request(SipMethod::Bye, "sip:pbx");
        bye.add_header("Via", format!("SIP/2.0/UDP {};branch={}", caller, generate_branch()));
        bye.add_header("From", "<sip:1001@redfire-pbx.local>;tag=caller");
        bye.add_header("To", "<sip:1002@redfire-pbx.local>;tag=x");
        bye.add_header("Call-ID", sip_call_id);
        bye.add_header("CSeq", "2 BYE");
        drive(&mut fixture, bye, caller).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fixture.service.active_call_count(), 0);

        let records = fixture.cdr_sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, Disposition::Answered);
        assert_eq!(records[0].caller, "1001");
        assert_eq!(records[0].codec.as_deref(), Some("PCMU"));
    }

    #[tokio::test]
    async fn test_cancel_before_answer() {
        let mut fixture = fixture().await;

        let callee_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        register_phone(&fixture.registrar, "1002", callee_socket.local_addr().unwrap()).await;

        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        let invite = invite_from("1001", "1002", caller, Some(&sdp));
        let invite_call_id = invite.call_id().unwrap().to_string();
        let invite_branch = invite.top_via_branch().unwrap();
        drive(&mut fixture, invite.clone(), caller).await;
        assert_eq!(fixture.service.active_call_count(), 1);

        // Caller thinks better of it
        let mut cancel = SipMessage::new_request(SipMethod::Cancel, invite.uri.clone().unwrap());
        cancel.add_header("Via", format!("SIP/2.0/UDP {};branch={}", caller, invite_branch));
        cancel.add_header("From", invite.header("From").unwrap().to_string());
        cancel.add_header("To", invite.header("To").unwrap().to_string());
        cancel.add_header("Call-ID", invite_call_id);
        cancel.add_header("CSeq", "1 CANCEL");
        drive(&mut fixture, cancel, caller).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fixture.service.active_call_count(), 0);

        let records = fixture.cdr_sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, Disposition::Cancelled);

        // The ringing phone received INVITE and then CANCEL
        let mut buf = [0u8; 4096];
        let mut methods = Vec::new();
        for _ in 0..2 {
            if let Ok(Ok((len, _))) = tokio::time::timeout(
                Duration::from_secs(1),
                callee_socket.recv_from(&mut buf),
            )
            .await
            {
                if let Ok(msg) = SipMessage::parse(&buf[..len]) {
                    methods.push(msg.method);
                }
            }
        }
        assert!(methods.contains(&Some(SipMethod::Cancel)));
    }

    #[tokio::test]
    async fn test_busy_maps_to_486() {
        let mut fixture = fixture().await;

        let callee_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let callee_addr = callee_socket.local_addr().unwrap();
        register_phone(&fixture.registrar, "1002", callee_addr).await;

        let caller: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let sdp = caller_sdp("192.168.1.10", 40000);
        drive(&mut fixture, invite_from("1001", "1002", caller, Some(&sdp)), caller).await;

        let mut buf = [0u8; 4096];
        let (len, _) =
            tokio::time::timeout(Duration::from_secs(2), callee_socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        let outbound = SipMessage::parse(&buf[..len]).unwrap();

        let mut busy = SipMessage::response_to(&outbound, 486, "Busy Here");
        let to = busy.to_header().unwrap();
        let mut tagged = to;
        tagged.set_param("tag", "busy-tag");
        busy.set_header("To", tagged.to_string());

        fixture
            .service
            .process(TransactionEvent::Response {
                message: busy,
                source: callee_addr,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fixture.service.active_call_count(), 0);
        let records = fixture.cdr_sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, Disposition::Busy);
    }
}
