//! Main PBX orchestrator
//!
//! Owns the transport, transaction layer, registrar, dialplan, CDR writer
//! and the B2BUA, and wires their event streams together. REGISTER goes to
//! the registrar; everything else in-dialog or dialplan-bound goes to the
//! B2BUA.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::PbxConfig;
use crate::protocols::sip::{generate_branch, generate_call_id, SipMessage, SipMethod};
use crate::protocols::transaction::{TransactionEvent, TransactionLayer};
use crate::protocols::transport::{SipTransport, TransportEvent, TransportKind};
use crate::services::cdr::{CdrService, FileCdrSink};
use crate::services::dialplan::Dialplan;
use crate::services::extensions::{ExtensionStore, InMemoryExtensionStore};
use crate::services::mailbox::MailboxStore;
use crate::services::registrar::{Registrar, RegistrarEvent};
use crate::services::b2bua::{B2buaService, CallEvent};
use crate::services::webhooks::{self, NullWebhookEmitter, WebhookEmitter};
use crate::Result;

/// PBX status snapshot
#[derive(Debug, Clone)]
pub struct PbxStatus {
    pub running: bool,
    pub uptime: Duration,
    pub active_calls: usize,
    pub registrations: usize,
}

/// PBX events
#[derive(Debug, Clone)]
pub enum PbxEvent {
    Started,
    Stopped,
    Registered { extension: String, contact: String },
    Unregistered { extension: String },
    CallStarted { call_id: String, caller: String, callee: String },
    CallEnded { call_id: String, disposition: String },
    Error { message: String },
}

/// Main Redfire PBX implementation
pub struct RedfirePbx {
    config: PbxConfig,

    transport: Option<Arc<SipTransport>>,
    transactions: Option<Arc<TransactionLayer>>,
    registrar: Option<Arc<Registrar>>,
    b2bua: Option<Arc<B2buaService>>,
    extensions: Arc<dyn ExtensionStore>,
    webhooks: Arc<dyn WebhookEmitter>,

    event_tx: mpsc::UnboundedSender<PbxEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<PbxEvent>>,

    is_running: Arc<RwLock<bool>>,
    start_time: Option<std::time::Instant>,
}

impl RedfirePbx {
    pub fn new(config: PbxConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            transport: None,
            transactions: None,
            registrar: None,
            b2bua: None,
            extensions: Arc::new(InMemoryExtensionStore::new()),
            webhooks: Arc::new(NullWebhookEmitter),
            event_tx,
            event_rx: Some(event_rx),
            is_running: Arc::new(RwLock::new(false)),
            start_time: None,
        })
    }

    /// Swap in the production extension directory before `start()`
    pub fn with_extension_store(mut self, store: Arc<dyn ExtensionStore>) -> Self {
        self.extensions = store;
        self
    }

    /// Attach an external webhook emitter before `start()`
    pub fn with_webhook_emitter(mut self, emitter: Arc<dyn WebhookEmitter>) -> Self {
        self.webhooks = emitter;
        self
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PbxEvent>> {
        self.event_rx.take()
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Redfire PBX");

        // Transport
        let mut transport = SipTransport::bind(self.config.sip.clone()).await?;
        let transport_rx = transport
            .take_event_receiver()
            .ok_or_else(|| crate::Error::internal("Transport events already taken"))?;
        transport.start().await?;
        let transport = Arc::new(transport);
        self.transport = Some(Arc::clone(&transport));

        // Transactions
        let (tx_event_tx, tx_event_rx) = mpsc::unbounded_channel();
        let transactions = Arc::new(TransactionLayer::new(Arc::clone(&transport), tx_event_tx));
        self.transactions = Some(Arc::clone(&transactions));

        // Registrar
        let mut registrar = Registrar::new(
            self.config.registrar.clone(),
            Arc::clone(&self.extensions),
        );
        let registrar_rx = registrar
            .take_event_receiver()
            .ok_or_else(|| crate::Error::internal("Registrar events already taken"))?;
        let registrar = Arc::new(registrar);
        registrar.start();
        self.registrar = Some(Arc::clone(&registrar));

        // Dialplan, voicemail, CDR
        let dialplan = Arc::new(Dialplan::compile(&self.config.dialplan)?);
        let mailboxes = Arc::new(MailboxStore::new(&self.config.voicemail.root_dir));
        let cdr = Arc::new(CdrService::start(
            Arc::new(FileCdrSink::new(&self.config.cdr.directory)),
            self.config.cdr.queue_depth,
        ));

        // Call manager
        let b2bua = Arc::new(B2buaService::new(
            self.config.b2bua.clone(),
            self.config.sip.clone(),
            self.config.media.clone(),
            self.config.voicemail.clone(),
            self.config.ivr.clone(),
            self.config.rtp.clone(),
            Arc::clone(&transactions),
            Arc::clone(&registrar),
            dialplan,
            Arc::clone(&self.extensions),
            mailboxes,
            cdr,
        ));
        b2bua.start();
        let call_rx = b2bua
            .take_event_receiver()
            .ok_or_else(|| crate::Error::internal("Call events already taken"))?;
        self.b2bua = Some(Arc::clone(&b2bua));

        self.spawn_transport_loop(transport_rx, Arc::clone(&transactions));
        self.spawn_transaction_loop(tx_event_rx, Arc::clone(&registrar), Arc::clone(&b2bua));
        self.spawn_registrar_loop(registrar_rx, Arc::clone(&transactions));
        self.spawn_call_event_loop(call_rx);

        {
            let mut is_running = self.is_running.write().await;
            *is_running = true;
        }
        self.start_time = Some(std::time::Instant::now());

        let _ = self.event_tx.send(PbxEvent::Started);
        info!(
            "Redfire PBX listening on {}:{} (RTP {}-{})",
            self.config.sip.bind_address,
            self.config.sip.listen_port,
            self.config.rtp.port_range.min,
            self.config.rtp.port_range.max
        );
        Ok(())
    }

    /// Transport frames feed the transaction layer
    fn spawn_transport_loop(
        &self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        transactions: Arc<TransactionLayer>,
    ) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                match event {
                    TransportEvent::MessageReceived {
                        message,
                        source,
                        transport,
                    } => {
                        if message.is_request() {
                            transactions.on_request(message, source, transport).await;
                        } else {
                            transactions.on_response(message, source);
                        }
                    }
                    TransportEvent::Error { message } => {
                        let _ = event_tx.send(PbxEvent::Error { message });
                    }
                }
            }
        });
    }

    /// Fresh transactions go to the registrar or the call manager
    fn spawn_transaction_loop(
        &self,
        mut tx_event_rx: mpsc::UnboundedReceiver<TransactionEvent>,
        registrar: Arc<Registrar>,
        b2bua: Arc<B2buaService>,
    ) {
        let transactions = self
            .transactions
            .as_ref()
            .map(Arc::clone)
            .expect("transactions initialized in start()");

        tokio::spawn(async move {
            while let Some(event) = tx_event_rx.recv().await {
                match event {
                    TransactionEvent::Request {
                        message,
                        source,
                        transport,
                        server_key,
                    } if message.method == Some(SipMethod::Register) => {
                        let outcome =
                            registrar.process_register(&message, source, transport).await;
                        if let Err(e) = transactions
                            .respond(&server_key, outcome.response())
                            .await
                        {
                            warn!("REGISTER response failed: {}", e);
                        }
                    }
                    other => {
                        b2bua.process(other).await;
                    }
                }
            }
        });
    }

    /// Registration lifecycle out, NAT keep-alives back in
    fn spawn_registrar_loop(
        &self,
        mut registrar_rx: mpsc::UnboundedReceiver<RegistrarEvent>,
        transactions: Arc<TransactionLayer>,
    ) {
        let event_tx = self.event_tx.clone();
        let emitter = Arc::clone(&self.webhooks);
        let domain = self.config.sip.domain.clone();
        let external = self.config.sip.external_address;
        let port = self.config.sip.listen_port;

        tokio::spawn(async move {
            while let Some(event) = registrar_rx.recv().await {
                match event {
                    RegistrarEvent::Registered {
                        extension, contact, ..
                    } => {
                        emitter.emit(
                            "registration",
                            webhooks::registration_payload(&extension, &contact),
                        );
                        let _ = event_tx.send(PbxEvent::Registered { extension, contact });
                    }
                    RegistrarEvent::Unregistered { extension, .. }
                    | RegistrarEvent::Expired { extension, .. } => {
                        let _ = event_tx.send(PbxEvent::Unregistered { extension });
                    }
                    RegistrarEvent::KeepaliveDue {
                        extension,
                        target,
                        transport,
                    } => {
                        if let Err(e) = send_keepalive_options(
                            &transactions,
                            &domain,
                            external,
                            port,
                            &extension,
                            target,
                            transport,
                        )
                        .await
                        {
                            debug!("Keep-alive to {} failed: {}", extension, e);
                        }
                    }
                }
            }
        });
    }

    fn spawn_call_event_loop(&self, mut call_rx: mpsc::UnboundedReceiver<CallEvent>) {
        let event_tx = self.event_tx.clone();
        let emitter = Arc::clone(&self.webhooks);
        tokio::spawn(async move {
            while let Some(event) = call_rx.recv().await {
                match event {
                    CallEvent::Started {
                        call_id,
                        caller,
                        callee,
                    } => {
                        emitter.emit(
                            "call.started",
                            webhooks::call_started_payload(&call_id, &caller, &callee),
                        );
                        let _ = event_tx.send(PbxEvent::CallStarted {
                            call_id,
                            caller,
                            callee,
                        });
                    }
                    CallEvent::Ended {
                        call_id,
                        disposition,
                        duration,
                    } => {
                        emitter.emit(
                            "call.ended",
                            webhooks::call_ended_payload(
                                &call_id,
                                disposition,
                                duration.map(|d| d.as_secs()),
                            ),
                        );
                        let _ = event_tx.send(PbxEvent::CallEnded {
                            call_id,
                            disposition: disposition.to_string(),
                        });
                    }
                    CallEvent::Ringing { .. }
                    | CallEvent::Answered { .. }
                    | CallEvent::TransferRequested { .. } => {}
                }
            }
        });
    }

    // -- public API ---------------------------------------------------------

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn status(&self) -> PbxStatus {
        PbxStatus {
            running: self.is_running().await,
            uptime: self
                .start_time
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
            active_calls: self
                .b2bua
                .as_ref()
                .map(|b| b.active_call_count())
                .unwrap_or(0),
            registrations: self
                .registrar
                .as_ref()
                .map(|r| r.binding_count())
                .unwrap_or(0),
        }
    }

    /// Call originator for the admin plane
    pub async fn originate(&self, from_aor: &str, to_aor: &str) -> Result<String> {
        match &self.b2bua {
            Some(b2bua) => b2bua.originate(from_aor, to_aor).await,
            None => Err(crate::Error::invalid_state("PBX is not running")),
        }
    }

    /// Registrar inspector
    pub fn list_bindings(&self) -> Vec<crate::services::registrar::Registration> {
        self.registrar
            .as_ref()
            .map(|r| r.list_bindings())
            .unwrap_or_default()
    }

    pub fn drop_binding(&self, aor: &str) -> usize {
        self.registrar
            .as_ref()
            .map(|r| r.drop_binding(aor))
            .unwrap_or(0)
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping Redfire PBX");

        if let Some(b2bua) = &self.b2bua {
            b2bua.stop().await;
        }

        {
            let mut is_running = self.is_running.write().await;
            *is_running = false;
        }

        let _ = self.event_tx.send(PbxEvent::Stopped);
        info!("Redfire PBX stopped");
        Ok(())
    }
}

/// OPTIONS ping that keeps a NAT pinhole warm
async fn send_keepalive_options(
    transactions: &TransactionLayer,
    domain: &str,
    external: std::net::IpAddr,
    port: u16,
    extension: &str,
    target: SocketAddr,
    transport: TransportKind,
) -> Result<()> {
    let mut options =
        SipMessage::new_request(SipMethod::Options, format!("sip:{}@{}", extension, target));
    options.add_header(
        "Via",
        format!(
            "SIP/2.0/{} {}:{};branch={}",
            transport.as_str(),
            external,
            port,
            generate_branch()
        ),
    );
    options.add_header("Max-Forwards", "70");
    options.add_header(
        "From",
        format!("<sip:pbx@{}>;tag={}", domain, crate::protocols::sip::generate_tag()),
    );
    options.add_header("To", format!("<sip:{}@{}>", extension, domain));
    options.add_header("Call-ID", generate_call_id(domain));
    options.add_header("CSeq", "1 OPTIONS");
    transactions.send_request(options, target, transport).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn test_config() -> PbxConfig {
        let mut config = PbxConfig::default_config();
        config.sip.listen_port = 0;
        config.sip.enable_tcp = false;
        config.rtp.port_range = PortRange { min: 24000, max: 24100 };
        config
    }

    #[tokio::test]
    async fn test_pbx_lifecycle() {
        let mut pbx = RedfirePbx::new(test_config()).unwrap();
        let mut events = pbx.take_event_receiver().unwrap();

        assert!(!pbx.is_running().await);
        pbx.start().await.unwrap();
        assert!(pbx.is_running().await);

        assert!(matches!(events.recv().await, Some(PbxEvent::Started)));

        let status = pbx.status().await;
        assert!(status.running);
        assert_eq!(status.active_calls, 0);
        // Binding table is flushed on startup, always
        assert_eq!(status.registrations, 0);

        pbx.stop().await.unwrap();
        assert!(!pbx.is_running().await);
    }

    #[tokio::test]
    async fn test_event_receiver_single_take() {
        let mut pbx = RedfirePbx::new(test_config()).unwrap();
        assert!(pbx.take_event_receiver().is_some());
        assert!(pbx.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_originate_requires_running() {
        let pbx = RedfirePbx::new(test_config()).unwrap();
        assert!(pbx.originate("1001", "1002").await.is_err());
    }
}
