//! Registrar: AOR bindings, digest-gated REGISTER, NAT handling
//!
//! The binding table always starts empty; phones re-register within their
//! refresh interval, which beats trusting stale contact data across
//! restarts. A one-second sweeper retires expired bindings, and NAT-tracked
//! bindings get keep-alive prompts so the pinhole stays open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::RegistrarConfig;
use crate::protocols::auth::{
    verify_credentials, DigestAlgorithm, DigestChallenge, DigestCredentials, NonceStore,
};
use crate::protocols::sip::{uri_host_port, NameAddr, SipMessage};
use crate::protocols::transport::TransportKind;
use crate::services::extensions::ExtensionStore;

/// One live binding of an AOR to a reachable contact
#[derive(Debug, Clone)]
pub struct Registration {
    pub extension: String,
    pub contact_uri: String,
    /// Where requests for this binding are actually sent
    pub target: SocketAddr,
    pub transport: TransportKind,
    pub user_agent: Option<String>,
    /// `+sip.instance` when the phone supplies one
    pub instance_id: Option<String>,
    pub nat: bool,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub expires_at: Instant,
    pub last_keepalive: Instant,
}

/// Registrar events
#[derive(Debug, Clone)]
pub enum RegistrarEvent {
    Registered {
        extension: String,
        contact: String,
        expires: u32,
        nat: bool,
    },
    Unregistered {
        extension: String,
        contact: String,
    },
    Expired {
        extension: String,
        contact: String,
    },
    /// A NAT binding has gone quiet; the engine should send OPTIONS
    KeepaliveDue {
        extension: String,
        target: SocketAddr,
        transport: TransportKind,
    },
}

/// Outcome of a REGISTER, with the response to send
#[derive(Debug)]
pub enum RegisterOutcome {
    Ok(SipMessage),
    Challenge(SipMessage),
    Forbidden(SipMessage),
    NotFound(SipMessage),
    BadRequest(SipMessage),
}

impl RegisterOutcome {
    pub fn response(self) -> SipMessage {
        match self {
            Self::Ok(r)
            | Self::Challenge(r)
            | Self::Forbidden(r)
            | Self::NotFound(r)
            | Self::BadRequest(r) => r,
        }
    }
}

pub struct Registrar {
    config: RegistrarConfig,
    store: Arc<dyn ExtensionStore>,
    /// Keyed by `aor|contact`
    bindings: Arc<DashMap<String, Registration>>,
    nonces: Arc<NonceStore>,
    event_tx: mpsc::UnboundedSender<RegistrarEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<RegistrarEvent>>,
}

fn binding_key(aor: &str, contact: &str) -> String {
    format!("{}|{}", aor, contact)
}

impl Registrar {
    pub fn new(config: RegistrarConfig, store: Arc<dyn ExtensionStore>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let nonce_lifetime = config.nonce_lifetime;

        Self {
            config,
            store,
            bindings: Arc::new(DashMap::new()),
            nonces: Arc::new(NonceStore::new(u64::from(nonce_lifetime))),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<RegistrarEvent>> {
        self.event_rx.take()
    }

    /// Spawn the expiry sweeper and keep-alive watchdog
    pub fn start(&self) {
        let bindings = Arc::clone(&self.bindings);
        let nonces = Arc::clone(&self.nonces);
        let event_tx = self.event_tx.clone();
        let keepalive = Duration::from_secs(u64::from(self.config.nat_keepalive));

        tokio::spawn(async move {
            let mut sweep_interval = interval(Duration::from_secs(1));
            loop {
                sweep_interval.tick().await;
                let now = Instant::now();

                let expired: Vec<(String, Registration)> = bindings
                    .iter()
                    .filter(|entry| entry.expires_at <= now)
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();

                for (key, registration) in expired {
                    bindings.remove(&key);
                    debug!(
                        "Binding expired: {} at {}",
                        registration.extension, registration.contact_uri
                    );
                    let _ = event_tx.send(RegistrarEvent::Expired {
                        extension: registration.extension,
                        contact: registration.contact_uri,
                    });
                }

                // NAT pinholes need traffic roughly every 28 s
                for mut entry in bindings.iter_mut() {
                    if entry.nat && now.duration_since(entry.last_keepalive) >= keepalive {
                        entry.last_keepalive = now;
                        let _ = event_tx.send(RegistrarEvent::KeepaliveDue {
                            extension: entry.extension.clone(),
                            target: entry.target,
                            transport: entry.transport,
                        });
                    }
                }

                nonces.sweep();
            }
        });

        info!("Registrar started with an empty binding table");
    }

    /// Process a REGISTER request and produce the response
    pub async fn process_register(
        &self,
        request: &SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    ) -> RegisterOutcome {
        let aor = match request.to_header().and_then(|t| t.user().map(String::from)) {
            Some(user) => user,
            None => {
                return RegisterOutcome::BadRequest(self.tagged_response(
                    request,
                    400,
                    "Bad Request",
                ));
            }
        };

        let extension = match self.store.get(&aor).await {
            Ok(record) => record,
            Err(_) => {
                warn!("REGISTER for unknown AOR {}", aor);
                return RegisterOutcome::NotFound(self.tagged_response(request, 404, "Not Found"));
            }
        };

        // Digest gate
        let authorized = match request.header("Authorization") {
            Some(header) => match DigestCredentials::parse(header) {
                Ok(credentials) => {
                    credentials.username == aor
                        && verify_credentials(
                            &credentials,
                            "REGISTER",
                            &extension.sip_password,
                            &self.nonces,
                        )
                }
                Err(e) => {
                    debug!("Bad Authorization header from {}: {}", source, e);
                    false
                }
            },
            None => false,
        };

        if !authorized {
            let challenge = DigestChallenge {
                realm: self.config.realm.clone(),
                nonce: self.nonces.issue(),
                algorithm: DigestAlgorithm::Sha256,
                qop: true,
            };
            let mut response = self.tagged_response(request, 401, "Unauthorized");
            response.add_header("WWW-Authenticate", challenge.header_value());
            // MD5 fallback for phones without RFC 8760 support
            let md5_challenge = DigestChallenge {
                realm: self.config.realm.clone(),
                nonce: self.nonces.issue(),
                algorithm: DigestAlgorithm::Md5,
                qop: true,
            };
            response.add_header("WWW-Authenticate", md5_challenge.header_value());
            return RegisterOutcome::Challenge(response);
        }

        let contact = match request.contact() {
            Some(contact) => contact,
            None => {
                // Query-style REGISTER: report current bindings
                let mut response = self.tagged_response(request, 200, "OK");
                for registration in self.lookup(&aor) {
                    response.add_header(
                        "Contact",
                        format!("<{}>", registration.contact_uri),
                    );
                }
                return RegisterOutcome::Ok(response);
            }
        };

        // Requested lifetime: Contact expires param beats the Expires header
        let requested = contact
            .param("expires")
            .and_then(|e| e.parse().ok())
            .or_else(|| request.expires())
            .unwrap_or(self.config.default_expires);

        if requested == 0 {
            return self.unregister(request, &aor, &contact);
        }

        let granted = requested.clamp(self.config.min_expires, self.config.max_expires);
        let nat = Self::is_natted(&contact.uri, source);
        let now = Instant::now();
        let key = binding_key(&aor, &contact.uri);
        let is_refresh = self.bindings.contains_key(&key);

        let registration = Registration {
            extension: aor.clone(),
            contact_uri: contact.uri.clone(),
            // NAT: route to the observed source, not the advertised contact
            target: if nat {
                source
            } else {
                Self::contact_target(&contact.uri).unwrap_or(source)
            },
            transport,
            user_agent: request.header("User-Agent").map(String::from),
            instance_id: contact.param("+sip.instance"),
            nat,
            first_seen: self
                .bindings
                .get(&key)
                .map(|b| b.first_seen)
                .unwrap_or(now),
            last_seen: now,
            expires_at: now + Duration::from_secs(u64::from(granted)),
            last_keepalive: now,
        };

        self.bindings.insert(key, registration);

        if !is_refresh {
            info!(
                "Registered {} at {} (nat={}, expires={}s)",
                aor, contact.uri, nat, granted
            );
        }
        let _ = self.event_tx.send(RegistrarEvent::Registered {
            extension: aor.clone(),
            contact: contact.uri.clone(),
            expires: granted,
            nat,
        });

        let mut response = self.tagged_response(request, 200, "OK");
        let mut bound_contact = NameAddr::new(&contact.uri);
        bound_contact.set_param("expires", &granted.to_string());
        response.add_header("Contact", bound_contact.to_string());
        response.add_header("Expires", granted.to_string());
        RegisterOutcome::Ok(response)
    }

    fn unregister(
        &self,
        request: &SipMessage,
        aor: &str,
        contact: &NameAddr,
    ) -> RegisterOutcome {
        if contact.uri == "*" {
            // Wildcard: drop every binding for the AOR
            let keys: Vec<String> = self
                .bindings
                .iter()
                .filter(|e| e.extension == aor)
                .map(|e| e.key().clone())
                .collect();
            for key in keys {
                if let Some((_, registration)) = self.bindings.remove(&key) {
                    let _ = self.event_tx.send(RegistrarEvent::Unregistered {
                        extension: registration.extension,
                        contact: registration.contact_uri,
                    });
                }
            }
        } else if let Some((_, registration)) =
            self.bindings.remove(&binding_key(aor, &contact.uri))
        {
            let _ = self.event_tx.send(RegistrarEvent::Unregistered {
                extension: registration.extension,
                contact: registration.contact_uri,
            });
        }

        info!("Unregistered {} (contact {})", aor, contact.uri);
        RegisterOutcome::Ok(self.tagged_response(request, 200, "OK"))
    }

    /// All live bindings for an AOR
    pub fn lookup(&self, aor: &str) -> Vec<Registration> {
        let now = Instant::now();
        self.bindings
            .iter()
            .filter(|e| e.extension == aor && e.expires_at > now)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Inspector API: every binding in the table
    pub fn list_bindings(&self) -> Vec<Registration> {
        self.bindings.iter().map(|e| e.value().clone()).collect()
    }

    /// Inspector API: administratively drop an AOR's bindings
    pub fn drop_binding(&self, aor: &str) -> usize {
        let keys: Vec<String> = self
            .bindings
            .iter()
            .filter(|e| e.extension == aor)
            .map(|e| e.key().clone())
            .collect();
        let count = keys.len();
        for key in keys {
            self.bindings.remove(&key);
        }
        count
    }

    /// Refresh keep-alive state when the phone sends OPTIONS/UPDATE
    pub fn note_keepalive(&self, source: SocketAddr) {
        let now = Instant::now();
        for mut entry in self.bindings.iter_mut() {
            if entry.target == source {
                entry.last_keepalive = now;
                entry.last_seen = now;
            }
        }
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn is_natted(contact_uri: &str, source: SocketAddr) -> bool {
        match uri_host_port(contact_uri) {
            Some((host, port)) => {
                let host_matches = host
                    .parse::<std::net::IpAddr>()
                    .map(|ip| ip == source.ip())
                    .unwrap_or(false);
                let port_matches = port.unwrap_or(5060) == source.port();
                !(host_matches && port_matches)
            }
            None => true,
        }
    }

    fn contact_target(contact_uri: &str) -> Option<SocketAddr> {
        let (host, port) = uri_host_port(contact_uri)?;
        let ip = host.parse().ok()?;
        Some(SocketAddr::new(ip, port.unwrap_or(5060)))
    }

    /// Response with a To-tag, as the registrar is the UAS here
    fn tagged_response(&self, request: &SipMessage, status: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::response_to(request, status, reason);
        if let Some(to) = response.to_header() {
            if to.param("tag").is_none() {
                let mut tagged = to;
                tagged.set_param("tag", &crate::protocols::sip::generate_tag());
                response.set_header("To", tagged.to_string());
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;
    use crate::protocols::auth::{compute_response, DigestAlgorithm};
    use crate::protocols::sip::SipMethod;
    use crate::services::extensions::{ExtensionRecord, InMemoryExtensionStore};
    use crate::protocols::auth::StoredSecret;
    use std::collections::HashSet;

    fn test_store() -> Arc<InMemoryExtensionStore> {
        let store = InMemoryExtensionStore::new();
        store
            .insert(ExtensionRecord {
                number: "1001".to_string(),
                display_name: "Alice".to_string(),
                sip_password: "secret".to_string(),
                pin_hash: Some(StoredSecret::derive_with("1234", &[1, 2, 3, 4], 1000)),
                permissions: HashSet::new(),
                allow_external: false,
                mailbox_id: Some("1001".to_string()),
            })
            .unwrap();
        Arc::new(store)
    }

    fn registrar() -> Registrar {
        Registrar::new(PbxConfig::default_config().registrar, test_store())
    }

    fn register_request(aor: &str, contact: &str, expires: Option<u32>) -> SipMessage {
        let mut msg = SipMessage::new_request(SipMethod::Register, "sip:redfire-pbx.local");
        msg.add_header("Via", "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKreg");
        msg.add_header("From", format!("<sip:{}@redfire-pbx.local>;tag=r1", aor));
        msg.add_header("To", format!("<sip:{}@redfire-pbx.local>", aor));
        msg.add_header("Call-ID", "reg@10.0.0.5");
        msg.add_header("CSeq", "1 REGISTER");
        msg.add_header("Contact", format!("<{}>", contact));
        if let Some(expires) = expires {
            msg.add_header("Expires", expires.to_string());
        }
        msg
    }

    fn source() -> SocketAddr {
        "10.0.0.5:5060".parse().unwrap()
    }

    /// Take the 401, answer its SHA-256 challenge, return the authorized request
    fn authorize(registrar: &Registrar, mut request: SipMessage, challenge: &SipMessage) -> SipMessage {
        let _ = registrar;
        let www = challenge.header("WWW-Authenticate").unwrap();
        let nonce = www
            .split("nonce=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .to_string();

        let response = compute_response(
            DigestAlgorithm::Sha256,
            "1001",
            "redfire-pbx.local",
            "secret",
            "REGISTER",
            "sip:redfire-pbx.local",
            &nonce,
            Some(1),
            Some("cn1"),
            Some("auth"),
        );
        request.set_header(
            "Authorization",
            format!(
                "Digest username=\"1001\", realm=\"redfire-pbx.local\", nonce=\"{}\", \
                 uri=\"sip:redfire-pbx.local\", response=\"{}\", algorithm=SHA-256, \
                 cnonce=\"cn1\", nc=00000001, qop=auth",
                nonce, response
            ),
        );
        request
    }

    #[tokio::test]
    async fn test_table_empty_at_start() {
        let registrar = registrar();
        assert_eq!(registrar.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_register_challenge_then_ok() {
        let registrar = registrar();
        let request = register_request("1001", "sip:1001@10.0.0.5:5060", Some(300));

        let outcome = registrar
            .process_register(&request, source(), TransportKind::Udp)
            .await;
        let challenge = match outcome {
            RegisterOutcome::Challenge(r) => r,
            other => panic!("Expected challenge, got {:?}", other),
        };
        assert_eq!(challenge.status, Some(401));
        // SHA-256 preferred, MD5 offered second
        let challenges = challenge.header_values("WWW-Authenticate");
        assert_eq!(challenges.len(), 2);
        assert!(challenges[0].contains("SHA-256"));
        assert!(challenges[1].contains("MD5"));

        let authorized = authorize(&registrar, request, &challenge);
        let outcome = registrar
            .process_register(&authorized, source(), TransportKind::Udp)
            .await;
        match outcome {
            RegisterOutcome::Ok(response) => {
                assert_eq!(response.status, Some(200));
                assert!(response.header("Contact").unwrap().contains("expires=300"));
            }
            other => panic!("Expected OK, got {:?}", other),
        }

        assert_eq!(registrar.binding_count(), 1);
        let bindings = registrar.lookup("1001");
        assert_eq!(bindings.len(), 1);
        assert!(!bindings[0].nat);
        assert_eq!(bindings[0].target, source());
    }

    #[tokio::test]
    async fn test_nat_contact_rewritten() {
        let registrar = registrar();
        // Phone advertises its private address; packets arrive from elsewhere
        let request = register_request("1001", "sip:1001@192.168.50.2:5060", Some(300));
        let public: SocketAddr = "203.0.113.7:49152".parse().unwrap();

        let challenge = registrar
            .process_register(&request, public, TransportKind::Udp)
            .await
            .response();
        let authorized = authorize(&registrar, request, &challenge);
        registrar
            .process_register(&authorized, public, TransportKind::Udp)
            .await;

        let bindings = registrar.lookup("1001");
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].nat);
        assert_eq!(bindings[0].target, public);
    }

    #[tokio::test]
    async fn test_unknown_aor_rejected() {
        let registrar = registrar();
        let request = register_request("9999", "sip:9999@10.0.0.5", Some(300));
        let outcome = registrar
            .process_register(&request, source(), TransportKind::Udp)
            .await;
        assert!(matches!(outcome, RegisterOutcome::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expires_clamped() {
        let registrar = registrar();
        let request = register_request("1001", "sip:1001@10.0.0.5:5060", Some(864000));

        let challenge = registrar
            .process_register(&request, source(), TransportKind::Udp)
            .await
            .response();
        let authorized = authorize(&registrar, request, &challenge);
        let outcome = registrar
            .process_register(&authorized, source(), TransportKind::Udp)
            .await;

        let response = outcome.response();
        assert_eq!(response.header("Expires"), Some("3600"));
    }

    #[tokio::test]
    async fn test_deregister_removes_binding() {
        let registrar = registrar();
        let request = register_request("1001", "sip:1001@10.0.0.5:5060", Some(300));
        let challenge = registrar
            .process_register(&request, source(), TransportKind::Udp)
            .await
            .response();
        let authorized = authorize(&registrar, request, &challenge);
        registrar
            .process_register(&authorized, source(), TransportKind::Udp)
            .await;
        assert_eq!(registrar.binding_count(), 1);

        // Expires: 0 removes it (re-auth with a fresh challenge)
        let removal = register_request("1001", "sip:1001@10.0.0.5:5060", Some(0));
        let challenge = registrar
            .process_register(&removal, source(), TransportKind::Udp)
            .await
            .response();
        let authorized = authorize(&registrar, removal, &challenge);
        let outcome = registrar
            .process_register(&authorized, source(), TransportKind::Udp)
            .await;
        assert!(matches!(outcome, RegisterOutcome::Ok(_)));
        assert_eq!(registrar.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_bindings_per_aor() {
        let registrar = registrar();
        for contact in ["sip:1001@10.0.0.5:5060", "sip:1001@10.0.0.6:5062"] {
            let request = register_request("1001", contact, Some(300));
            let challenge = registrar
                .process_register(&request, source(), TransportKind::Udp)
                .await
                .response();
            let authorized = authorize(&registrar, request, &challenge);
            registrar
                .process_register(&authorized, source(), TransportKind::Udp)
                .await;
        }
        assert_eq!(registrar.lookup("1001").len(), 2);
        assert_eq!(registrar.drop_binding("1001"), 2);
        assert_eq!(registrar.binding_count(), 0);
    }
}
