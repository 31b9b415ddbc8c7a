//! Configuration management for the Redfire PBX

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbxConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub rtp: RtpConfig,
    pub media: MediaConfig,
    pub registrar: RegistrarConfig,
    pub dialplan: DialplanConfig,
    pub voicemail: VoicemailConfig,
    pub ivr: IvrConfig,
    pub cdr: CdrConfig,
    pub b2bua: B2buaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    pub location: String,
    pub contact: String,
    pub max_calls: u32,
    pub call_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// Address the UDP/TCP listeners bind to
    pub bind_address: IpAddr,
    pub listen_port: u16,
    /// Address advertised in Via/Contact and SDP; differs from
    /// `bind_address` when the PBX sits behind a router
    pub external_address: IpAddr,
    pub domain: String,
    pub transport: SipTransport,
    /// Also accept SIP over TCP on `listen_port`
    pub enable_tcp: bool,
    pub user_agent: String,
    pub max_sessions: u32,
    pub session_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    pub port_range: PortRange,
    /// Seconds after relay start during which symmetric-RTP source
    /// learning may rewrite an endpoint's port
    pub learn_window: u32,
    /// Seconds a released port pair stays out of the pool
    pub port_cooldown: u32,
    /// Seconds without inbound media before a relay is considered dead
    pub packet_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Codec preference order; the first entry the offer also carries wins
    pub codec_preference: Vec<String>,
    /// RFC 2833 telephone-event payload number offered in answers
    pub dtmf_payload_type: u8,
    pub dtmf: DtmfConfig,
    /// Directory holding system prompts (WAV, 8 kHz mono)
    pub prompt_dir: String,
    /// Directory for on-demand call recordings
    pub recording_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfConfig {
    pub method: DtmfMethod,
    pub payload_type: u8,
    /// Reported tone duration in ms when generating events
    pub duration: u32,
    /// Digits from any source arriving within this many ms of the same
    /// digit are treated as duplicates
    pub dedup_window_ms: u64,
    pub sip_info_content_type: String,
    pub inband_frequencies: InbandFrequencies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DtmfMethod {
    #[serde(rename = "rfc2833")]
    Rfc2833,
    #[serde(rename = "sip_info")]
    SipInfo,
    #[serde(rename = "inband")]
    Inband,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InbandFrequencies {
    pub low_freq: Vec<u16>,
    pub high_freq: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    pub min_expires: u32,
    pub max_expires: u32,
    pub default_expires: u32,
    /// NAT pinhole keep-alive interval in seconds
    pub nat_keepalive: u32,
    /// Digest nonce lifetime in seconds
    pub nonce_lifetime: u32,
    pub realm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanConfig {
    pub rules: Vec<DialplanRule>,
    /// Per-leg ring timeout in seconds for hunt/group forks
    pub ring_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanRule {
    pub id: String,
    /// Dialed-number pattern. Prefix match by default; anchored regex
    /// when `match_type` is `regex`.
    pub pattern: String,
    pub match_type: MatchType,
    pub action: DialAction,
    pub priority: u8,
    pub translation: Option<NumberTranslation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchType {
    #[serde(rename = "prefix")]
    Prefix,
    #[serde(rename = "exact")]
    Exact,
    #[serde(rename = "regex")]
    Regex,
}

/// What to do with a call that matched a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DialAction {
    /// Ring a single extension
    #[serde(rename = "extension")]
    Extension { target: String },
    /// Ring an ordered list sequentially, each for `ring_timeout`
    #[serde(rename = "hunt")]
    Hunt { targets: Vec<String> },
    /// Ring every member in parallel; first answer wins
    #[serde(rename = "group")]
    Group { targets: Vec<String> },
    /// Hand the call to the voicemail IVR for the given mailbox owner
    #[serde(rename = "voicemail")]
    Voicemail { mailbox: String },
    /// Hand the call to a named auto-attendant menu
    #[serde(rename = "ivr")]
    Ivr { menu: String },
    /// Reject with a SIP status
    #[serde(rename = "reject")]
    Reject { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberTranslation {
    pub prefix_strip: Option<String>,
    pub prefix_add: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicemailConfig {
    /// Root directory; one subdirectory per extension
    pub root_dir: String,
    /// Recording hard limit in seconds
    pub max_message_secs: u32,
    pub max_pin_attempts: u8,
    /// Silence a caller must break before the beep is replayed
    pub greeting_timeout_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvrConfig {
    /// Inter-digit timeout in seconds while a menu is waiting
    pub digit_timeout: u32,
    /// Named auto-attendant menus
    pub menus: HashMap<String, AttendantMenu>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendantMenu {
    /// Greeting prompt, relative to `media.prompt_dir`
    pub greeting: String,
    /// digit -> target mapping
    pub keys: HashMap<char, AttendantTarget>,
    /// Where to send the call when the menu times out
    pub timeout_target: Option<AttendantTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AttendantTarget {
    #[serde(rename = "extension")]
    Extension { number: String },
    #[serde(rename = "menu")]
    Menu { name: String },
    #[serde(rename = "voicemail")]
    Voicemail { mailbox: String },
    #[serde(rename = "hangup")]
    Hangup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdrConfig {
    pub directory: String,
    /// Queue depth before best-effort records are dropped
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct B2buaConfig {
    pub max_concurrent_calls: u32,
    pub call_timeout: u32,
    pub media_timeout: u32,
    pub ring_timeout: u32,
    /// Challenge INVITEs from extensions with a 407 digest gate
    pub authenticate_invites: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub max_size: u64,
    pub max_files: u32,
    pub format: LogFormat,
}

// Supporting types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SipTransport {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tls")]
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PbxConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PbxConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let mut settings = config::Config::builder();

        // Load from environment variables with REDFIRE_PBX_ prefix
        settings = settings.add_source(
            config::Environment::with_prefix("REDFIRE_PBX")
                .separator("_")
        );

        let config = settings.build()?;
        let pbx_config = config.try_deserialize()?;
        Ok(pbx_config)
    }

    pub fn validate(&self) -> Result<()> {
        // Validate port ranges
        if self.rtp.port_range.min >= self.rtp.port_range.max {
            return Err(Error::parse("Invalid RTP port range"));
        }
        if self.rtp.port_range.min % 2 != 0 {
            return Err(Error::parse("RTP port range must start on an even port"));
        }

        if self.registrar.min_expires > self.registrar.max_expires {
            return Err(Error::parse("Registrar min_expires exceeds max_expires"));
        }

        if self.media.codec_preference.is_empty() {
            return Err(Error::parse("No codecs configured"));
        }
        for codec in &self.media.codec_preference {
            match codec.to_ascii_uppercase().as_str() {
                "PCMU" | "PCMA" => {}
                other => {
                    return Err(Error::parse(format!("Unsupported codec: {}", other)));
                }
            }
        }

        if !(96..=127).contains(&self.media.dtmf_payload_type) {
            return Err(Error::parse("telephone-event payload type must be dynamic (96-127)"));
        }

        for rule in &self.dialplan.rules {
            if rule.match_type == MatchType::Regex {
                regex::Regex::new(&rule.pattern)
                    .map_err(|e| Error::parse(format!("Dialplan rule {}: {}", rule.id, e)))?;
            }
            if let DialAction::Reject { status } = &rule.action {
                if !(400..700).contains(status) {
                    return Err(Error::parse(format!(
                        "Dialplan rule {}: reject status {} is not a failure status",
                        rule.id, status
                    )));
                }
            }
        }

        for (name, menu) in &self.ivr.menus {
            if menu.greeting.is_empty() {
                return Err(Error::parse(format!("IVR menu {}: missing greeting", name)));
            }
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "redfire-pbx-1".to_string(),
                description: "Redfire Software PBX".to_string(),
                location: "Network Operations Center".to_string(),
                contact: "admin@redfire-pbx.local".to_string(),
                max_calls: 500,
                call_timeout: 7200,
            },
            sip: SipConfig {
                bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                listen_port: 5060,
                external_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                domain: "redfire-pbx.local".to_string(),
                transport: SipTransport::Udp,
                enable_tcp: true,
                user_agent: format!("Redfire-PBX/{}", env!("CARGO_PKG_VERSION")),
                max_sessions: 1000,
                session_timeout: 300,
            },
            rtp: RtpConfig {
                port_range: PortRange { min: 10000, max: 20000 },
                learn_window: 10,
                port_cooldown: 30,
                packet_timeout: 5,
            },
            media: MediaConfig {
                codec_preference: vec!["PCMU".to_string(), "PCMA".to_string()],
                dtmf_payload_type: 101,
                dtmf: DtmfConfig {
                    method: DtmfMethod::Rfc2833,
                    payload_type: 101,
                    duration: 100,
                    dedup_window_ms: 100,
                    sip_info_content_type: "application/dtmf-relay".to_string(),
                    inband_frequencies: InbandFrequencies {
                        low_freq: vec![697, 770, 852, 941],
                        high_freq: vec![1209, 1336, 1477, 1633],
                    },
                },
                prompt_dir: "prompts".to_string(),
                recording_dir: "recordings".to_string(),
            },
            registrar: RegistrarConfig {
                min_expires: 60,
                max_expires: 3600,
                default_expires: 300,
                nat_keepalive: 28,
                nonce_lifetime: 300,
                realm: "redfire-pbx.local".to_string(),
            },
            dialplan: DialplanConfig {
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
                        id: "voicemail-direct".to_string(),
                        pattern: "*".to_string(),
                        match_type: MatchType::Prefix,
                        action: DialAction::Voicemail { mailbox: String::new() },
                        priority: 5,
                        translation: Some(NumberTranslation {
                            prefix_strip: Some("*".to_string()),
                            prefix_add: None,
                        }),
                    },
                ],
                ring_timeout: 25,
            },
            voicemail: VoicemailConfig {
                root_dir: "voicemail".to_string(),
                max_message_secs: 120,
                max_pin_attempts: 3,
                greeting_timeout_secs: 5,
            },
            ivr: IvrConfig {
                digit_timeout: 5,
                menus: HashMap::new(),
            },
            cdr: CdrConfig {
                directory: "cdr".to_string(),
                queue_depth: 1024,
            },
            b2bua: B2buaConfig {
                max_concurrent_calls: 500,
                call_timeout: 7200,
                media_timeout: 60,
                ring_timeout: 25,
                authenticate_invites: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                max_size: 100 * 1024 * 1024, // 100MB
                max_files: 10,
                format: LogFormat::Compact,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = PbxConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_rtp_range_rejected() {
        let mut config = PbxConfig::default_config();
        config.rtp.port_range = PortRange { min: 20000, max: 10000 };
        assert!(config.validate().is_err());

        config.rtp.port_range = PortRange { min: 10001, max: 20000 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let mut config = PbxConfig::default_config();
        config.media.codec_preference = vec!["G729".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_dialplan_regex_rejected() {
        let mut config = PbxConfig::default_config();
        config.dialplan.rules.push(DialplanRule {
            id: "broken".to_string(),
            pattern: "([".to_string(),
            match_type: MatchType::Regex,
            action: DialAction::Reject { status: 404 },
            priority: 1,
            translation: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = PbxConfig::default_config();
        let toml_text = toml::to_string_pretty(&config).unwrap();
        let parsed: PbxConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.sip.listen_port, config.sip.listen_port);
        assert_eq!(parsed.media.codec_preference, config.media.codec_preference);
    }
}
