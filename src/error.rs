//! Error handling for the Redfire PBX


pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Audio codec error: {0}")]
    Codec(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Registrar error: {0}")]
    Registrar(String),

    #[error("B2BUA error: {0}")]
    B2bua(String),

    #[error("IVR error: {0}")]
    Ivr(String),

    #[error("Voicemail error: {0}")]
    Voicemail(String),

    #[error("CDR error: {0}")]
    Cdr(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn sip<S: Into<String>>(msg: S) -> Self {
        Self::Sip(msg.into())
    }

    pub fn sdp<S: Into<String>>(msg: S) -> Self {
        Self::Sdp(msg.into())
    }

    pub fn rtp<S: Into<String>>(msg: S) -> Self {
        Self::Rtp(msg.into())
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    pub fn registrar<S: Into<String>>(msg: S) -> Self {
        Self::Registrar(msg.into())
    }

    pub fn b2bua<S: Into<String>>(msg: S) -> Self {
        Self::B2bua(msg.into())
    }

    pub fn ivr<S: Into<String>>(msg: S) -> Self {
        Self::Ivr(msg.into())
    }

    pub fn voicemail<S: Into<String>>(msg: S) -> Self {
        Self::Voicemail(msg.into())
    }

    pub fn cdr<S: Into<String>>(msg: S) -> Self {
        Self::Cdr(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}
