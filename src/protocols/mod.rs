//! Protocol implementations for the Redfire PBX

pub mod auth;
pub mod dialog;
pub mod rtp;
pub mod sdp;
pub mod sip;
pub mod transaction;
pub mod transport;

pub use sip::{SipMessage, SipMethod};
pub use transport::SipTransport;
