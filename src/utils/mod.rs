//! Utility modules for the Redfire PBX

pub mod logger;

pub use logger::setup_logging;
