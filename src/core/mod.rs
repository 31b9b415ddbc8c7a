//! Core orchestration for the Redfire PBX

pub mod pbx;

pub use pbx::{PbxEvent, PbxStatus, RedfirePbx};
