//! Audio codec and signal processing for the Redfire PBX

pub mod g711;
pub mod tone;
pub mod wav;

pub use g711::{decode_alaw, decode_ulaw, encode_alaw, encode_ulaw, G711Variant};
pub use tone::{DtmfDetector, ToneGenerator, DTMF_FREQUENCIES};
pub use wav::{read_wav, write_wav, WavAudio};
