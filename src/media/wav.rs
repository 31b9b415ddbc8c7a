//! WAV framing for prompts, greetings and voicemail messages
//!
//! Prompts are 8 kHz mono, either 16-bit PCM or 8-bit μ-law. PCM files go
//! through `hound`; μ-law files (format tag 7, which `hound` does not
//! handle) are parsed directly and expanded through the G.711 decoder.

use std::io::{Cursor, Read};
use std::path::Path;

use crate::media::g711::decode_ulaw;
use crate::{Error, Result};

pub const SAMPLE_RATE: u32 = 8000;

const FORMAT_PCM: u16 = 1;
const FORMAT_MULAW: u16 = 7;

/// Decoded audio, always 16-bit PCM mono at 8 kHz
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub samples: Vec<i16>,
}

impl WavAudio {
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / u64::from(SAMPLE_RATE)
    }
}

/// Read a prompt or message file
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<WavAudio> {
    let data = std::fs::read(path.as_ref())?;
    read_wav_bytes(&data)
}

pub fn read_wav_bytes(data: &[u8]) -> Result<WavAudio> {
    match hound::WavReader::new(Cursor::new(data)) {
        Ok(mut reader) => {
            let spec = reader.spec();
            if spec.channels != 1 {
                return Err(Error::codec(format!(
                    "WAV must be mono, got {} channels",
                    spec.channels
                )));
            }
            if spec.sample_rate != SAMPLE_RATE {
                return Err(Error::codec(format!(
                    "WAV must be {} Hz, got {}",
                    SAMPLE_RATE, spec.sample_rate
                )));
            }
            if spec.bits_per_sample != 16 {
                return Err(Error::codec(format!(
                    "PCM WAV must be 16-bit, got {}",
                    spec.bits_per_sample
                )));
            }
            let samples: std::result::Result<Vec<i16>, _> =
                reader.samples::<i16>().collect();
            let samples =
                samples.map_err(|e| Error::codec(format!("WAV read failed: {}", e)))?;
            Ok(WavAudio { samples })
        }
        // hound rejects format tag 7; fall back to the μ-law parser
        Err(_) => read_mulaw_wav(data),
    }
}

/// Write 16-bit PCM mono at 8 kHz
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[i16]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path.as_ref(), spec)
        .map_err(|e| Error::codec(format!("WAV create failed: {}", e)))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| Error::codec(format!("WAV write failed: {}", e)))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::codec(format!("WAV finalize failed: {}", e)))?;
    Ok(())
}

/// Minimal RIFF walk for μ-law files
fn read_mulaw_wav(data: &[u8]) -> Result<WavAudio> {
    let mut cursor = Cursor::new(data);
    let mut header = [0u8; 12];
    cursor
        .read_exact(&mut header)
        .map_err(|_| Error::codec("WAV too short"))?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Err(Error::codec("Not a RIFF/WAVE file"));
    }

    let mut format_tag = None;
    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut payload: Option<Vec<u8>> = None;

    loop {
        let mut chunk_header = [0u8; 8];
        if cursor.read_exact(&mut chunk_header).is_err() {
            break;
        }
        let chunk_id = [chunk_header[0], chunk_header[1], chunk_header[2], chunk_header[3]];
        let chunk_len = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as usize;

        let mut chunk = vec![0u8; chunk_len];
        cursor
            .read_exact(&mut chunk)
            .map_err(|_| Error::codec("Truncated WAV chunk"))?;

        match &chunk_id {
            b"fmt " => {
                if chunk.len() < 16 {
                    return Err(Error::codec("Short fmt chunk"));
                }
                format_tag = Some(u16::from_le_bytes([chunk[0], chunk[1]]));
                channels = u16::from_le_bytes([chunk[2], chunk[3]]);
                sample_rate = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            }
            b"data" => {
                payload = Some(chunk);
            }
            _ => {}
        }

        // Chunks are word-aligned
        if chunk_len % 2 == 1 {
            let mut pad = [0u8; 1];
            let _ = cursor.read_exact(&mut pad);
        }
    }

    let format_tag = format_tag.ok_or_else(|| Error::codec("WAV missing fmt chunk"))?;
    let payload = payload.ok_or_else(|| Error::codec("WAV missing data chunk"))?;

    if channels != 1 {
        return Err(Error::codec(format!("WAV must be mono, got {} channels", channels)));
    }
    if sample_rate != SAMPLE_RATE {
        return Err(Error::codec(format!("WAV must be {} Hz, got {}", SAMPLE_RATE, sample_rate)));
    }

    match format_tag {
        FORMAT_MULAW => Ok(WavAudio {
            samples: payload.iter().map(|&b| decode_ulaw(b)).collect(),
        }),
        FORMAT_PCM => Err(Error::codec("PCM WAV rejected by reader")),
        other => Err(Error::codec(format!("Unsupported WAV format tag {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::g711::encode_ulaw;

    fn mulaw_wav_bytes(samples: &[i16]) -> Vec<u8> {
        let payload: Vec<u8> = samples.iter().map(|&s| encode_ulaw(s)).collect();
        let data_len = payload.len() as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&FORMAT_MULAW.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
        out.extend_from_slice(&SAMPLE_RATE.to_le_bytes()); // byte rate
        out.extend_from_slice(&1u16.to_le_bytes()); // block align
        out.extend_from_slice(&8u16.to_le_bytes()); // bits per sample
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn test_pcm_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        let samples: Vec<i16> = (0..800).map(|i| ((i % 100) * 50) as i16).collect();

        write_wav(&path, &samples).unwrap();
        let audio = read_wav(&path).unwrap();

        assert_eq!(audio.samples, samples);
        assert_eq!(audio.duration_ms(), 100);
    }

    #[test]
    fn test_mulaw_read() {
        let samples: Vec<i16> = vec![0, 1000, -1000, 8000, -8000];
        let bytes = mulaw_wav_bytes(&samples);
        let audio = read_wav_bytes(&bytes).unwrap();

        assert_eq!(audio.samples.len(), samples.len());
        for (orig, decoded) in samples.iter().zip(audio.samples.iter()) {
            assert!((i32::from(*orig) - i32::from(*decoded)).abs() <= 1024);
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(read_wav_bytes(b"not a wav file at all").is_err());
    }

    #[test]
    fn test_wrong_rate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hz.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(read_wav(&path).is_err());
    }
}
