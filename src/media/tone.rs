//! DTMF tone generation and Goertzel detection
//!
//! The detector runs over the recording tap of a media relay and feeds the
//! in-band leg of the DTMF router. Frames are expected at 8 kHz mono; the
//! Goertzel bins cover the eight DTMF frequencies.

use once_cell::sync::Lazy;

/// DTMF keypad laid out as (digit, low frequency, high frequency)
pub static DTMF_FREQUENCIES: Lazy<[(char, f64, f64); 16]> = Lazy::new(|| {
    [
        ('1', 697.0, 1209.0),
        ('2', 697.0, 1336.0),
        ('3', 697.0, 1477.0),
        ('A', 697.0, 1633.0),
        ('4', 770.0, 1209.0),
        ('5', 770.0, 1336.0),
        ('6', 770.0, 1477.0),
        ('B', 770.0, 1633.0),
        ('7', 852.0, 1209.0),
        ('8', 852.0, 1336.0),
        ('9', 852.0, 1477.0),
        ('C', 852.0, 1633.0),
        ('*', 941.0, 1209.0),
        ('0', 941.0, 1336.0),
        ('#', 941.0, 1477.0),
        ('D', 941.0, 1633.0),
    ]
});

const LOW_FREQS: [f64; 4] = [697.0, 770.0, 852.0, 941.0];
const HIGH_FREQS: [f64; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// RFC 2833 event code for a digit
pub fn digit_to_event(digit: char) -> Option<u8> {
    match digit {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A' | 'a' => Some(12),
        'B' | 'b' => Some(13),
        'C' | 'c' => Some(14),
        'D' | 'd' => Some(15),
        _ => None,
    }
}

/// Digit for an RFC 2833 event code
pub fn event_to_digit(event: u8) -> Option<char> {
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12 => Some('A'),
        13 => Some('B'),
        14 => Some('C'),
        15 => Some('D'),
        _ => None,
    }
}

/// Goertzel power at one frequency over a sample frame
fn goertzel_power(samples: &[i16], sample_rate: u32, freq: f64) -> f64 {
    let coeff = 2.0 * (2.0 * std::f64::consts::PI * freq / sample_rate as f64).cos();
    let mut q1 = 0.0f64;
    let mut q2 = 0.0f64;
    for &sample in samples {
        let q0 = coeff * q1 - q2 + f64::from(sample);
        q2 = q1;
        q1 = q0;
    }
    q1 * q1 + q2 * q2 - coeff * q1 * q2
}

/// Classify one frame of samples as a DTMF digit, or None.
///
/// Requires a dominant row and column frequency, a minimum absolute energy,
/// and limited twist between the pair.
pub fn detect_frame(samples: &[i16], sample_rate: u32) -> Option<char> {
    if samples.len() < 80 {
        return None;
    }

    let low_powers: Vec<f64> = LOW_FREQS
        .iter()
        .map(|&f| goertzel_power(samples, sample_rate, f))
        .collect();
    let high_powers: Vec<f64> = HIGH_FREQS
        .iter()
        .map(|&f| goertzel_power(samples, sample_rate, f))
        .collect();

    let (low_idx, low_max) = max_index(&low_powers);
    let (high_idx, high_max) = max_index(&high_powers);

    // Absolute energy floor, scaled by frame length
    let threshold = 1.0e7 * (samples.len() as f64 / 160.0);
    if low_max < threshold || high_max < threshold {
        return None;
    }

    // The winning bin must clearly dominate its own group
    for (i, &p) in low_powers.iter().enumerate() {
        if i != low_idx && p > low_max * 0.5 {
            return None;
        }
    }
    for (i, &p) in high_powers.iter().enumerate() {
        if i != high_idx && p > high_max * 0.5 {
            return None;
        }
    }

    // Twist: the two tones must be within ~8 dB of each other
    let twist = low_max / high_max;
    if !(0.15..=6.3).contains(&twist) {
        return None;
    }

    let digit_idx = low_idx * 4 + high_idx;
    Some(DTMF_FREQUENCIES[digit_idx].0)
}

fn max_index(values: &[f64]) -> (usize, f64) {
    let mut idx = 0;
    let mut max = values[0];
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > max {
            idx = i;
            max = v;
        }
    }
    (idx, max)
}

/// Stateful in-band detector enforcing the minimum tone duration and
/// inter-tone gap across successive frames.
#[derive(Debug)]
pub struct DtmfDetector {
    sample_rate: u32,
    /// Minimum sustained tone before a digit is reported (ms)
    min_tone_ms: u32,
    /// Silence required before the same digit may be reported again (ms)
    min_gap_ms: u32,
    current: Option<char>,
    current_ms: u32,
    gap_ms: u32,
    reported: bool,
}

impl DtmfDetector {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            min_tone_ms: 40,
            min_gap_ms: 15,
            current: None,
            current_ms: 0,
            gap_ms: 0,
            reported: false,
        }
    }

    /// Feed one frame of PCM; returns a digit when a complete tone has
    /// been observed. Frames are typically 20 ms (160 samples).
    pub fn process(&mut self, samples: &[i16]) -> Option<char> {
        let frame_ms = (samples.len() as u64 * 1000 / u64::from(self.sample_rate)) as u32;
        let detected = detect_frame(samples, self.sample_rate);

        match (detected, self.current) {
            (Some(d), Some(c)) if d == c => {
                self.current_ms += frame_ms;
                self.gap_ms = 0;
                if !self.reported && self.current_ms >= self.min_tone_ms {
                    self.reported = true;
                    return Some(d);
                }
            }
            (Some(d), _) => {
                // Tone change counts as a gap for the previous digit
                if self.gap_ms >= self.min_gap_ms || self.current != Some(d) {
                    self.current = Some(d);
                    self.current_ms = frame_ms;
                    self.gap_ms = 0;
                    self.reported = false;
                }
            }
            (None, Some(_)) => {
                self.gap_ms += frame_ms;
                if self.gap_ms >= self.min_gap_ms {
                    self.current = None;
                    self.current_ms = 0;
                    self.reported = false;
                }
            }
            (None, None) => {
                self.gap_ms = self.gap_ms.saturating_add(frame_ms);
            }
        }

        None
    }
}

/// Dual-frequency tone synthesis for DTMF playback, the voicemail beep and
/// call-progress tones.
pub struct ToneGenerator {
    pub sample_rate: u32,
}

impl ToneGenerator {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Sum of two sines, scaled to avoid clipping
    pub fn generate(&self, freq_lo: f64, freq_hi: f64, duration_ms: u32) -> Vec<i16> {
        let sample_count = (self.sample_rate as u64 * u64::from(duration_ms) / 1000) as usize;
        let mut samples = Vec::with_capacity(sample_count);

        for i in 0..sample_count {
            let t = i as f64 / self.sample_rate as f64;
            let sample = (2.0 * std::f64::consts::PI * freq_lo * t).sin()
                + (2.0 * std::f64::consts::PI * freq_hi * t).sin();
            samples.push((sample * 16383.0) as i16);
        }

        samples
    }

    pub fn dtmf_digit(&self, digit: char, duration_ms: u32) -> Vec<i16> {
        let entry = DTMF_FREQUENCIES
            .iter()
            .find(|(d, _, _)| *d == digit.to_ascii_uppercase());
        match entry {
            Some(&(_, lo, hi)) => self.generate(lo, hi, duration_ms),
            None => Vec::new(),
        }
    }

    /// One second of US ringback cadence (2 s on / 4 s off overall)
    pub fn ringback_burst(&self) -> Vec<i16> {
        self.generate(440.0, 480.0, 1000)
    }

    /// One busy-tone cadence cycle: 500 ms tone, 500 ms silence
    pub fn busy_cycle(&self) -> Vec<i16> {
        self.cadence(480.0, 620.0, 500, 500)
    }

    /// One reorder (fast busy) cadence cycle: 250 ms tone, 250 ms silence
    pub fn reorder_cycle(&self) -> Vec<i16> {
        self.cadence(480.0, 620.0, 250, 250)
    }

    /// Voicemail record beep
    pub fn beep(&self) -> Vec<i16> {
        self.generate(1000.0, 1000.0, 200)
    }

    fn cadence(&self, lo: f64, hi: f64, on_ms: u32, off_ms: u32) -> Vec<i16> {
        let mut samples = self.generate(lo, hi, on_ms);
        let silence = (self.sample_rate as u64 * u64::from(off_ms) / 1000) as usize;
        samples.extend(std::iter::repeat(0i16).take(silence));
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(digit: char, ms: u32) -> Vec<i16> {
        ToneGenerator::new(8000).dtmf_digit(digit, ms)
    }

    #[test]
    fn test_detect_generated_digits() {
        for &(digit, _, _) in DTMF_FREQUENCIES.iter() {
            let samples = tone(digit, 20);
            assert_eq!(detect_frame(&samples, 8000), Some(digit), "digit {}", digit);
        }
    }

    #[test]
    fn test_silence_not_detected() {
        let silence = vec![0i16; 160];
        assert_eq!(detect_frame(&silence, 8000), None);
    }

    #[test]
    fn test_single_tone_not_detected() {
        let gen = ToneGenerator::new(8000);
        // One frequency only: no valid row/column pair
        let samples = gen.generate(697.0, 697.0, 20);
        // Twist check passes (same bin), but there is no high-group energy
        assert_eq!(detect_frame(&samples, 8000), None);
    }

    #[test]
    fn test_detector_requires_min_duration() {
        let mut detector = DtmfDetector::new(8000);
        // One 20 ms frame is below the 40 ms minimum
        assert_eq!(detector.process(&tone('5', 20)), None);
        // Second frame crosses the threshold
        assert_eq!(detector.process(&tone('5', 20)), Some('5'));
        // Continued tone does not re-report
        assert_eq!(detector.process(&tone('5', 20)), None);
    }

    #[test]
    fn test_detector_gap_then_repeat() {
        let mut detector = DtmfDetector::new(8000);
        assert_eq!(detector.process(&tone('7', 20)), None);
        assert_eq!(detector.process(&tone('7', 20)), Some('7'));
        // 20 ms of silence exceeds the 15 ms gap requirement
        assert_eq!(detector.process(&vec![0i16; 160]), None);
        assert_eq!(detector.process(&tone('7', 20)), None);
        assert_eq!(detector.process(&tone('7', 20)), Some('7'));
    }

    #[test]
    fn test_generate_length() {
        let gen = ToneGenerator::new(8000);
        assert_eq!(gen.dtmf_digit('1', 100).len(), 800);
        assert_eq!(gen.dtmf_digit('x', 100).len(), 0);
    }

    #[test]
    fn test_event_code_mapping() {
        assert_eq!(digit_to_event('0'), Some(0));
        assert_eq!(digit_to_event('*'), Some(10));
        assert_eq!(digit_to_event('#'), Some(11));
        assert_eq!(event_to_digit(5), Some('5'));
        assert_eq!(event_to_digit(16), None);
        assert_eq!(digit_to_event('!'), None);
    }
}
