//! Per-call DTMF routing
//!
//! Three sources feed one ordered digit stream: RFC 2833 events from the
//! relay, SIP INFO bodies, and the in-band detector. A digit repeated by
//! any source within the dedup window is one keypress, not two; phones
//! routinely send 2833 and INFO for the same press.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Where a digit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfSource {
    Rfc2833,
    SipInfo,
    Inband,
}

/// One observed keypress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfDigit {
    pub digit: char,
    pub source: DtmfSource,
}

/// Producer half; the IVR holds the consuming receiver
pub struct DtmfRouter {
    tx: mpsc::Sender<DtmfDigit>,
    dedup_window: Duration,
    last: Option<(char, Instant)>,
    dropped: u64,
}

impl DtmfRouter {
    /// Returns the router and the consumer's receiver
    pub fn new(dedup_window_ms: u64) -> (Self, mpsc::Receiver<DtmfDigit>) {
        // Deep enough that a burst of keypresses never stalls the relay
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                tx,
                dedup_window: Duration::from_millis(dedup_window_ms),
                last: None,
                dropped: 0,
            },
            rx,
        )
    }

    /// Push a digit from any source; duplicates inside the window are
    /// collapsed to the first observation.
    pub fn push(&mut self, digit: char, source: DtmfSource) {
        let now = Instant::now();

        if let Some((last_digit, at)) = self.last {
            if last_digit == digit && now.duration_since(at) < self.dedup_window {
                trace!("Deduplicated {} from {:?}", digit, source);
                return;
            }
        }
        self.last = Some((digit, now));

        match self.tx.try_send(DtmfDigit { digit, source }) {
            Ok(()) => debug!("DTMF {} via {:?}", digit, source),
            Err(_) => {
                // Consumer is gone or wedged; dropping beats blocking the
                // relay task
                self.dropped += 1;
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Digit from a SIP INFO body, either `application/dtmf-relay`
/// (`Signal=<d>` / `Duration=<ms>` lines) or `application/dtmf` (bare digit)
pub fn parse_info_digit(content_type: &str, body: &[u8]) -> Option<char> {
    let text = std::str::from_utf8(body).ok()?;
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    match content_type.as_str() {
        "application/dtmf-relay" => {
            for line in text.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    if key.trim().eq_ignore_ascii_case("Signal") {
                        return normalize_digit(value.trim());
                    }
                }
            }
            None
        }
        "application/dtmf" => normalize_digit(text.trim()),
        _ => None,
    }
}

fn normalize_digit(s: &str) -> Option<char> {
    let mut chars = s.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    match c {
        '0'..='9' | '*' | '#' => Some(c),
        'a'..='d' => Some(c.to_ascii_uppercase()),
        'A'..='D' => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_digits_delivered_in_order() {
        let (mut router, mut rx) = DtmfRouter::new(100);
        router.push('1', DtmfSource::Rfc2833);
        router.push('2', DtmfSource::Rfc2833);
        router.push('3', DtmfSource::SipInfo);

        assert_eq!(rx.recv().await.unwrap().digit, '1');
        assert_eq!(rx.recv().await.unwrap().digit, '2');
        let third = rx.recv().await.unwrap();
        assert_eq!(third.digit, '3');
        assert_eq!(third.source, DtmfSource::SipInfo);
    }

    #[tokio::test]
    async fn test_cross_source_duplicate_collapsed() {
        let (mut router, mut rx) = DtmfRouter::new(100);
        // The same keypress arrives as 2833, INFO and in-band
        router.push('5', DtmfSource::Rfc2833);
        router.push('5', DtmfSource::SipInfo);
        router.push('5', DtmfSource::Inband);

        assert_eq!(rx.recv().await.unwrap().digit, '5');
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeat_after_window_accepted() {
        let (mut router, mut rx) = DtmfRouter::new(10);
        router.push('7', DtmfSource::Rfc2833);
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.push('7', DtmfSource::Rfc2833);

        assert_eq!(rx.recv().await.unwrap().digit, '7');
        assert_eq!(rx.recv().await.unwrap().digit, '7');
    }

    #[tokio::test]
    async fn test_different_digit_inside_window_accepted() {
        let (mut router, mut rx) = DtmfRouter::new(100);
        router.push('1', DtmfSource::Rfc2833);
        router.push('2', DtmfSource::Rfc2833);

        assert_eq!(rx.recv().await.unwrap().digit, '1');
        assert_eq!(rx.recv().await.unwrap().digit, '2');
    }

    #[test]
    fn test_parse_dtmf_relay_body() {
        let body = b"Signal=5\r\nDuration=160\r\n";
        assert_eq!(parse_info_digit("application/dtmf-relay", body), Some('5'));

        let star = b"Signal=*\r\nDuration=100\r\n";
        assert_eq!(parse_info_digit("application/dtmf-relay", star), Some('*'));
    }

    #[test]
    fn test_parse_bare_dtmf_body() {
        assert_eq!(parse_info_digit("application/dtmf", b"#"), Some('#'));
        assert_eq!(parse_info_digit("application/dtmf", b"a"), Some('A'));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_info_digit("application/dtmf", b"12"), None);
        assert_eq!(parse_info_digit("application/dtmf", b"x"), None);
        assert_eq!(parse_info_digit("text/plain", b"5"), None);
        assert_eq!(
            parse_info_digit("application/dtmf-relay", b"Duration=160\r\n"),
            None
        );
    }

    #[test]
    fn test_content_type_parameters_ignored() {
        assert_eq!(
            parse_info_digit("application/dtmf-relay; charset=utf-8", b"Signal=9\r\n"),
            Some('9')
        );
    }
}
