//! SDP session descriptions and offer/answer negotiation
//!
//! Only what a voice PBX needs: `v=/o=/s=/c=/t=/m=/a=` lines, audio
//! m-sections, rtpmap/fmtp/direction attributes. The answer builder
//! intersects the offered payload types with the configured codec
//! preference, keeping the offerer's ordering, and advertises the media
//! relay's address and port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::media::g711::G711Variant;
use crate::{Error, Result};

/// Stream direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    /// The direction the answerer echoes back
    pub fn reversed(&self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => *other,
        }
    }
}

/// `a=rtpmap:` entry
#[derive(Debug, Clone, PartialEq)]
pub struct Rtpmap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
}

/// One `m=` section
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub payload_types: Vec<u8>,
    pub rtpmaps: Vec<Rtpmap>,
    pub fmtp: Vec<(u8, String)>,
    pub direction: Option<Direction>,
    pub connection: Option<IpAddr>,
}

impl MediaDescription {
    pub fn rtpmap(&self, payload_type: u8) -> Option<&Rtpmap> {
        self.rtpmaps.iter().find(|r| r.payload_type == payload_type)
    }

    /// Payload number the peer offered for `telephone-event/8000`
    pub fn telephone_event_payload(&self) -> Option<u8> {
        self.rtpmaps
            .iter()
            .find(|r| r.encoding.eq_ignore_ascii_case("telephone-event"))
            .map(|r| r.payload_type)
    }

    /// True when the section is a hold/disable indication
    pub fn is_disabled(&self) -> bool {
        self.port == 0
            || self.connection == Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// A parsed session description
#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub origin_username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub origin_addr: IpAddr,
    pub session_name: String,
    pub connection: Option<IpAddr>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self> {
        let mut origin_username = "-".to_string();
        let mut session_id = 0u64;
        let mut session_version = 0u64;
        let mut origin_addr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut session_name = String::new();
        let mut connection = None;
        let mut media: Vec<MediaDescription> = Vec::new();
        let mut saw_version = false;

        for raw_line in text.lines() {
            let line = raw_line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| Error::sdp(format!("Malformed line: {}", line)))?;

            match kind {
                "v" => {
                    if value.trim() != "0" {
                        return Err(Error::sdp(format!("Unsupported version: {}", value)));
                    }
                    saw_version = true;
                }
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 6 {
                        return Err(Error::sdp("Short origin line"));
                    }
                    origin_username = parts[0].to_string();
                    session_id = parts[1].parse().unwrap_or(0);
                    session_version = parts[2].parse().unwrap_or(0);
                    origin_addr = parts[5]
                        .parse()
                        .map_err(|_| Error::sdp("Invalid origin address"))?;
                }
                "s" => session_name = value.to_string(),
                "c" => {
                    let addr = parse_connection(value)?;
                    match media.last_mut() {
                        Some(m) => m.connection = Some(addr),
                        None => connection = Some(addr),
                    }
                }
                "m" => {
                    media.push(parse_media_line(value)?);
                }
                "a" => {
                    if let Some(m) = media.last_mut() {
                        parse_media_attribute(m, value);
                    }
                }
                // t=, b=, and anything else we do not act on
                _ => {}
            }
        }

        if !saw_version {
            return Err(Error::sdp("Missing v= line"));
        }
        if media.is_empty() {
            return Err(Error::sdp("No media sections"));
        }

        Ok(Self {
            origin_username,
            session_id,
            session_version,
            origin_addr,
            session_name,
            connection,
            media,
        })
    }

    /// First audio section
    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Where the peer wants its audio sent, if the section is active
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        let audio = self.audio()?;
        if audio.is_disabled() {
            return None;
        }
        let addr = audio.connection.or(self.connection)?;
        Some(SocketAddr::new(addr, audio.port))
    }

    pub fn audio_direction(&self) -> Direction {
        self.audio()
            .and_then(|m| m.direction)
            .unwrap_or(Direction::SendRecv)
    }

    pub fn build(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("v=0\r\n");
        out.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.origin_username, self.session_id, self.session_version, self.origin_addr
        ));
        out.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(addr) = self.connection {
            out.push_str(&format!("c=IN IP4 {}\r\n", addr));
        }
        out.push_str("t=0 0\r\n");

        for m in &self.media {
            let formats: Vec<String> =
                m.payload_types.iter().map(|p| p.to_string()).collect();
            out.push_str(&format!(
                "m={} {} {} {}\r\n",
                m.media_type,
                m.port,
                m.protocol,
                formats.join(" ")
            ));
            if let Some(addr) = m.connection {
                out.push_str(&format!("c=IN IP4 {}\r\n", addr));
            }
            for rtpmap in &m.rtpmaps {
                out.push_str(&format!(
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding, rtpmap.clock_rate
                ));
            }
            for (payload, params) in &m.fmtp {
                out.push_str(&format!("a=fmtp:{} {}\r\n", payload, params));
            }
            if let Some(direction) = m.direction {
                out.push_str(&format!("a={}\r\n", direction.as_str()));
            }
        }

        out
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "IN" {
        return Err(Error::sdp(format!("Malformed connection line: {}", value)));
    }
    if parts[1] != "IP4" {
        return Err(Error::not_supported(format!("Address type {}", parts[1])));
    }
    parts[2]
        .parse()
        .map_err(|_| Error::sdp(format!("Invalid connection address: {}", parts[2])))
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::sdp(format!("Malformed media line: {}", value)));
    }
    let port = parts[1]
        .split('/')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::sdp(format!("Invalid media port: {}", parts[1])))?;
    let payload_types = parts[3..]
        .iter()
        .filter_map(|p| p.parse().ok())
        .collect();

    Ok(MediaDescription {
        media_type: parts[0].to_string(),
        port,
        protocol: parts[2].to_string(),
        payload_types,
        rtpmaps: Vec::new(),
        fmtp: Vec::new(),
        direction: None,
        connection: None,
    })
}

fn parse_media_attribute(media: &mut MediaDescription, value: &str) {
    if let Some(rest) = value.strip_prefix("rtpmap:") {
        if let Some((pt, map)) = rest.split_once(' ') {
            if let Ok(payload_type) = pt.parse::<u8>() {
                let mut spec = map.split('/');
                let encoding = spec.next().unwrap_or_default().to_string();
                let clock_rate = spec.next().and_then(|c| c.parse().ok()).unwrap_or(8000);
                media.rtpmaps.push(Rtpmap {
                    payload_type,
                    encoding,
                    clock_rate,
                });
            }
        }
    } else if let Some(rest) = value.strip_prefix("fmtp:") {
        if let Some((pt, params)) = rest.split_once(' ') {
            if let Ok(payload_type) = pt.parse::<u8>() {
                media.fmtp.push((payload_type, params.to_string()));
            }
        }
    } else if let Some(direction) = Direction::from_str(value.trim()) {
        media.direction = Some(direction);
    }
}

/// Result of negotiating an offer against the local codec preference
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedMedia {
    pub codec: G711Variant,
    pub payload_type: u8,
    /// Payload number for RFC 2833 events, when both sides support them
    pub dtmf_payload_type: Option<u8>,
    pub direction: Direction,
    /// Where the offerer receives audio; None on hold offers
    pub remote_endpoint: Option<SocketAddr>,
}

fn supported_variant(pt: u8, rtpmap: Option<&Rtpmap>) -> Option<G711Variant> {
    // Static payload numbers apply even without an rtpmap
    match rtpmap {
        Some(map) => match map.encoding.to_ascii_uppercase().as_str() {
            "PCMU" => Some(G711Variant::MuLaw),
            "PCMA" => Some(G711Variant::ALaw),
            _ => None,
        },
        None => match pt {
            0 => Some(G711Variant::MuLaw),
            8 => Some(G711Variant::ALaw),
            _ => None,
        },
    }
}

/// Build an answer to `offer`, advertising `local_addr`/`local_port` as the
/// media destination.
///
/// Codec selection keeps the offerer's ordering: the first offered payload
/// that appears in `preference` wins. Unsupported m-lines are answered with
/// port 0 at the same index; hold offers are mirrored.
pub fn build_answer(
    offer: &SessionDescription,
    local_addr: IpAddr,
    local_port: u16,
    preference: &[String],
) -> Result<(SessionDescription, NegotiatedMedia)> {
    let mut negotiated = None;
    let mut answer_media = Vec::with_capacity(offer.media.len());

    for m in &offer.media {
        if m.media_type != "audio" || negotiated.is_some() {
            // Same media type at the same index, refused
            answer_media.push(MediaDescription {
                media_type: m.media_type.clone(),
                port: 0,
                protocol: m.protocol.clone(),
                payload_types: m.payload_types.clone(),
                rtpmaps: Vec::new(),
                fmtp: Vec::new(),
                direction: None,
                connection: None,
            });
            continue;
        }

        let mut selected: Option<(u8, G711Variant)> = None;
        for &pt in &m.payload_types {
            if let Some(variant) = supported_variant(pt, m.rtpmap(pt)) {
                let allowed = preference
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(variant.encoding_name()));
                if allowed {
                    selected = Some((pt, variant));
                    break;
                }
            }
        }

        let (pt, variant) = selected.ok_or_else(|| {
            Error::not_supported("No common audio codec in offer")
        })?;

        let offered_dtmf = m.telephone_event_payload();
        let hold = m.is_disabled();
        let direction = m.direction.unwrap_or(Direction::SendRecv);

        let mut payload_types = vec![pt];
        let mut rtpmaps = vec![Rtpmap {
            payload_type: pt,
            encoding: variant.encoding_name().to_string(),
            clock_rate: 8000,
        }];
        let mut fmtp = Vec::new();

        // telephone-event goes into the answer only when the offer carried
        // it, and always at the offered payload number
        if let Some(event_pt) = offered_dtmf {
            payload_types.push(event_pt);
            rtpmaps.push(Rtpmap {
                payload_type: event_pt,
                encoding: "telephone-event".to_string(),
                clock_rate: 8000,
            });
            fmtp.push((event_pt, "0-16".to_string()));
        }

        answer_media.push(MediaDescription {
            media_type: "audio".to_string(),
            port: if hold { 0 } else { local_port },
            protocol: m.protocol.clone(),
            payload_types,
            rtpmaps,
            fmtp,
            direction: Some(direction.reversed()),
            connection: None,
        });

        negotiated = Some(NegotiatedMedia {
            codec: variant,
            payload_type: pt,
            dtmf_payload_type: offered_dtmf,
            direction,
            remote_endpoint: if hold {
                None
            } else {
                m.connection
                    .or(offer.connection)
                    .map(|addr| SocketAddr::new(addr, m.port))
            },
        });
    }

    let negotiated =
        negotiated.ok_or_else(|| Error::not_supported("Offer carries no audio"))?;

    let answer = SessionDescription {
        origin_username: "-".to_string(),
        session_id: rand::random::<u32>() as u64,
        session_version: 1,
        origin_addr: local_addr,
        session_name: "redfire-pbx".to_string(),
        connection: Some(local_addr),
        media: answer_media,
    };

    Ok((answer, negotiated))
}

/// Build a fresh offer toward a callee, listing every configured codec
pub fn build_offer(
    local_addr: IpAddr,
    local_port: u16,
    preference: &[String],
    dtmf_payload_type: u8,
) -> SessionDescription {
    let mut payload_types = Vec::new();
    let mut rtpmaps = Vec::new();

    for name in preference {
        let variant = match name.to_ascii_uppercase().as_str() {
            "PCMU" => G711Variant::MuLaw,
            "PCMA" => G711Variant::ALaw,
            _ => continue,
        };
        payload_types.push(variant.payload_type());
        rtpmaps.push(Rtpmap {
            payload_type: variant.payload_type(),
            encoding: variant.encoding_name().to_string(),
            clock_rate: 8000,
        });
    }

    payload_types.push(dtmf_payload_type);
    rtpmaps.push(Rtpmap {
        payload_type: dtmf_payload_type,
        encoding: "telephone-event".to_string(),
        clock_rate: 8000,
    });

    SessionDescription {
        origin_username: "-".to_string(),
        session_id: rand::random::<u32>() as u64,
        session_version: 1,
        origin_addr: local_addr,
        session_name: "redfire-pbx".to_string(),
        connection: Some(local_addr),
        media: vec![MediaDescription {
            media_type: "audio".to_string(),
            port: local_port,
            protocol: "RTP/AVP".to_string(),
            payload_types,
            rtpmaps,
            fmtp: vec![(dtmf_payload_type, "0-16".to_string())],
            direction: Some(Direction::SendRecv),
            connection: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs() -> Vec<String> {
        vec!["PCMU".to_string(), "PCMA".to_string()]
    }

    const OFFER: &str = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 192.168.1.10\r\n\
        s=-\r\n\
        c=IN IP4 192.168.1.10\r\n\
        t=0 0\r\n\
        m=audio 40000 RTP/AVP 0 8 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=fmtp:101 0-16\r\n\
        a=sendrecv\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.origin_username, "alice");
        assert_eq!(sdp.connection, Some("192.168.1.10".parse().unwrap()));
        let audio = sdp.audio().unwrap();
        assert_eq!(audio.port, 40000);
        assert_eq!(audio.payload_types, vec![0, 8, 101]);
        assert_eq!(audio.telephone_event_payload(), Some(101));
        assert_eq!(
            sdp.audio_endpoint(),
            Some("192.168.1.10:40000".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_build_roundtrip() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        let rebuilt = SessionDescription::parse(&sdp.build()).unwrap();
        assert_eq!(rebuilt.connection, sdp.connection);
        let (a, b) = (rebuilt.audio().unwrap(), sdp.audio().unwrap());
        assert_eq!(a.port, b.port);
        assert_eq!(a.payload_types, b.payload_types);
        assert_eq!(a.rtpmaps, b.rtpmaps);
        assert_eq!(a.direction, b.direction);
    }

    #[test]
    fn test_answer_selects_first_offered_codec() {
        let offer = SessionDescription::parse(OFFER).unwrap();
        let (answer, negotiated) = build_answer(
            &offer,
            "192.168.1.14".parse().unwrap(),
            10020,
            &prefs(),
        )
        .unwrap();

        assert_eq!(negotiated.codec, G711Variant::MuLaw);
        assert_eq!(negotiated.payload_type, 0);
        assert_eq!(negotiated.dtmf_payload_type, Some(101));
        assert_eq!(
            negotiated.remote_endpoint,
            Some("192.168.1.10:40000".parse().unwrap())
        );

        let audio = answer.audio().unwrap();
        assert_eq!(audio.port, 10020);
        assert_eq!(audio.payload_types, vec![0, 101]);
        assert_eq!(audio.direction, Some(Direction::SendRecv));
    }

    #[test]
    fn test_answer_respects_offer_order() {
        let offer_text = OFFER.replace("RTP/AVP 0 8 101", "RTP/AVP 8 0 101");
        let offer = SessionDescription::parse(&offer_text).unwrap();
        let (_, negotiated) = build_answer(
            &offer,
            "192.168.1.14".parse().unwrap(),
            10020,
            &prefs(),
        )
        .unwrap();
        assert_eq!(negotiated.codec, G711Variant::ALaw);
        assert_eq!(negotiated.payload_type, 8);
    }

    #[test]
    fn test_answer_without_telephone_event() {
        let offer_text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.5\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.5\r\n\
            t=0 0\r\n\
            m=audio 5004 RTP/AVP 0\r\n";
        let offer = SessionDescription::parse(offer_text).unwrap();
        let (answer, negotiated) = build_answer(
            &offer,
            "192.168.1.14".parse().unwrap(),
            10020,
            &prefs(),
        )
        .unwrap();
        assert_eq!(negotiated.dtmf_payload_type, None);
        assert_eq!(answer.audio().unwrap().payload_types, vec![0]);
    }

    #[test]
    fn test_no_common_codec_rejected() {
        let offer_text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.5\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.5\r\n\
            t=0 0\r\n\
            m=audio 5004 RTP/AVP 96\r\n\
            a=rtpmap:96 opus/48000\r\n";
        let offer = SessionDescription::parse(offer_text).unwrap();
        assert!(build_answer(
            &offer,
            "192.168.1.14".parse().unwrap(),
            10020,
            &prefs(),
        )
        .is_err());
    }

    #[test]
    fn test_hold_offer_mirrored() {
        let offer_text = OFFER
            .replace("c=IN IP4 192.168.1.10", "c=IN IP4 0.0.0.0")
            .replace("a=sendrecv", "a=sendonly");
        let offer = SessionDescription::parse(&offer_text).unwrap();
        let (answer, negotiated) = build_answer(
            &offer,
            "192.168.1.14".parse().unwrap(),
            10020,
            &prefs(),
        )
        .unwrap();

        assert_eq!(negotiated.remote_endpoint, None);
        assert_eq!(negotiated.direction, Direction::SendOnly);
        assert_eq!(answer.audio().unwrap().port, 0);
        assert_eq!(answer.audio().unwrap().direction, Some(Direction::RecvOnly));
    }

    #[test]
    fn test_unsupported_mline_gets_port_zero() {
        let offer_text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.5\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.5\r\n\
            t=0 0\r\n\
            m=audio 5004 RTP/AVP 0\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            m=video 5006 RTP/AVP 97\r\n\
            a=rtpmap:97 H264/90000\r\n";
        let offer = SessionDescription::parse(offer_text).unwrap();
        let (answer, _) = build_answer(
            &offer,
            "192.168.1.14".parse().unwrap(),
            10020,
            &prefs(),
        )
        .unwrap();

        assert_eq!(answer.media.len(), 2);
        assert_eq!(answer.media[1].media_type, "video");
        assert_eq!(answer.media[1].port, 0);
    }

    #[test]
    fn test_build_offer_lists_preference() {
        let offer = build_offer("192.168.1.14".parse().unwrap(), 10100, &prefs(), 101);
        let audio = offer.audio().unwrap();
        assert_eq!(audio.payload_types, vec![0, 8, 101]);
        assert_eq!(audio.port, 10100);

        // And it parses back
        let reparsed = SessionDescription::parse(&offer.build()).unwrap();
        assert_eq!(reparsed.audio().unwrap().payload_types, vec![0, 8, 101]);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(SessionDescription::parse("not sdp").is_err());
        assert!(SessionDescription::parse("v=1\r\n").is_err());
        assert!(SessionDescription::parse("v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=-\r\n").is_err());
    }
}
