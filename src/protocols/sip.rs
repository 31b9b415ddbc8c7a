//! RFC 3261 message parsing and construction
//!
//! Header names are matched case-insensitively and compact forms are
//! normalized on parse. `Via` and `Record-Route` ordering is preserved
//! exactly as received; builders emit headers in a fixed order so output
//! is deterministic.

use std::fmt;

use bytes::Bytes;

use crate::{Error, Result};

/// SIP request methods understood by the PBX
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Refer,
    Notify,
    Update,
}

impl SipMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INVITE" => Some(Self::Invite),
            "ACK" => Some(Self::Ack),
            "BYE" => Some(Self::Bye),
            "CANCEL" => Some(Self::Cancel),
            "REGISTER" => Some(Self::Register),
            "OPTIONS" => Some(Self::Options),
            "INFO" => Some(Self::Info),
            "REFER" => Some(Self::Refer),
            "NOTIFY" => Some(Self::Notify),
            "UPDATE" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Register => "REGISTER",
            Self::Options => "OPTIONS",
            Self::Info => "INFO",
            Self::Refer => "REFER",
            Self::Notify => "NOTIFY",
            Self::Update => "UPDATE",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One header field, order-preserving
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A parsed SIP request or response
#[derive(Debug, Clone)]
pub struct SipMessage {
    /// Set for requests
    pub method: Option<SipMethod>,
    /// Request-URI, set for requests
    pub uri: Option<String>,
    /// Set for responses
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl SipMessage {
    pub fn new_request<S: Into<String>>(method: SipMethod, uri: S) -> Self {
        Self {
            method: Some(method),
            uri: Some(uri.into()),
            status: None,
            reason: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn new_response(status: u16, reason: &str) -> Self {
        Self {
            method: None,
            uri: None,
            status: Some(status),
            reason: Some(reason.to_string()),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Build a response to a request, copying the headers RFC 3261 §8.2.6
    /// requires: all Via (in order), From, To, Call-ID, CSeq.
    pub fn response_to(request: &SipMessage, status: u16, reason: &str) -> Self {
        let mut response = Self::new_response(status, reason);
        for via in request.header_values("Via") {
            response.add_header("Via", via);
        }
        for rr in request.header_values("Record-Route") {
            response.add_header("Record-Route", rr);
        }
        if let Some(from) = request.header("From") {
            response.add_header("From", from);
        }
        if let Some(to) = request.header("To") {
            response.add_header("To", to);
        }
        if let Some(call_id) = request.header("Call-ID") {
            response.add_header("Call-ID", call_id);
        }
        if let Some(cseq) = request.header("CSeq") {
            response.add_header("CSeq", cseq);
        }
        response
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    // -- headers ----------------------------------------------------------

    pub fn add_header<S: Into<String>>(&mut self, name: &str, value: S) {
        self.headers.push(Header {
            name: canonical_header_name(name),
            value: value.into(),
        });
    }

    /// Replace the first occurrence, or append
    pub fn set_header<S: Into<String>>(&mut self, name: &str, value: S) {
        let canonical = canonical_header_name(name);
        for header in &mut self.headers {
            if header.name.eq_ignore_ascii_case(&canonical) {
                header.value = value.into();
                return;
            }
        }
        self.headers.push(Header {
            name: canonical,
            value: value.into(),
        });
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let canonical = canonical_header_name(name);
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(&canonical))
            .map(|h| h.value.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let canonical = canonical_header_name(name);
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(&canonical))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn remove_headers(&mut self, name: &str) {
        let canonical = canonical_header_name(name);
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(&canonical));
    }

    pub fn set_body(&mut self, content_type: &str, body: Bytes) {
        self.set_header("Content-Type", content_type);
        self.body = body;
    }

    // -- common accessors -------------------------------------------------

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// (sequence, method) from the CSeq header
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::from_str(parts.next()?)?;
        Some((seq, method))
    }

    pub fn from_header(&self) -> Option<NameAddr> {
        self.header("From").and_then(NameAddr::parse)
    }

    pub fn to_header(&self) -> Option<NameAddr> {
        self.header("To").and_then(NameAddr::parse)
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|a| a.param("tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|a| a.param("tag"))
    }

    pub fn contact(&self) -> Option<NameAddr> {
        self.header("Contact").and_then(NameAddr::parse)
    }

    pub fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// Branch parameter of the top Via
    pub fn top_via_branch(&self) -> Option<String> {
        let via = self.header("Via")?;
        via.split(';')
            .skip(1)
            .find_map(|p| p.trim().strip_prefix("branch="))
            .map(|b| b.to_string())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    // -- wire format ------------------------------------------------------

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::sip("Message is not valid UTF-8"))?;

        let (head, body) = match text.find("\r\n\r\n") {
            Some(idx) => (&text[..idx], &data[idx + 4..]),
            None => (text.trim_end_matches("\r\n"), &[][..]),
        };

        let mut lines = head.split("\r\n");
        let start_line = lines.next().ok_or_else(|| Error::sip("Empty message"))?;

        let mut message = Self::parse_start_line(start_line)?;

        // Unfold continuation lines, then split each header at the first colon
        let mut unfolded: Vec<String> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = unfolded.last_mut() {
                    last.push(' ');
                    last.push_str(line.trim_start());
                }
            } else {
                unfolded.push(line.to_string());
            }
        }

        for line in &unfolded {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::sip(format!("Malformed header line: {}", line)))?;
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                return Err(Error::sip(format!("Malformed header name: {}", name)));
            }
            message.add_header(name, value.trim());
        }

        // Content-Length, when present, bounds the body
        let body = match message.header("Content-Length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| Error::sip("Invalid Content-Length"))?;
                if len > body.len() {
                    return Err(Error::sip("Body shorter than Content-Length"));
                }
                &body[..len]
            }
            None => body,
        };

        message.body = Bytes::copy_from_slice(body);
        Ok(message)
    }

    fn parse_start_line(line: &str) -> Result<Self> {
        if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest
                .split_once(' ')
                .map(|(c, r)| (c, r.to_string()))
                .unwrap_or((rest, String::new()));
            let status: u16 = code
                .parse()
                .map_err(|_| Error::sip(format!("Invalid status line: {}", line)))?;
            if !(100..700).contains(&status) {
                return Err(Error::sip(format!("Status code out of range: {}", status)));
            }
            Ok(Self {
                method: None,
                uri: None,
                status: Some(status),
                reason: Some(reason),
                headers: Vec::new(),
                body: Bytes::new(),
            })
        } else {
            let mut parts = line.split(' ');
            let method_str = parts.next().unwrap_or_default();
            let uri = parts.next().ok_or_else(|| Error::sip("Request line missing URI"))?;
            let version = parts.next().ok_or_else(|| Error::sip("Request line missing version"))?;
            if version != "SIP/2.0" {
                return Err(Error::sip(format!("Unsupported SIP version: {}", version)));
            }
            let method = SipMethod::from_str(method_str)
                .ok_or_else(|| Error::not_supported(format!("Method {}", method_str)))?;
            Ok(Self::new_request(method, uri))
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(512 + self.body.len());

        match (&self.method, &self.status) {
            (Some(method), _) => {
                out.push_str(method.as_str());
                out.push(' ');
                out.push_str(self.uri.as_deref().unwrap_or_default());
                out.push_str(" SIP/2.0\r\n");
            }
            (None, Some(status)) => {
                let reason = self
                    .reason
                    .clone()
                    .unwrap_or_else(|| reason_phrase(*status).to_string());
                out.push_str(&format!("SIP/2.0 {} {}\r\n", status, reason));
            }
            (None, None) => {}
        }

        let mut wrote_length = false;
        for header in &self.headers {
            if header.name.eq_ignore_ascii_case("Content-Length") {
                wrote_length = true;
                out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
            } else {
                out.push_str(&format!("{}: {}\r\n", header.name, header.value));
            }
        }
        if !wrote_length {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }

        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        Bytes::from(bytes)
    }
}

/// Expand compact header forms and normalize well-known capitalization
pub fn canonical_header_name(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "i" | "call-id" => "Call-ID".to_string(),
        "f" | "from" => "From".to_string(),
        "t" | "to" => "To".to_string(),
        "v" | "via" => "Via".to_string(),
        "m" | "contact" => "Contact".to_string(),
        "c" | "content-type" => "Content-Type".to_string(),
        "l" | "content-length" => "Content-Length".to_string(),
        "e" | "content-encoding" => "Content-Encoding".to_string(),
        "k" | "supported" => "Supported".to_string(),
        "s" | "subject" => "Subject".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        "record-route" => "Record-Route".to_string(),
        "refer-to" => "Refer-To".to_string(),
        "referred-by" => "Referred-By".to_string(),
        "max-forwards" => "Max-Forwards".to_string(),
        "min-expires" => "Min-Expires".to_string(),
        "user-agent" => "User-Agent".to_string(),
        "proxy-authenticate" => "Proxy-Authenticate".to_string(),
        "proxy-authorization" => "Proxy-Authorization".to_string(),
        other => {
            // Title-Case each dash-separated part
            other
                .split('-')
                .map(|part| {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join("-")
        }
    }
}

/// Standard reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        415 => "Unsupported Media Type",
        420 => "Bad Extension",
        422 => "Session Interval Too Small",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "Unknown",
    }
}

/// A `name-addr` / `addr-spec` header value: display name, URI, parameters
#[derive(Debug, Clone, PartialEq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
    pub params: Vec<(String, String)>,
}

impl NameAddr {
    pub fn new(uri: &str) -> Self {
        Self {
            display_name: None,
            uri: uri.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with_tag(uri: &str, tag: &str) -> Self {
        Self {
            display_name: None,
            uri: uri.to_string(),
            params: vec![("tag".to_string(), tag.to_string())],
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();

        let (display_name, rest) = if let Some(idx) = value.find('<') {
            let display = value[..idx].trim().trim_matches('"');
            let display = if display.is_empty() {
                None
            } else {
                Some(display.to_string())
            };
            (display, &value[idx..])
        } else {
            (None, value)
        };

        let (uri, param_str) = if let Some(rest) = rest.strip_prefix('<') {
            let end = rest.find('>')?;
            (rest[..end].to_string(), rest[end + 1..].to_string())
        } else {
            // addr-spec form: parameters after the first semicolon belong
            // to the header, not the URI
            match rest.split_once(';') {
                Some((uri, params)) => (uri.trim().to_string(), format!(";{}", params)),
                None => (rest.trim().to_string(), String::new()),
            }
        };

        let params = param_str
            .split(';')
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                let p = p.trim();
                match p.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.trim_matches('"').to_string()),
                    None => (p.to_string(), String::new()),
                }
            })
            .collect();

        Some(Self {
            display_name,
            uri,
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<String> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn set_param(&mut self, name: &str, value: &str) {
        for (k, v) in &mut self.params {
            if k.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.params.push((name.to_string(), value.to_string()));
    }

    /// User part of the URI, e.g. `1001` from `sip:1001@pbx`
    pub fn user(&self) -> Option<&str> {
        uri_user(&self.uri)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (k, v) in &self.params {
            if v.is_empty() {
                write!(f, ";{}", k)?;
            } else {
                write!(f, ";{}={}", k, v)?;
            }
        }
        Ok(())
    }
}

/// User part of a SIP URI
pub fn uri_user(uri: &str) -> Option<&str> {
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))?;
    let end = rest.find('@')?;
    Some(&rest[..end])
}

/// Host and optional port of a SIP URI (parameters stripped)
pub fn uri_host_port(uri: &str) -> Option<(String, Option<u16>)> {
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    let host_part = rest.split('@').last()?;
    let host_part = host_part.split(';').next()?;
    match host_part.split_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), Some(port)))
        }
        None => Some((host_part.to_string(), None)),
    }
}

/// Generate a dialog tag
pub fn generate_tag() -> String {
    format!("{:x}", rand::random::<u64>())
}

/// Generate an RFC 3261 branch with the mandated magic cookie
pub fn generate_branch() -> String {
    format!("z9hG4bK{:x}", rand::random::<u64>())
}

/// Generate a Call-ID scoped to the given host
pub fn generate_call_id(host: &str) -> String {
    format!("{:x}@{}", rand::random::<u128>(), host)
}
