//! SIP dialog state
//!
//! A dialog is the (Call-ID, local tag, remote tag) triple plus the CSeq
//! discipline and route set that in-dialog requests need. The B2BUA owns
//! two of these per call, one per leg.

use crate::protocols::sip::{generate_tag, NameAddr, SipMessage, SipMethod};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// Our address, rendered into From (UAC) or To (UAS)
    pub local_uri: NameAddr,
    /// Peer address
    pub remote_uri: NameAddr,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub route_set: Vec<String>,
    /// Where in-dialog requests go: the peer's Contact
    pub remote_target: String,
    pub state: DialogState,
    pub secure: bool,
}

impl Dialog {
    /// Build the UAS side from an incoming INVITE. The dialog is Early
    /// until we send a 2xx.
    pub fn new_uas(invite: &SipMessage) -> Result<Self> {
        let call_id = invite
            .call_id()
            .ok_or_else(|| Error::sip("INVITE missing Call-ID"))?
            .to_string();
        let from = invite
            .from_header()
            .ok_or_else(|| Error::sip("INVITE missing From"))?;
        let to = invite
            .to_header()
            .ok_or_else(|| Error::sip("INVITE missing To"))?;
        let remote_tag = from.param("tag");
        let (remote_cseq, _) = invite
            .cseq()
            .ok_or_else(|| Error::sip("INVITE missing CSeq"))?;

        let remote_target = invite
            .contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| from.uri.clone());

        // UAS takes Record-Route in message order
        let route_set = invite
            .header_values("Record-Route")
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut local_uri = NameAddr::new(&to.uri);
        local_uri.display_name = to.display_name.clone();

        Ok(Self {
            call_id,
            local_tag: generate_tag(),
            remote_tag,
            local_uri,
            remote_uri: from,
            local_cseq: 0,
            remote_cseq,
            route_set,
            remote_target,
            state: DialogState::Early,
            secure: invite.uri.as_deref().is_some_and(|u| u.starts_with("sips:")),
        })
    }

    /// Build the UAC side from our request and the first tagged response
    pub fn new_uac(request: &SipMessage, response: &SipMessage) -> Result<Self> {
        let call_id = request
            .call_id()
            .ok_or_else(|| Error::sip("Request missing Call-ID"))?
            .to_string();
        let from = request
            .from_header()
            .ok_or_else(|| Error::sip("Request missing From"))?;
        let to = response
            .to_header()
            .ok_or_else(|| Error::sip("Response missing To"))?;
        let local_tag = from
            .param("tag")
            .ok_or_else(|| Error::sip("Request From has no tag"))?;
        let (local_cseq, _) = request
            .cseq()
            .ok_or_else(|| Error::sip("Request missing CSeq"))?;

        let remote_target = response
            .contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| to.uri.clone());

        // UAC reverses Record-Route
        let mut route_set: Vec<String> = response
            .header_values("Record-Route")
            .iter()
            .map(|s| s.to_string())
            .collect();
        route_set.reverse();

        let state = match response.status {
            Some(s) if s >= 200 => DialogState::Confirmed,
            _ => DialogState::Early,
        };

        Ok(Self {
            call_id,
            local_tag,
            remote_tag: to.param("tag"),
            local_uri: from,
            remote_uri: to,
            local_cseq,
            remote_cseq: 0,
            route_set,
            remote_target,
            state,
            secure: request.uri.as_deref().is_some_and(|u| u.starts_with("sips:")),
        })
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    /// Sequence numbers advance only for requests we originate
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Enforce remote CSeq ordering; requests may not go backwards
    pub fn accept_remote_cseq(&mut self, message: &SipMessage) -> bool {
        match message.cseq() {
            Some((seq, method)) => {
                // ACK and CANCEL reuse the INVITE sequence number
                if method == SipMethod::Ack || method == SipMethod::Cancel {
                    return seq == self.remote_cseq;
                }
                if seq <= self.remote_cseq {
                    return false;
                }
                self.remote_cseq = seq;
                true
            }
            None => false,
        }
    }

    /// Build an in-dialog request with the dialog's addressing
    pub fn create_request(&mut self, method: SipMethod) -> SipMessage {
        let cseq = match method {
            // ACK mirrors the INVITE CSeq, it does not advance
            SipMethod::Ack => self.local_cseq,
            _ => self.next_cseq(),
        };

        let mut request = SipMessage::new_request(method, self.remote_target.clone());

        let mut from = NameAddr::new(&self.local_uri.uri);
        from.display_name = self.local_uri.display_name.clone();
        from.set_param("tag", &self.local_tag);

        let mut to = NameAddr::new(&self.remote_uri.uri);
        to.display_name = self.remote_uri.display_name.clone();
        if let Some(tag) = &self.remote_tag {
            to.set_param("tag", tag);
        }

        request.add_header("Max-Forwards", "70");
        request.add_header("From", from.to_string());
        request.add_header("To", to.to_string());
        request.add_header("Call-ID", self.call_id.clone());
        request.add_header("CSeq", format!("{} {}", cseq, method.as_str()));
        for route in &self.route_set {
            request.add_header("Route", route.clone());
        }

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite() -> SipMessage {
        let text = "INVITE sip:1002@pbx.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKabc\r\n\
            Max-Forwards: 70\r\n\
            To: <sip:1002@pbx.local>\r\n\
            From: <sip:1001@pbx.local>;tag=caller1\r\n\
            Call-ID: dlg@192.168.1.10\r\n\
            CSeq: 10 INVITE\r\n\
            Contact: <sip:1001@192.168.1.10:5060>\r\n\
            Content-Length: 0\r\n\r\n";
        SipMessage::parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_uas_dialog_from_invite() {
        let invite = sample_invite();
        let dialog = Dialog::new_uas(&invite).unwrap();

        assert_eq!(dialog.call_id, "dlg@192.168.1.10");
        assert_eq!(dialog.remote_tag.as_deref(), Some("caller1"));
        assert!(!dialog.local_tag.is_empty());
        assert_eq!(dialog.remote_cseq, 10);
        assert_eq!(dialog.remote_target, "sip:1001@192.168.1.10:5060");
        assert_eq!(dialog.state, DialogState::Early);
    }

    #[test]
    fn test_uas_in_dialog_request() {
        let invite = sample_invite();
        let mut dialog = Dialog::new_uas(&invite).unwrap();
        dialog.confirm();

        let bye = dialog.create_request(SipMethod::Bye);
        assert_eq!(bye.method, Some(SipMethod::Bye));
        assert_eq!(bye.uri.as_deref(), Some("sip:1001@192.168.1.10:5060"));
        assert_eq!(bye.call_id(), Some("dlg@192.168.1.10"));
        assert_eq!(bye.cseq(), Some((1, SipMethod::Bye)));
        // Our tag on From, theirs on To
        assert_eq!(bye.from_tag().as_deref(), Some(dialog.local_tag.as_str()));
        assert_eq!(bye.to_tag().as_deref(), Some("caller1"));
    }

    #[test]
    fn test_uac_dialog_from_response() {
        let mut request = SipMessage::new_request(SipMethod::Invite, "sip:1002@pbx.local");
        request.add_header("From", "<sip:pbx@pbx.local>;tag=uac1");
        request.add_header("To", "<sip:1002@pbx.local>");
        request.add_header("Call-ID", "uacdlg@pbx");
        request.add_header("CSeq", "1 INVITE");

        let text = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP pbx:5060;branch=z9hG4bKx\r\n\
            From: <sip:pbx@pbx.local>;tag=uac1\r\n\
            To: <sip:1002@pbx.local>;tag=callee9\r\n\
            Call-ID: uacdlg@pbx\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:1002@192.168.1.20:5060>\r\n\
            Record-Route: <sip:proxy1;lr>\r\n\
            Record-Route: <sip:proxy2;lr>\r\n\
            Content-Length: 0\r\n\r\n";
        let response = SipMessage::parse(text.as_bytes()).unwrap();

        let dialog = Dialog::new_uac(&request, &response).unwrap();
        assert_eq!(dialog.local_tag, "uac1");
        assert_eq!(dialog.remote_tag.as_deref(), Some("callee9"));
        assert_eq!(dialog.remote_target, "sip:1002@192.168.1.20:5060");
        assert_eq!(dialog.state, DialogState::Confirmed);
        // Route set reversed for the UAC
        assert_eq!(dialog.route_set, vec!["<sip:proxy2;lr>", "<sip:proxy1;lr>"]);
    }

    #[test]
    fn test_remote_cseq_ordering() {
        let invite = sample_invite();
        let mut dialog = Dialog::new_uas(&invite).unwrap();

        let mut bye = SipMessage::new_request(SipMethod::Bye, "sip:1002@pbx");
        bye.add_header("CSeq", "11 BYE");
        assert!(dialog.accept_remote_cseq(&bye));

        // Replay of the same sequence is rejected
        assert!(!dialog.accept_remote_cseq(&bye));

        let mut stale = SipMessage::new_request(SipMethod::Info, "sip:1002@pbx");
        stale.add_header("CSeq", "5 INFO");
        assert!(!dialog.accept_remote_cseq(&stale));
    }

    #[test]
    fn test_ack_reuses_invite_cseq() {
        let invite = sample_invite();
        let mut dialog = Dialog::new_uas(&invite).unwrap();

        let mut ack = SipMessage::new_request(SipMethod::Ack, "sip:1002@pbx");
        ack.add_header("CSeq", "10 ACK");
        assert!(dialog.accept_remote_cseq(&ack));
    }
}
