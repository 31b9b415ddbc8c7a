//! Webhook emission interface
//!
//! The delivery mechanism (HTTP, queue, bus) lives outside the core; the
//! call manager only needs fire-and-forget `emit`. Failures are the
//! emitter's problem, never the call's.

use serde_json::json;

use crate::services::cdr::Disposition;

/// Fire-and-forget event sink for external integrations
pub trait WebhookEmitter: Send + Sync {
    fn emit(&self, event_type: &str, payload: serde_json::Value);
}

/// Default emitter: events go nowhere
#[derive(Default)]
pub struct NullWebhookEmitter;

impl WebhookEmitter for NullWebhookEmitter {
    fn emit(&self, _event_type: &str, _payload: serde_json::Value) {}
}

/// Render the standard call-lifecycle payloads
pub fn call_started_payload(call_id: &str, caller: &str, callee: &str) -> serde_json::Value {
    json!({
        "call_id": call_id,
        "caller": caller,
        "callee": callee,
    })
}

pub fn call_ended_payload(
    call_id: &str,
    disposition: Disposition,
    duration_secs: Option<u64>,
) -> serde_json::Value {
    json!({
        "call_id": call_id,
        "disposition": disposition.to_string(),
        "duration_secs": duration_secs,
    })
}

pub fn registration_payload(extension: &str, contact: &str) -> serde_json::Value {
    json!({
        "extension": extension,
        "contact": contact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingEmitter {
        seen: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl WebhookEmitter for CapturingEmitter {
        fn emit(&self, event_type: &str, payload: serde_json::Value) {
            self.seen
                .lock()
                .unwrap()
                .push((event_type.to_string(), payload));
        }
    }

    #[test]
    fn test_payload_shapes() {
        let started = call_started_payload("c1", "1001", "1002");
        assert_eq!(started["caller"], "1001");

        let ended = call_ended_payload("c1", Disposition::Answered, Some(42));
        assert_eq!(ended["disposition"], "answered");
        assert_eq!(ended["duration_secs"], 42);

        let ended_unanswered = call_ended_payload("c1", Disposition::NoAnswer, None);
        assert!(ended_unanswered["duration_secs"].is_null());
    }

    #[test]
    fn test_custom_emitter_receives_events() {
        let emitter = CapturingEmitter {
            seen: Mutex::new(Vec::new()),
        };
        emitter.emit("call.started", call_started_payload("c1", "1001", "1002"));
        emitter.emit("registration", registration_payload("1001", "sip:1001@10.0.0.5"));

        let seen = emitter.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "call.started");
    }

    #[test]
    fn test_null_emitter_is_silent() {
        NullWebhookEmitter.emit("anything", json!({}));
    }
}
