//! The envelope: the unit the router and sink see (spec §3).
//!
//! `message` is kept as a raw [`serde_json::Value`] rather than a typed
//! struct. The router operates on a generic JSON tree (§9 "Routing
//! without reflection") and the sink serializes `message` back out
//! unchanged, so round-tripping through a concrete struct would risk
//! losing or reordering fields the envelope never needs to understand.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub org_name: String,
    pub message: serde_json::Value,
}

impl Envelope {
    pub fn new(org_name: impl Into<String>, message: serde_json::Value) -> Self {
        Envelope {
            org_name: org_name.into(),
            message,
        }
    }

    /// The Bayeux channel this message was delivered on, if present.
    pub fn channel(&self) -> Option<&str> {
        self.message.get("channel").and_then(|v| v.as_str())
    }

    /// Extracts `message.data.event.{replayId,createdDate}` when both are
    /// present, per the Source Manager contract in §4.E step (2) and the
    /// envelope shape in §3 (`message: {channel, data: {event?}, ...}`).
    pub fn event_marker(&self) -> Option<ReplayMarker> {
        let event = self.message.get("data")?.get("event")?;
        let replay_id = event.get("replayId")?.as_i64()?;
        let created_date = event.get("createdDate")?.as_str()?.to_owned();
        Some(ReplayMarker {
            replay_id,
            created_date,
        })
    }
}

/// `{replayId, createdDate}` (§3). The on-wire format stored in the Replay
/// Store is the same shape (§6: `{"replayId":<int>,"createdDate":"<iso8601>"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMarker {
    #[serde(rename = "replayId")]
    pub replay_id: i64,
    #[serde(rename = "createdDate")]
    pub created_date: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips_message_byte_for_byte() {
        let inbound = json!({
            "channel": "/topic/lead_changes",
            "data": {"sobject": {"Id": "00Q1"}, "event": {"replayId": 42, "createdDate": "2026-01-01T00:00:00.000Z"}}
        });
        let envelope = Envelope::new("my_org", inbound.clone());
        let reserialized = serde_json::to_value(&envelope.message).unwrap();
        assert_eq!(reserialized, inbound);
    }

    #[test]
    fn event_marker_extracts_replay_id_and_created_date() {
        let msg = json!({
            "channel": "/topic/lead_changes",
            "data": {"event": {"replayId": 42, "createdDate": "2026-01-01T00:00:00.000Z"}}
        });
        let envelope = Envelope::new("my_org", msg);
        let marker = envelope.event_marker().unwrap();
        assert_eq!(marker.replay_id, 42);
        assert_eq!(marker.created_date, "2026-01-01T00:00:00.000Z");
    }

    #[test]
    fn event_marker_absent_without_event_field() {
        let msg = json!({"channel": "/topic/lead_changes", "data": {}});
        let envelope = Envelope::new("my_org", msg);
        assert!(envelope.event_marker().is_none());
    }
}
