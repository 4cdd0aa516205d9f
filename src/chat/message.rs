//! Wire format of the chat feed.
//!
//! Inbound frames are JSON envelopes carrying a `data` array of events.
//! Only `messageReceived` events become chat messages; presence and
//! status events are ignored. Outbound sends use the `rooms/sendMessage`
//! procedure frame.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

/// A chat message received from the feed.
///
/// Identity is `id`: two events with the same id are retransmissions of
/// the same logical message, whatever their sequence numbers say.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub sequence_number: u64,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    message_text: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    sequence_number: Option<u64>,
    /// Epoch seconds.
    #[serde(default)]
    time: Option<i64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Parse a raw frame into the chat messages it carries for `room_id`.
///
/// Events of other types (`onlinestatus`, typing indicators) and events
/// for other rooms are silently skipped. A malformed frame is an error;
/// the caller logs and drops it.
pub fn parse_envelope(raw: &str, room_id: &str) -> Result<Vec<InboundMessage>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    let mut messages = Vec::new();
    for event in envelope.data {
        if event.kind.as_deref() != Some("messageReceived") {
            continue;
        }
        if event.room_id.as_deref() != Some(room_id) {
            continue;
        }
        let (Some(id), Some(text)) = (event.message_id, event.message_text) else {
            continue;
        };
        let received_at = event
            .time
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);
        messages.push(InboundMessage {
            id,
            sequence_number: event.sequence_number.unwrap_or(0),
            room_id: room_id.to_string(),
            sender_id: event.sender_id.unwrap_or_default(),
            sender_name: event.sender_name.unwrap_or_default(),
            text,
            received_at,
        });
    }
    Ok(messages)
}

/// Build an outbound `rooms/sendMessage` frame.
pub fn send_frame(room_id: &str, text: &str) -> String {
    json!({
        "proc": "rooms/sendMessage",
        "data": {
            "roomId": [room_id],
            "messageText": [text],
        },
        "v": 4,
    })
    .to_string()
}
