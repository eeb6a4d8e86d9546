//! NDJSON framing between the client and the session.
//!
//! One JSON envelope per line in both directions: inbound lines become
//! session events, outbound messages are serialized back to single lines.
//! A malformed line is logged and skipped, never fatal.

use base64::{Engine as _, engine::general_purpose};
use roleplay_core::session::SessionEvent;
use roleplay_core::{InboundMessage, OutboundMessage};

/// Parse one inbound line. Blank and malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<SessionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<InboundMessage>(line) {
        Ok(message) => to_event(message),
        Err(e) => {
            tracing::warn!("Ignoring malformed client message: {:?}", e);
            None
        }
    }
}

fn to_event(message: InboundMessage) -> Option<SessionEvent> {
    match message {
        InboundMessage::Stop => Some(SessionEvent::Stop),
        InboundMessage::ChangeCharacter { character_id } => {
            Some(SessionEvent::ChangePersona(character_id))
        }
        InboundMessage::TextMessage { text } => Some(SessionEvent::Text(text)),
        InboundMessage::Audio { audio } => match general_purpose::STANDARD.decode(audio) {
            Ok(bytes) => Some(SessionEvent::Audio(bytes)),
            Err(e) => {
                tracing::warn!("Ignoring audio chunk with invalid base64: {:?}", e);
                None
            }
        },
    }
}

/// Serialize one outbound message to its NDJSON line (without newline).
pub fn encode_line(message: &OutboundMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}
