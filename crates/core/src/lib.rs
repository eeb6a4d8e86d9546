pub mod assessment;
pub mod chat;
pub mod conversation;
pub mod notify;
pub mod persona;
pub mod segmenter;
pub mod session;
pub mod stt;
pub mod tts;

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationState;

/// Messages the session emits toward the transport.
///
/// This enum is the primary API for decoupling the session's decision-making
/// from whatever carries messages to the client. Serialized as a JSON envelope
/// with a `type` tag, e.g. `{"type":"transcript","text":"...","is_final":true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// The session's current conversation state.
    State { state: ConversationState },
    /// The active persona's display info.
    Character { name: String, description: String },
    /// A transcript of what the user said.
    Transcript { text: String, is_final: bool },
    /// One streamed fragment of the assistant's reply.
    ResponseChunk { text: String },
    /// The assistant's complete reply text.
    Response { text: String },
    /// The assistant was cut off by the user.
    Interrupted,
    /// Synthesized reply audio, base64-encoded MP3.
    Audio { audio: String },
    /// The end-of-session coaching assessment.
    Assessment { text: String },
    /// A recoverable, turn-level failure.
    Error { message: String },
}

/// Control messages the transport may deliver to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// End the conversation; an assessment is generated before teardown.
    Stop,
    /// Swap the active persona. Unknown ids fall back to the default.
    ChangeCharacter { character_id: String },
    /// A typed message that bypasses speech recognition entirely.
    TextMessage { text: String },
    /// A chunk of microphone audio, base64-encoded.
    Audio { audio: String },
}
