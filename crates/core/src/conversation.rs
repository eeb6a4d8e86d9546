use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// States of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

/// Who produced a recorded turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// A single recorded utterance. Immutable once appended to the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn new(role: Speaker, text: String) -> Self {
        Self {
            role,
            text,
            timestamp: Utc::now(),
        }
    }
}

type StateObserver = Box<dyn Fn(ConversationState) -> Result<()> + Send + Sync>;

/// Manages the state and flow of a real-time conversation: turn-taking,
/// interruptions, and state transitions.
///
/// The state value sits behind a mutex so that a scheduled finalize task and
/// an inbound control message can never interleave a read-modify-write of the
/// state. Observers are invoked synchronously inside that section; an observer
/// returning an error is logged and otherwise ignored so a faulty listener
/// cannot break the conversation.
pub struct ConversationManager {
    state: Mutex<ConversationState>,
    history: Vec<Turn>,
    current_transcript: String,
    is_interrupted: bool,
    observers: Vec<StateObserver>,
}

impl Default for ConversationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConversationState::Idle),
            history: Vec::new(),
            current_transcript: String::new(),
            is_interrupted: false,
            observers: Vec::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConversationState> {
        // An observer panicking while notified would poison the lock; the
        // state itself is still valid, so recover the guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_observers(observers: &[StateObserver], state: ConversationState) {
        for observer in observers {
            if let Err(e) = observer(state) {
                tracing::warn!("State observer failed (ignored): {:?}", e);
            }
        }
    }

    /// Register a callback invoked on every state change.
    pub fn on_state_change<F>(&mut self, observer: F)
    where
        F: Fn(ConversationState) -> Result<()> + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Change conversation state and notify listeners.
    pub fn set_state(&mut self, new_state: ConversationState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = new_state;
        Self::notify_observers(&self.observers, new_state);
    }

    pub fn state(&self) -> ConversationState {
        *self.lock_state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ConversationState::Listening
    }

    pub fn is_interrupted(&self) -> bool {
        self.is_interrupted
    }

    pub fn current_transcript(&self) -> &str {
        &self.current_transcript
    }

    /// Transition to listening, clearing the scratch transcript.
    pub fn start_listening(&mut self) {
        self.current_transcript.clear();
        self.set_state(ConversationState::Listening);
    }

    /// Update the scratch transcript with new speech. A final, non-empty
    /// transcript records a user turn and moves the session to processing.
    /// A new user turn supersedes any earlier interruption: the flag only
    /// ever applies to the turn it cut off.
    pub fn update_transcript(&mut self, text: &str, is_final: bool) {
        self.current_transcript = text.to_string();

        if is_final && !text.trim().is_empty() {
            self.is_interrupted = false;
            self.history.push(Turn::new(Speaker::User, text.to_string()));
            self.set_state(ConversationState::Processing);
        }
    }

    /// Record the assistant's reply in the history.
    pub fn add_response(&mut self, text: &str) {
        self.history
            .push(Turn::new(Speaker::Assistant, text.to_string()));
    }

    /// Transition to speaking, clearing the interruption flag.
    pub fn start_speaking(&mut self) {
        self.is_interrupted = false;
        self.set_state(ConversationState::Speaking);
    }

    /// Handle a user interruption during assistant speech.
    ///
    /// Returns whether the interruption was accepted: true only when the
    /// session was actually speaking. Anything else is a no-op signal, not an
    /// error. The check and the transition happen under one lock section.
    pub fn interrupt(&mut self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ConversationState::Speaking {
            return false;
        }
        self.is_interrupted = true;
        *state = ConversationState::Listening;
        Self::notify_observers(&self.observers, ConversationState::Listening);
        true
    }

    /// Called when the assistant finishes speaking. If the turn was
    /// interrupted the state was already moved to listening; do nothing.
    pub fn finish_speaking(&mut self) {
        if !self.is_interrupted {
            self.set_state(ConversationState::Listening);
        }
    }

    /// Stop the conversation.
    pub fn stop(&mut self) {
        self.set_state(ConversationState::Idle);
        self.current_transcript.clear();
    }

    /// The append-only turn log, in chronological order.
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.current_transcript.clear();
    }
}
