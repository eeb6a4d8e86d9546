use crate::chat::ChatModel;
use crate::conversation::{ConversationManager, ConversationState, Turn};
use crate::notify::Notifier;
use crate::persona::{self, Persona};
use crate::segmenter::{DEFAULT_UTTERANCE_THRESHOLD, UtteranceBuffer};
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use crate::{OutboundMessage, assessment};
use anyhow::Result;
use base64::{Engine as _, engine::general_purpose};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events a session consumes, in arrival order, through one serialized loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A raw audio fragment from the client's microphone.
    Audio(Vec<u8>),
    /// A typed message, bypassing speech recognition.
    Text(String),
    /// The debounced signal that a buffered utterance is ready.
    FinalizeUtterance,
    /// Swap the active persona.
    ChangePersona(String),
    /// End the conversation; assessment is generated before teardown.
    Stop,
    /// The transport went away; best-effort cleanup, no assessment.
    Disconnect,
}

/// Tunables for utterance segmentation.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    /// Fragments buffered before a finalize is scheduled.
    pub utterance_threshold: usize,
    /// Quiescence delay letting trailing fragments arrive before finalize.
    pub finalize_delay: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            utterance_threshold: DEFAULT_UTTERANCE_THRESHOLD,
            finalize_delay: Duration::from_millis(300),
        }
    }
}

/// State owned by the session that must stay reachable while a collaborator
/// call is in flight: mid-turn events (the interruption signal in particular)
/// are serviced against this struct while the chat/synthesis future holds a
/// borrow of its collaborator.
struct SessionCore<N: Notifier> {
    manager: ConversationManager,
    buffer: UtteranceBuffer,
    persona: &'static Persona,
    notifier: N,
    event_tx: mpsc::Sender<SessionEvent>,
    finalize_task: Option<JoinHandle<()>>,
    deferred: VecDeque<SessionEvent>,
    tuning: SessionTuning,
}

impl<N: Notifier> SessionCore<N> {
    async fn notify(&self, message: OutboundMessage) {
        if let Err(e) = self.notifier.send(message).await {
            tracing::warn!("Failed to notify transport: {:?}", e);
        }
    }

    async fn notify_state(&self, state: ConversationState) {
        self.notify(OutboundMessage::State { state }).await;
    }

    async fn announce_persona(&self) {
        self.notify(OutboundMessage::Character {
            name: self.persona.name.to_string(),
            description: self.persona.description.to_string(),
        })
        .await;
    }

    /// Route one audio fragment.
    ///
    /// While the assistant is speaking, the arrival of any fragment is itself
    /// the interruption signal: it is not buffered. While listening, the
    /// fragment is buffered and, once the threshold is crossed, a single
    /// debounced finalize is scheduled; a second crossing while one is
    /// pending never schedules a duplicate. In any other state the fragment
    /// is dropped.
    async fn handle_audio(&mut self, fragment: Vec<u8>) {
        match self.manager.state() {
            ConversationState::Speaking => {
                if self.manager.interrupt() {
                    tracing::info!("User interrupted assistant speech");
                    self.notify(OutboundMessage::Interrupted).await;
                    self.notify_state(ConversationState::Listening).await;
                }
            }
            ConversationState::Listening => {
                let count = self.buffer.push(fragment);
                if count % 10 == 0 {
                    tracing::debug!("Audio buffer at {} fragments", count);
                }
                if self.buffer.over_threshold() && self.finalize_task.is_none() {
                    let tx = self.event_tx.clone();
                    let delay = self.tuning.finalize_delay;
                    self.finalize_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SessionEvent::FinalizeUtterance).await;
                    }));
                }
            }
            _ => {}
        }
    }

    /// Events that arrive while a turn is in flight. Audio fragments carry
    /// the interruption signal and are handled immediately; a finalize firing
    /// mid-turn lost its race and its buffered audio is discarded; control
    /// events are deferred until the turn completes. The deferred queue is
    /// drained by the run loop itself, so a deferred stop or persona change
    /// is never lost.
    async fn handle_mid_turn_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio(fragment) => self.handle_audio(fragment).await,
            SessionEvent::FinalizeUtterance => {
                self.finalize_task = None;
                self.buffer.clear();
            }
            other => self.deferred.push_back(other),
        }
    }

    /// Cancel any pending finalize and park the session in idle.
    fn teardown(&mut self) {
        if let Some(task) = self.finalize_task.take() {
            task.abort();
        }
        self.buffer.clear();
        self.manager.stop();
    }
}

/// The session orchestrator: owns one state machine and one utterance buffer
/// and drives the full turn cycle (listen, transcribe, generate, synthesize,
/// speak) over its collaborators, including interruption and cancellation.
///
/// All events flow through one serialized loop, so no two orchestrator steps
/// for the same session ever run concurrently. The coach factory produces a
/// fresh chat instance for the end-of-session assessment so coaching prompts
/// never leak into the persona conversation.
pub struct ConversationSession<C, S, T, N, F>
where
    C: ChatModel,
    S: SpeechToText,
    T: TextToSpeech,
    N: Notifier,
    F: Fn(&str) -> C,
{
    core: SessionCore<N>,
    chat: C,
    stt: S,
    tts: T,
    coach_factory: F,
}

impl<C, S, T, N, F> ConversationSession<C, S, T, N, F>
where
    C: ChatModel,
    S: SpeechToText,
    T: TextToSpeech,
    N: Notifier,
    F: Fn(&str) -> C,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        persona_id: &str,
        chat: C,
        stt: S,
        tts: T,
        notifier: N,
        coach_factory: F,
        tuning: SessionTuning,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let mut manager = ConversationManager::new();
        manager.on_state_change(|state| {
            tracing::debug!("Conversation state -> {:?}", state);
            Ok(())
        });

        Self {
            core: SessionCore {
                manager,
                buffer: UtteranceBuffer::new(tuning.utterance_threshold),
                persona: persona::lookup(persona_id),
                notifier,
                event_tx,
                finalize_task: None,
                deferred: VecDeque::new(),
                tuning,
            },
            chat,
            stt,
            tts,
            coach_factory,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.core.manager.state()
    }

    pub fn history(&self) -> &[Turn] {
        self.core.manager.history()
    }

    /// Run the session until a stop, a disconnect, or the event channel
    /// closing. A failed turn never terminates the loop.
    pub async fn run(&mut self, mut events: mpsc::Receiver<SessionEvent>) {
        self.core.manager.start_listening();
        self.core.notify_state(ConversationState::Listening).await;
        self.core.announce_persona().await;

        loop {
            // Control events deferred during a turn arrived first; they are
            // handled before anything still sitting in the channel.
            let event = match self.core.deferred.pop_front() {
                Some(event) => event,
                None => match events.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            if self.dispatch(event, &mut events).await {
                break;
            }
        }

        // Channel closed without an explicit stop: treat as a disconnect.
        if self.core.manager.state() != ConversationState::Idle {
            self.core.teardown();
        }
    }

    /// Handle one event; returns true when the session should end.
    async fn dispatch(
        &mut self,
        event: SessionEvent,
        events: &mut mpsc::Receiver<SessionEvent>,
    ) -> bool {
        match event {
            SessionEvent::Audio(fragment) => self.core.handle_audio(fragment).await,
            SessionEvent::FinalizeUtterance => {
                self.core.finalize_task = None;
                if let Err(e) = self.process_utterance(events).await {
                    self.recover(e).await;
                }
            }
            SessionEvent::Text(text) => {
                if !text.trim().is_empty() {
                    if let Err(e) = self.generate_response(events, &text).await {
                        self.recover(e).await;
                    }
                }
            }
            SessionEvent::ChangePersona(persona_id) => {
                let persona = persona::lookup(&persona_id);
                tracing::info!("Switching persona to '{}'", persona.id);
                self.core.persona = persona;
                self.chat.reset(persona.system_prompt);
                self.core.announce_persona().await;
            }
            SessionEvent::Stop => {
                self.finish().await;
                return true;
            }
            SessionEvent::Disconnect => {
                tracing::info!("Transport disconnected, tearing session down");
                self.core.teardown();
                return true;
            }
        }
        false
    }

    /// A collaborator call failed: surface it and put the session back into
    /// listening so the conversation can continue.
    async fn recover(&mut self, error: anyhow::Error) {
        tracing::error!("Turn failed: {:?}", error);
        self.core
            .notify(OutboundMessage::Error {
                message: format!("{error:#}"),
            })
            .await;
        self.core.manager.set_state(ConversationState::Listening);
        self.core.notify_state(ConversationState::Listening).await;
    }

    /// A scheduled finalize fired: drain the buffer and transcribe it.
    async fn process_utterance(&mut self, events: &mut mpsc::Receiver<SessionEvent>) -> Result<()> {
        if !self.core.manager.is_listening() {
            // An interruption or stop won the race during the debounce
            // window; the buffered audio is stale.
            self.core.buffer.clear();
            return Ok(());
        }
        if self.core.buffer.is_empty() {
            return Ok(());
        }

        let audio = self.core.buffer.take();
        tracing::info!("Transcribing utterance of {} bytes", audio.len());
        self.core.manager.set_state(ConversationState::Processing);
        self.core.notify_state(ConversationState::Processing).await;

        let transcript = self.stt.transcribe(&audio).await?;
        if transcript.trim().is_empty() {
            tracing::debug!("Empty transcript, returning to listening");
            self.core.manager.set_state(ConversationState::Listening);
            self.core.notify_state(ConversationState::Listening).await;
            return Ok(());
        }

        tracing::info!("Transcript: \"{}\"", transcript);
        self.core
            .notify(OutboundMessage::Transcript {
                text: transcript.clone(),
                is_final: true,
            })
            .await;
        self.generate_response(events, &transcript).await
    }

    /// One generation turn: record the user turn, stream the reply, then
    /// synthesize and emit speech. Inbound events keep being serviced while
    /// collaborator calls are in flight so an interruption lands immediately.
    async fn generate_response(
        &mut self,
        events: &mut mpsc::Receiver<SessionEvent>,
        user_message: &str,
    ) -> Result<()> {
        self.core.manager.update_transcript(user_message, true);

        let mut fragments = self.chat.send_streaming(user_message).await?;
        let mut full_response = String::new();
        let mut events_open = true;

        loop {
            tokio::select! {
                fragment = fragments.recv() => {
                    let Some(fragment) = fragment else { break };
                    let fragment = fragment?;
                    // Interruption boundary: abandon the remainder of the
                    // stream, record nothing.
                    if self.core.manager.is_interrupted() {
                        break;
                    }
                    full_response.push_str(&fragment);
                    self.core
                        .notify(OutboundMessage::ResponseChunk { text: fragment })
                        .await;
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.core.handle_mid_turn_event(event).await,
                        None => events_open = false,
                    }
                }
            }
        }

        if self.core.manager.is_interrupted() {
            tracing::info!("Response stream abandoned after interruption");
            return Ok(());
        }

        if !full_response.trim().is_empty() {
            self.core.manager.add_response(&full_response);
            self.core
                .notify(OutboundMessage::Response {
                    text: full_response.clone(),
                })
                .await;

            self.core.manager.start_speaking();
            self.core.notify_state(ConversationState::Speaking).await;

            let (voice_name, speaking_rate, pitch) = (
                self.core.persona.voice_name,
                self.core.persona.speaking_rate,
                self.core.persona.pitch,
            );
            let synth = self
                .tts
                .synthesize(&full_response, voice_name, speaking_rate, pitch);
            tokio::pin!(synth);

            // Service events while synthesis runs: an audio fragment arriving
            // now, while state is speaking, is the interruption signal.
            let audio = loop {
                tokio::select! {
                    result = &mut synth => break result?,
                    event = events.recv(), if events_open => {
                        match event {
                            Some(event) => self.core.handle_mid_turn_event(event).await,
                            None => events_open = false,
                        }
                    }
                }
            };
            tracing::debug!("Synthesized {} bytes of speech", audio.len());

            if !self.core.manager.is_interrupted() {
                self.core
                    .notify(OutboundMessage::Audio {
                        audio: general_purpose::STANDARD.encode(&audio),
                    })
                    .await;
            }
            self.core.manager.finish_speaking();
        }

        self.core.notify_state(ConversationState::Listening).await;
        self.core.manager.set_state(ConversationState::Listening);
        Ok(())
    }

    /// Stop requested: the assessment must see the full history, so generate
    /// and emit it before any teardown.
    async fn finish(&mut self) {
        tracing::info!("Stop requested, generating assessment");
        let text = assessment::generate(
            self.core.manager.history(),
            self.core.persona,
            &self.coach_factory,
        )
        .await
        .unwrap_or_else(|| assessment::ASSESSMENT_FALLBACK.to_string());

        self.core
            .notify(OutboundMessage::Assessment { text })
            .await;
        self.core.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::{ASSESSMENT_FALLBACK, COACH_SYSTEM_PROMPT};
    use crate::chat::{FragmentReceiver, MockChatModel};
    use crate::conversation::Speaker;
    use crate::notify::ChannelNotifier;
    use crate::stt::MockSpeechToText;
    use crate::tts::MockTextToSpeech;

    type TestSession<F> =
        ConversationSession<MockChatModel, MockSpeechToText, MockTextToSpeech, ChannelNotifier, F>;

    fn no_coach(_: &str) -> MockChatModel {
        panic!("the coach model must not be constructed in this test")
    }

    fn reply_stream(fragments: &[&str]) -> FragmentReceiver {
        let (tx, rx) = mpsc::channel(fragments.len().max(1));
        for fragment in fragments {
            tx.try_send(Ok((*fragment).to_string())).unwrap();
        }
        rx
    }

    fn tuning(threshold: usize) -> SessionTuning {
        SessionTuning {
            utterance_threshold: threshold,
            finalize_delay: Duration::from_millis(300),
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_session<F: Fn(&str) -> MockChatModel>(
        chat: MockChatModel,
        stt: MockSpeechToText,
        tts: MockTextToSpeech,
        coach_factory: F,
        tuning: SessionTuning,
    ) -> (
        TestSession<F>,
        mpsc::Sender<SessionEvent>,
        mpsc::Receiver<SessionEvent>,
        mpsc::Receiver<OutboundMessage>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let session = ConversationSession::new(
            "buyer",
            chat,
            stt,
            tts,
            ChannelNotifier::new(out_tx),
            coach_factory,
            tuning,
            event_tx.clone(),
        );
        (session, event_tx, event_rx, out_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn text_message_streams_reply_and_round_trips_states() {
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Hello", " there"]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize()
            .once()
            .returning(|_, _, _, _| Box::pin(async { Ok(vec![1, 2, 3]) }));

        let (mut session, event_tx, event_rx, mut out_rx) =
            build_session(chat, MockSpeechToText::new(), tts, no_coach, tuning(12));

        event_tx
            .send(SessionEvent::Text("I sell eco clips".to_string()))
            .await
            .unwrap();
        event_tx.send(SessionEvent::Disconnect).await.unwrap();
        session.run(event_rx).await;

        let messages = drain(&mut out_rx);
        assert_eq!(
            messages,
            vec![
                OutboundMessage::State {
                    state: ConversationState::Listening
                },
                OutboundMessage::Character {
                    name: "Operations Manager".to_string(),
                    description: "B2B Cleaning Services Company - Paper Clips Buyer".to_string(),
                },
                OutboundMessage::ResponseChunk {
                    text: "Hello".to_string()
                },
                OutboundMessage::ResponseChunk {
                    text: " there".to_string()
                },
                OutboundMessage::Response {
                    text: "Hello there".to_string()
                },
                OutboundMessage::State {
                    state: ConversationState::Speaking
                },
                OutboundMessage::Audio {
                    audio: "AQID".to_string()
                },
                OutboundMessage::State {
                    state: ConversationState::Listening
                },
            ]
        );

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Speaker::User);
        assert_eq!(history[0].text, "I sell eco clips");
        assert_eq!(history[1].role, Speaker::Assistant);
        assert_eq!(history[1].text, "Hello there");
        assert_eq!(session.state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn audio_while_speaking_interrupts_without_buffering() {
        let (mut session, _event_tx, _event_rx, mut out_rx) = build_session(
            MockChatModel::new(),
            MockSpeechToText::new(),
            MockTextToSpeech::new(),
            no_coach,
            tuning(12),
        );

        session.core.manager.start_speaking();
        session.core.handle_audio(vec![7, 7, 7]).await;

        assert!(session.core.buffer.is_empty());
        assert_eq!(session.state(), ConversationState::Listening);
        assert_eq!(
            drain(&mut out_rx),
            vec![
                OutboundMessage::Interrupted,
                OutboundMessage::State {
                    state: ConversationState::Listening
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn audio_during_synthesis_interrupts_and_suppresses_audio() {
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Hi"]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize().once().returning(|_, _, _, _| {
            Box::pin(async {
                // Give the queued interruption fragment time to be serviced.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![9])
            })
        });

        let (mut session, event_tx, event_rx, mut out_rx) =
            build_session(chat, MockSpeechToText::new(), tts, no_coach, tuning(12));

        // The fragment must land while synthesis is in flight (state
        // speaking), so it is sent after a short delay.
        let sender = tokio::spawn(async move {
            event_tx
                .send(SessionEvent::Text("hello".to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            event_tx.send(SessionEvent::Audio(vec![7])).await.unwrap();
            event_tx.send(SessionEvent::Disconnect).await.unwrap();
        });
        session.run(event_rx).await;
        sender.await.unwrap();

        let messages = drain(&mut out_rx);
        assert!(messages.contains(&OutboundMessage::Interrupted));
        assert!(
            !messages
                .iter()
                .any(|m| matches!(m, OutboundMessage::Audio { .. })),
            "synthesized audio must be suppressed after an interruption"
        );
        // The reply had finished streaming, so its turn stays recorded.
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_after_interruption_streams_normally() {
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["One"]);
            Box::pin(async move { Ok(rx) })
        });
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Two"]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize().once().returning(|_, _, _, _| {
            Box::pin(async {
                // First synthesis hangs long enough to be interrupted.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![1])
            })
        });
        tts.expect_synthesize()
            .once()
            .returning(|_, _, _, _| Box::pin(async { Ok(vec![2]) }));

        let (mut session, event_tx, event_rx, mut out_rx) =
            build_session(chat, MockSpeechToText::new(), tts, no_coach, tuning(12));

        let sender = tokio::spawn(async move {
            event_tx
                .send(SessionEvent::Text("first".to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            event_tx.send(SessionEvent::Audio(vec![7])).await.unwrap();
            event_tx
                .send(SessionEvent::Text("second".to_string()))
                .await
                .unwrap();
            event_tx.send(SessionEvent::Disconnect).await.unwrap();
        });
        session.run(event_rx).await;
        sender.await.unwrap();

        // The interruption only cut off the first reply; the next turn's
        // stream is delivered in full, audio included.
        let messages = drain(&mut out_rx);
        assert!(messages.contains(&OutboundMessage::Interrupted));
        assert!(messages.contains(&OutboundMessage::Response {
            text: "Two".to_string()
        }));
        let audio: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Audio { .. }))
            .collect();
        assert_eq!(
            audio,
            vec![&OutboundMessage::Audio {
                audio: "Ag==".to_string()
            }]
        );
        assert_eq!(session.history().len(), 4);
        assert_eq!(session.history()[3].text, "Two");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_deferred_during_synthesis_still_generates_assessment() {
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Hi"]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize().once().returning(|_, _, _, _| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![9])
            })
        });
        let coach_factory = |_: &str| {
            let mut coach = MockChatModel::new();
            coach
                .expect_send()
                .once()
                .returning(|_| Box::pin(async { Ok("Solid effort.".to_string()) }));
            coach
        };

        let (mut session, event_tx, event_rx, mut out_rx) = build_session(
            chat,
            MockSpeechToText::new(),
            tts,
            coach_factory,
            tuning(12),
        );

        // The stop arrives while synthesis is in flight; it must survive the
        // turn and still produce the assessment.
        let sender = tokio::spawn(async move {
            event_tx
                .send(SessionEvent::Text("pitch".to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            event_tx.send(SessionEvent::Stop).await.unwrap();
        });
        session.run(event_rx).await;
        sender.await.unwrap();

        let messages = drain(&mut out_rx);
        assert_eq!(
            messages.last(),
            Some(&OutboundMessage::Assessment {
                text: "Solid effort.".to_string()
            })
        );
        assert_eq!(session.state(), ConversationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn fragment_burst_schedules_exactly_one_finalize() {
        let mut stt = MockSpeechToText::new();
        stt.expect_transcribe()
            .once()
            .withf(|audio: &[u8]| audio.len() == 8 * 4)
            .returning(|_| Box::pin(async { Ok("order confirmed".to_string()) }));
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Sure"]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize()
            .once()
            .returning(|_, _, _, _| Box::pin(async { Ok(vec![1]) }));

        let (mut session, event_tx, event_rx, mut out_rx) =
            build_session(chat, stt, tts, no_coach, tuning(3));

        let runner = tokio::spawn(async move {
            session.run(event_rx).await;
            session
        });

        // Eight fragments cross the threshold six times; only one finalize
        // may fire, carrying all eight fragments.
        for _ in 0..8 {
            event_tx
                .send(SessionEvent::Audio(vec![0u8; 4]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        event_tx.send(SessionEvent::Disconnect).await.unwrap();
        let session = runner.await.unwrap();

        let messages = drain(&mut out_rx);
        assert!(messages.contains(&OutboundMessage::Transcript {
            text: "order confirmed".to_string(),
            is_final: true
        }));
        let processing_count = messages
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    OutboundMessage::State {
                        state: ConversationState::Processing
                    }
                )
            })
            .count();
        assert_eq!(processing_count, 1);
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].text, "order confirmed");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_transcript_silently_returns_to_listening() {
        let mut stt = MockSpeechToText::new();
        stt.expect_transcribe()
            .once()
            .returning(|_| Box::pin(async { Ok("   ".to_string()) }));

        let (mut session, event_tx, event_rx, mut out_rx) = build_session(
            MockChatModel::new(),
            stt,
            MockTextToSpeech::new(),
            no_coach,
            tuning(2),
        );

        let runner = tokio::spawn(async move {
            session.run(event_rx).await;
            session
        });
        event_tx.send(SessionEvent::Audio(vec![1])).await.unwrap();
        event_tx.send(SessionEvent::Audio(vec![2])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        event_tx.send(SessionEvent::Disconnect).await.unwrap();
        let session = runner.await.unwrap();

        assert!(session.history().is_empty());
        let messages = drain(&mut out_rx);
        assert!(
            !messages
                .iter()
                .any(|m| matches!(m, OutboundMessage::Transcript { .. }))
        );
        // Processing was announced, then listening again.
        assert!(messages.contains(&OutboundMessage::State {
            state: ConversationState::Processing
        }));
        assert_eq!(
            messages.last(),
            Some(&OutboundMessage::State {
                state: ConversationState::Listening
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_turn_emits_error_and_session_continues() {
        let mut stt = MockSpeechToText::new();
        stt.expect_transcribe()
            .once()
            .returning(|_| Box::pin(async { Err(anyhow::anyhow!("recognizer offline")) }));
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Still here"]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize()
            .once()
            .returning(|_, _, _, _| Box::pin(async { Ok(vec![5]) }));

        let (mut session, event_tx, event_rx, mut out_rx) =
            build_session(chat, stt, tts, no_coach, tuning(1));

        let runner = tokio::spawn(async move {
            session.run(event_rx).await;
            session
        });
        event_tx.send(SessionEvent::Audio(vec![1])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        // The failed turn must not have killed the loop.
        event_tx
            .send(SessionEvent::Text("are you there?".to_string()))
            .await
            .unwrap();
        event_tx.send(SessionEvent::Disconnect).await.unwrap();
        let session = runner.await.unwrap();

        let messages = drain(&mut out_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            OutboundMessage::Error { message } if message.contains("recognizer offline")
        )));
        assert!(messages.contains(&OutboundMessage::Response {
            text: "Still here".to_string()
        }));
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn stop_with_short_history_emits_fallback_without_coach() {
        let (mut session, event_tx, event_rx, mut out_rx) = build_session(
            MockChatModel::new(),
            MockSpeechToText::new(),
            MockTextToSpeech::new(),
            no_coach,
            tuning(12),
        );

        event_tx.send(SessionEvent::Stop).await.unwrap();
        session.run(event_rx).await;

        let messages = drain(&mut out_rx);
        assert_eq!(
            messages.last(),
            Some(&OutboundMessage::Assessment {
                text: ASSESSMENT_FALLBACK.to_string()
            })
        );
        assert_eq!(session.state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn stop_generates_assessment_over_a_fresh_coach() {
        let mut chat = MockChatModel::new();
        chat.expect_send_streaming().once().returning(|_| {
            let rx = reply_stream(&["Tell me more."]);
            Box::pin(async move { Ok(rx) })
        });
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize()
            .once()
            .returning(|_, _, _, _| Box::pin(async { Ok(vec![1]) }));

        let coach_factory = |system_prompt: &str| {
            assert_eq!(system_prompt, COACH_SYSTEM_PROMPT);
            let mut coach = MockChatModel::new();
            coach
                .expect_send()
                .once()
                .withf(|prompt: &str| prompt.contains("Seller: my pitch"))
                .returning(|_| Box::pin(async { Ok("Great pitch!".to_string()) }));
            coach
        };

        let (mut session, event_tx, event_rx, mut out_rx) = build_session(
            chat,
            MockSpeechToText::new(),
            tts,
            coach_factory,
            tuning(12),
        );

        event_tx
            .send(SessionEvent::Text("my pitch".to_string()))
            .await
            .unwrap();
        event_tx.send(SessionEvent::Stop).await.unwrap();
        session.run(event_rx).await;

        let messages = drain(&mut out_rx);
        assert_eq!(
            messages.last(),
            Some(&OutboundMessage::Assessment {
                text: "Great pitch!".to_string()
            })
        );
        assert_eq!(session.state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn unknown_persona_falls_back_to_default() {
        let mut chat = MockChatModel::new();
        chat.expect_reset()
            .once()
            .withf(|prompt: &str| prompt.contains("operations manager"))
            .returning(|_| ());

        let (mut session, event_tx, event_rx, mut out_rx) = build_session(
            chat,
            MockSpeechToText::new(),
            MockTextToSpeech::new(),
            no_coach,
            tuning(12),
        );

        event_tx
            .send(SessionEvent::ChangePersona("mystery-guest".to_string()))
            .await
            .unwrap();
        event_tx.send(SessionEvent::Disconnect).await.unwrap();
        session.run(event_rx).await;

        let characters: Vec<_> = drain(&mut out_rx)
            .into_iter()
            .filter(|m| matches!(m, OutboundMessage::Character { .. }))
            .collect();
        assert_eq!(characters.len(), 2);
        assert_eq!(
            characters[1],
            OutboundMessage::Character {
                name: "Operations Manager".to_string(),
                description: "B2B Cleaning Services Company - Paper Clips Buyer".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn audio_in_processing_state_is_dropped() {
        let (mut session, _event_tx, _event_rx, mut out_rx) = build_session(
            MockChatModel::new(),
            MockSpeechToText::new(),
            MockTextToSpeech::new(),
            no_coach,
            tuning(12),
        );

        session.core.manager.set_state(ConversationState::Processing);
        session.core.handle_audio(vec![1, 2]).await;

        assert!(session.core.buffer.is_empty());
        assert_eq!(session.state(), ConversationState::Processing);
        let messages = drain(&mut out_rx);
        assert!(!messages.contains(&OutboundMessage::Interrupted));
    }
}
