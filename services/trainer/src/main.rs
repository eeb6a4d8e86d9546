use anyhow::{Context, Result};
use clap::Parser;
use roleplay_core::chat::GeminiChatClient;
use roleplay_core::notify::ChannelNotifier;
use roleplay_core::persona;
use roleplay_core::session::{ConversationSession, SessionEvent, SessionTuning};
use roleplay_core::stt::{GoogleSpeechClient, RecognitionSettings};
use roleplay_core::tts::GoogleTtsClient;
use roleplay_trainer::config::{Config, EVENT_CHANNEL_CAPACITY, OUTBOUND_CHANNEL_CAPACITY};
use roleplay_trainer::transport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
struct Cli {
    /// The character the session starts with
    #[arg(long, default_value = persona::DEFAULT_PERSONA_ID)]
    character: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    // Stdout carries the NDJSON message stream, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Configuration loaded successfully. Starting role-play trainer...");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    let persona = persona::lookup(&args.character);
    tracing::debug!("Available personas: {:?}", persona::list());
    tracing::info!("Starting session as '{}'", persona.name);

    // --- 4. Initialize API Clients ---
    let chat = GeminiChatClient::new(
        config.google_api_key.clone(),
        config.chat_model.clone(),
        persona.system_prompt.to_string(),
    );
    let stt = GoogleSpeechClient::new(config.google_api_key.clone(), RecognitionSettings::default());
    let tts = GoogleTtsClient::new(config.google_api_key.clone());

    // The coach gets its own fresh chat instance so assessment prompts never
    // mix with the persona conversation.
    let api_key = config.google_api_key.clone();
    let chat_model = config.chat_model.clone();
    let coach_factory = move |system_prompt: &str| {
        GeminiChatClient::new(
            api_key.clone(),
            chat_model.clone(),
            system_prompt.to_string(),
        )
    };

    // --- 5. Wire Up Transport ---
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<SessionEvent>(EVENT_CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

    // Writer task: one NDJSON line per outbound message on stdout.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let line = match transport::encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode outbound message: {:?}", e);
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                tracing::warn!("Stdout closed, stopping writer");
                break;
            }
        }
    });

    // Reader task: NDJSON lines on stdin become session events; EOF or a read
    // failure is treated as a client disconnect.
    let reader_tx = event_tx.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(event) = transport::parse_line(&line) {
                        if reader_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    let _ = reader_tx.send(SessionEvent::Disconnect).await;
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read from stdin: {:?}", e);
                    let _ = reader_tx.send(SessionEvent::Disconnect).await;
                    break;
                }
            }
        }
    });

    // --- 6. Run the Session ---
    let mut session = ConversationSession::new(
        &args.character,
        chat,
        stt,
        tts,
        ChannelNotifier::new(out_tx),
        coach_factory,
        SessionTuning::default(),
        event_tx,
    );
    session.run(event_rx).await;

    // Dropping the session closes the outbound channel, letting the writer
    // drain its remaining messages before exiting.
    drop(session);
    reader.abort();
    let _ = writer.await;

    tracing::info!("Session ended, shutting down");
    Ok(())
}
