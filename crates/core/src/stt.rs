use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

const SPEECH_RECOGNIZE_URL: &str = "https://speech.googleapis.com/v1/speech:recognize";

/// How submitted utterance audio should be interpreted by the recognizer.
#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub language_code: String,
}

impl Default for RecognitionSettings {
    // Browser MediaRecorder chunks: WebM/Opus at 48kHz.
    fn default() -> Self {
        Self {
            encoding: "WEBM_OPUS".to_string(),
            sample_rate_hertz: 48_000,
            language_code: "en-US".to_string(),
        }
    }
}

/// Transcribes one complete utterance. Blocking (non-streaming) recognition
/// is sufficient for this core; an empty transcript is a valid result, not an
/// error.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Client for the Google Cloud Speech-to-Text `speech:recognize` REST API.
pub struct GoogleSpeechClient {
    http: reqwest::Client,
    api_key: String,
    settings: RecognitionSettings,
}

impl GoogleSpeechClient {
    pub fn new(api_key: String, settings: RecognitionSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            settings,
        }
    }
}

#[async_trait]
impl SpeechToText for GoogleSpeechClient {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        let body = RecognizeRequest {
            config: RecognitionConfig {
                encoding: &self.settings.encoding,
                sample_rate_hertz: self.settings.sample_rate_hertz,
                language_code: &self.settings.language_code,
                enable_automatic_punctuation: true,
            },
            audio: RecognitionAudio {
                content: general_purpose::STANDARD.encode(audio),
            },
        };

        let url = format!("{SPEECH_RECOGNIZE_URL}?key={}", self.api_key);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Speech-to-Text request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Speech-to-Text returned {status}: {body}");
        }

        let parsed: RecognizeResponse = response
            .json()
            .await
            .context("Failed to parse Speech-to-Text response")?;
        Ok(parsed.transcript())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeRequest<'a> {
    config: RecognitionConfig<'a>,
    audio: RecognitionAudio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'a str,
    sample_rate_hertz: u32,
    language_code: &'a str,
    enable_automatic_punctuation: bool,
}

#[derive(Debug, Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

impl RecognizeResponse {
    /// Concatenate the top alternative of every result, in order.
    fn transcript(&self) -> String {
        self.results
            .iter()
            .filter_map(|r| r.alternatives.first())
            .map(|a| a.transcript.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<RecognitionAlternative>,
}

#[derive(Debug, Deserialize)]
struct RecognitionAlternative {
    #[serde(default)]
    transcript: String,
}
