use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

const TTS_SYNTHESIZE_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

/// Converts reply text into speakable audio (MP3 bytes) using the persona's
/// voice parameters.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice_name: &str,
        speaking_rate: f64,
        pitch: f64,
    ) -> Result<Vec<u8>>;
}

/// Client for the Google Cloud Text-to-Speech `text:synthesize` REST API.
pub struct GoogleTtsClient {
    http: reqwest::Client,
    api_key: String,
}

impl GoogleTtsClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }
}

/// Derive the language code from a voice name, e.g. "en-US" from
/// "en-US-Neural2-D".
fn language_code_of(voice_name: &str) -> String {
    voice_name.splitn(3, '-').take(2).collect::<Vec<_>>().join("-")
}

#[async_trait]
impl TextToSpeech for GoogleTtsClient {
    async fn synthesize(
        &self,
        text: &str,
        voice_name: &str,
        speaking_rate: f64,
        pitch: f64,
    ) -> Result<Vec<u8>> {
        let body = SynthesizeRequest {
            input: SynthesisInput { text },
            voice: VoiceSelection {
                language_code: language_code_of(voice_name),
                name: voice_name,
            },
            audio_config: AudioConfig {
                audio_encoding: "MP3",
                speaking_rate,
                pitch,
            },
        };

        let url = format!("{TTS_SYNTHESIZE_URL}?key={}", self.api_key);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Text-to-Speech request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Text-to-Speech returned {status}: {body}");
        }

        let parsed: SynthesizeResponse = response
            .json()
            .await
            .context("Failed to parse Text-to-Speech response")?;
        general_purpose::STANDARD
            .decode(&parsed.audio_content)
            .context("Text-to-Speech returned invalid base64 audio")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelection<'a>,
    audio_config: AudioConfig<'a>,
}

#[derive(Debug, Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: String,
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig<'a> {
    audio_encoding: &'a str,
    speaking_rate: f64,
    pitch: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}
