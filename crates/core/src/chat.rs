use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// A stateful chat language model: one instance holds one conversation's
/// memory. Replies stream as a lazy, finite, in-order sequence of fragments.
///
/// The `FragmentReceiver` carries per-fragment results so a failure inside an
/// already-started stream still surfaces as a turn-level error at the caller.
/// `#[cfg_attr(test, automock)]` generates `MockChatModel` for unit tests so
/// session logic can be exercised without network calls.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait ChatModel: Send {
    /// Send a message and stream the reply fragment by fragment.
    async fn send_streaming(&mut self, message: &str) -> Result<FragmentReceiver>;

    /// Send a message and wait for the complete reply.
    async fn send(&mut self, message: &str) -> Result<String>;

    /// Drop the conversation memory and install a new system prompt.
    fn reset(&mut self, system_prompt: &str);
}

pub type FragmentReceiver = mpsc::Receiver<Result<String>>;

/// Chat client for the Gemini `generateContent` REST API.
///
/// Conversation memory is kept client-side: the user message is recorded when
/// it is sent, the model reply only once its stream has fully completed. A
/// reply abandoned mid-stream (receiver dropped on interruption) is not
/// recorded, so a half-delivered answer never pollutes the chat memory.
pub struct GeminiChatClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    system_prompt: String,
    history: Arc<Mutex<Vec<ChatContent>>>,
}

impl GeminiChatClient {
    pub fn new(api_key: String, model: String, system_prompt: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            system_prompt,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push_history(history: &Arc<Mutex<Vec<ChatContent>>>, content: ChatContent) {
        history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(content);
    }

    fn request_body(&self) -> GenerateRequest {
        GenerateRequest {
            contents: self.history.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            system_instruction: Some(ChatContent::text(None, &self.system_prompt)),
        }
    }
}

#[async_trait]
impl ChatModel for GeminiChatClient {
    async fn send_streaming(&mut self, message: &str) -> Result<FragmentReceiver> {
        Self::push_history(&self.history, ChatContent::text(Some("user"), message));

        let url = format!(
            "{GEMINI_BASE_URL}/{}:streamGenerateContent?alt=sse&key={}",
            self.model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&self.request_body())
            .send()
            .await
            .context("Gemini streaming request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini returned {status}: {body}");
        }

        let (tx, rx) = mpsc::channel(32);
        let history = self.history.clone();

        // Forward SSE fragments in production order. The receiver dropping
        // mid-stream means the caller abandoned the reply; stop forwarding
        // and leave the partial reply out of the chat memory.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut pending = String::new();
            let mut full_reply = String::new();
            let mut abandoned = false;

            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow::Error::new(e).context("Gemini stream failed")))
                            .await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    let Some(text) = parse_sse_fragment(line.trim_end()) else {
                        continue;
                    };
                    if text.is_empty() {
                        continue;
                    }
                    full_reply.push_str(&text);
                    if tx.send(Ok(text)).await.is_err() {
                        abandoned = true;
                        break 'outer;
                    }
                }
            }

            if !abandoned && !full_reply.is_empty() {
                Self::push_history(&history, ChatContent::text(Some("model"), &full_reply));
            }
        });

        Ok(rx)
    }

    async fn send(&mut self, message: &str) -> Result<String> {
        Self::push_history(&self.history, ChatContent::text(Some("user"), message));

        let url = format!(
            "{GEMINI_BASE_URL}/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&self.request_body())
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini returned {status}: {body}");
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;
        let text = parsed.text();
        if text.is_empty() {
            anyhow::bail!("Gemini response contained no text");
        }

        Self::push_history(&self.history, ChatContent::text(Some("model"), &text));
        Ok(text)
    }

    fn reset(&mut self, system_prompt: &str) {
        self.system_prompt = system_prompt.to_string();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Extract the text of one `data: {...}` SSE line. Returns `None` for
/// non-data lines (comments, blank keep-alives) and unparseable payloads.
fn parse_sse_fragment(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<GenerateResponse>(payload) {
        Ok(parsed) => Some(parsed.text()),
        Err(e) => {
            tracing::warn!("Skipping unparseable Gemini SSE payload: {:?}", e);
            None
        }
    }
}

// Gemini API types.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ChatPart>,
}

impl ChatContent {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![ChatPart {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<ChatContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ChatContent>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .map(|part| part.text.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ChatContent>,
}
