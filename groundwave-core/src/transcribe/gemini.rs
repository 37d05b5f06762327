//! Gemini live-audio provider: bidirectional streaming session with
//! base64 PCM chunks and a system instruction built from the source
//! and target languages. The contract is "receive partial and final
//! transcription frames"; turn completion marks a frame final.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::errors::TranscribeError;

use super::{TranscriptionFrame, TranscriptionProvider, TARGET_SAMPLE_RATE};

const PROVIDER: &str = "gemini";
const MODEL: &str = "models/gemini-2.0-flash-live-001";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GeminiProvider {
    language: String,
    translate_to: String,
    socket: Option<Socket>,
}

impl GeminiProvider {
    pub fn new(language: &str, translate_to: &str) -> Self {
        Self {
            language: language.to_string(),
            translate_to: translate_to.to_string(),
            socket: None,
        }
    }

    /// Instruction steering the model toward verbatim transcription,
    /// with translation folded in when a target language is set.
    fn system_instruction(&self) -> String {
        let mut instruction = String::from(
            "You are transcribing audio received from a radio. \
             Transcribe the speech verbatim.",
        );
        if self.language != "auto" && !self.language.is_empty() {
            instruction.push_str(&format!(" The speech is in '{}'.", self.language));
        }
        if self.translate_to != "none" && !self.translate_to.is_empty() {
            instruction.push_str(&format!(
                " Translate the transcription into '{}' and return only the translation.",
                self.translate_to
            ));
        }
        instruction
    }

    fn setup_message(&self) -> serde_json::Value {
        json!({
            "setup": {
                "model": MODEL,
                "generation_config": {"response_modalities": ["TEXT"]},
                "system_instruction": {
                    "parts": [{"text": self.system_instruction()}]
                },
            }
        })
    }

    fn parse_content(&self, raw: &str) -> Option<TranscriptionFrame> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let content = value.get("serverContent")?;
        let is_final = content
            .get("turnComplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut text = String::new();
        if let Some(parts) = content
            .get("modelTurn")
            .and_then(|turn| turn.get("parts"))
            .and_then(|parts| parts.as_array())
        {
            for part in parts {
                if let Some(fragment) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(fragment);
                }
            }
        }
        if text.is_empty() && !is_final {
            return None;
        }
        Some(TranscriptionFrame {
            text,
            language: if self.translate_to != "none" {
                self.translate_to.clone()
            } else {
                self.language.clone()
            },
            is_final,
            confidence: None,
        })
    }
}

#[async_trait]
impl TranscriptionProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn connect(&mut self, api_key: &str) -> Result<(), TranscribeError> {
        let url = format!(
            "wss://generativelanguage.googleapis.com/ws/\
             google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={api_key}"
        );
        let (mut socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| TranscribeError::classify(PROVIDER, &err.to_string()))?;

        socket
            .send(Message::text(self.setup_message().to_string()))
            .await
            .map_err(|err| TranscribeError::classify(PROVIDER, &err.to_string()))?;

        // The session acknowledges the setup before audio may flow.
        match tokio::time::timeout(Duration::from_secs(10), socket.next()).await {
            Ok(Some(Ok(_ack))) => {}
            Ok(Some(Err(err))) => {
                return Err(TranscribeError::classify(PROVIDER, &err.to_string()));
            }
            Ok(None) => {
                return Err(TranscribeError::Network {
                    provider: PROVIDER,
                    reason: "stream ended during setup".to_string(),
                });
            }
            Err(_elapsed) => return Err(TranscribeError::Deadline),
        }

        self.socket = Some(socket);
        info!(language = %self.language, translate_to = %self.translate_to, "connected to Gemini");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
            debug!("Gemini connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn send_audio(&mut self, pcm: &[i16]) -> Result<(), TranscribeError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| TranscribeError::Network {
                provider: PROVIDER,
                reason: "not connected".to_string(),
            })?;

        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let message = json!({
            "realtime_input": {
                "media_chunks": [{
                    "mime_type": format!("audio/pcm;rate={TARGET_SAMPLE_RATE}"),
                    "data": encoded,
                }]
            }
        });
        socket
            .send(Message::text(message.to_string()))
            .await
            .map_err(|err| TranscribeError::classify(PROVIDER, &err.to_string()))
    }

    async fn drain(&mut self, budget: Duration) -> Result<Vec<TranscriptionFrame>, TranscribeError> {
        if self.socket.is_none() {
            return Ok(Vec::new());
        }
        let mut frames = Vec::new();
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.socket.as_mut().unwrap().next()).await {
                Err(_elapsed) => break,
                Ok(None) => {
                    self.socket = None;
                    return Err(TranscribeError::Network {
                        provider: PROVIDER,
                        reason: "stream ended".to_string(),
                    });
                }
                Ok(Some(Err(err))) => {
                    self.socket = None;
                    return Err(TranscribeError::classify(PROVIDER, &err.to_string()));
                }
                Ok(Some(Ok(Message::Text(raw)))) => {
                    if let Some(frame) = self.parse_content(raw.as_str()) {
                        frames.push(frame);
                    }
                }
                Ok(Some(Ok(Message::Binary(raw)))) => {
                    if let Ok(text) = std::str::from_utf8(&raw) {
                        if let Some(frame) = self.parse_content(text) {
                            frames.push(frame);
                        }
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    self.socket = None;
                    break;
                }
                Ok(Some(Ok(_))) => {}
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_instruction_mentions_languages() {
        let provider = GeminiProvider::new("es", "en");
        let instruction = provider.system_instruction();
        assert!(instruction.contains("'es'"));
        assert!(instruction.contains("'en'"));

        let auto = GeminiProvider::new("auto", "none");
        let instruction = auto.system_instruction();
        assert!(!instruction.contains("'auto'"));
        assert!(!instruction.contains("Translate"));
    }

    #[test]
    fn test_setup_message_shape() {
        let provider = GeminiProvider::new("auto", "none");
        let setup = provider.setup_message();
        assert_eq!(setup["setup"]["model"], MODEL);
        assert!(setup["setup"]["system_instruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("radio"));
    }

    #[test]
    fn test_parse_partial_and_final_content() {
        let provider = GeminiProvider::new("auto", "none");
        let partial = r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hello "}]}}}"#;
        let frame = provider.parse_content(partial).unwrap();
        assert_eq!(frame.text, "hello ");
        assert!(!frame.is_final);

        let fin = r#"{"serverContent":{"turnComplete":true,"modelTurn":{"parts":[{"text":"world"}]}}}"#;
        let frame = provider.parse_content(fin).unwrap();
        assert_eq!(frame.text, "world");
        assert!(frame.is_final);
    }

    #[test]
    fn test_parse_ignores_unrelated_messages() {
        let provider = GeminiProvider::new("auto", "none");
        assert!(provider.parse_content(r#"{"setupComplete":{}}"#).is_none());
    }
}
