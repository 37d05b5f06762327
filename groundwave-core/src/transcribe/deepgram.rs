//! Deepgram streaming provider: WebSocket, 16 kHz linear-16 mono, a
//! KeepAlive ping every 8 s, auto-reconnect on the next audio chunk.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::errors::TranscribeError;

use super::{TranscriptionFrame, TranscriptionProvider, TARGET_SAMPLE_RATE};

const PROVIDER: &str = "deepgram";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct DeepgramProvider {
    language: String,
    socket: Option<Socket>,
    last_keepalive: Instant,
}

impl DeepgramProvider {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
            socket: None,
            last_keepalive: Instant::now(),
        }
    }

    fn websocket_url(&self) -> String {
        let mut params = vec![
            "model=nova-2".to_string(),
            "encoding=linear16".to_string(),
            format!("sample_rate={TARGET_SAMPLE_RATE}"),
            "channels=1".to_string(),
            "punctuate=true".to_string(),
            "interim_results=false".to_string(),
            "utterance_end_ms=1000".to_string(),
            "vad_events=true".to_string(),
        ];
        if self.language != "auto" && !self.language.is_empty() {
            params.push(format!("language={}", self.language));
        }
        format!("wss://api.deepgram.com/v1/listen?{}", params.join("&"))
    }

    fn parse_transcript(&self, raw: &str) -> Option<TranscriptionFrame> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        if value.get("type").and_then(|t| t.as_str()) != Some("Results") {
            return None;
        }
        let alternative = &value["channel"]["alternatives"][0];
        let text = alternative["transcript"].as_str()?.to_string();
        if text.is_empty() {
            return None;
        }
        Some(TranscriptionFrame {
            text,
            language: value["channel"]["detected_language"]
                .as_str()
                .unwrap_or(&self.language)
                .to_string(),
            is_final: value["is_final"].as_bool().unwrap_or(true),
            confidence: alternative["confidence"].as_f64().map(|c| c as f32),
        })
    }
}

#[async_trait]
impl TranscriptionProvider for DeepgramProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn connect(&mut self, api_key: &str) -> Result<(), TranscribeError> {
        let url = self.websocket_url();
        let mut request = url
            .into_client_request()
            .map_err(|err| TranscribeError::classify(PROVIDER, &err.to_string()))?;
        let auth = format!("Token {api_key}")
            .parse()
            .map_err(|_| TranscribeError::InvalidApiKey { provider: PROVIDER })?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| TranscribeError::classify(PROVIDER, &err.to_string()))?;
        self.socket = Some(socket);
        self.last_keepalive = Instant::now();
        info!(language = %self.language, "connected to Deepgram");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
            debug!("Deepgram connection closed");
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

        if self.last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            socket
                .send(Message::text(r#"{"type":"KeepAlive"}"#))
                .await
                .map_err(|err| TranscribeError::classify(PROVIDER, &err.to_string()))?;
            self.last_keepalive = Instant::now();
        }

        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        socket
            .send(Message::binary(bytes))
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
                    if let Some(frame) = self.parse_transcript(raw.as_str()) {
                        frames.push(frame);
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
    fn test_url_contains_audio_parameters() {
        let provider = DeepgramProvider::new("en");
        let url = provider.websocket_url();
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("language=en"));
    }

    #[test]
    fn test_auto_language_omitted() {
        let provider = DeepgramProvider::new("auto");
        assert!(!provider.websocket_url().contains("language="));
    }

    #[test]
    fn test_parse_transcript_result() {
        let provider = DeepgramProvider::new("auto");
        let raw = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {
                "alternatives": [{"transcript": "station calling", "confidence": 0.92}]
            }
        }"#;
        let frame = provider.parse_transcript(raw).unwrap();
        assert_eq!(frame.text, "station calling");
        assert!(frame.is_final);
        assert!((frame.confidence.unwrap() - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ignores_empty_and_metadata() {
        let provider = DeepgramProvider::new("auto");
        assert!(provider
            .parse_transcript(r#"{"type":"Metadata"}"#)
            .is_none());
        assert!(provider
            .parse_transcript(
                r#"{"type":"Results","channel":{"alternatives":[{"transcript":""}]}}"#
            )
            .is_none());
    }
}
