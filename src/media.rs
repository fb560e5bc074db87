use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::SwitchboardError;

/// Events surfaced by the transcription side of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Voice activity detected: the caller started talking, so any audio
    /// currently playing must be cut off.
    SpeechStarted,
    /// A completed utterance, ready for the engine.
    Utterance(String),
}

/// Speech codec boundary (STT in, TTS out). The actual transcription and
/// synthesis pipeline is an external collaborator; one session is opened
/// per call so the transcriber can keep per-call buffers.
#[async_trait]
pub trait SpeechPipeline: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SpeechSession>, SwitchboardError>;
}

#[async_trait]
pub trait SpeechSession: Send {
    /// Feed one inbound audio chunk; yields zero or more events.
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<Vec<SttEvent>, SwitchboardError>;

    /// Render dialogue text to outbound audio frames.
    async fn synthesize(&mut self, text: &str) -> Result<Vec<Vec<u8>>, SwitchboardError>;
}

pub struct HttpSpeechPipeline {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpeechPipeline {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SpeechPipeline for HttpSpeechPipeline {
    async fn open(&self) -> Result<Box<dyn SpeechSession>, SwitchboardError> {
        Ok(Box::new(HttpSpeechSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            stream_id: Uuid::new_v4(),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum WireSttEvent {
    SpeechStarted,
    Utterance { text: String },
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    events: Vec<WireSttEvent>,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    #[serde(default)]
    frames: Vec<String>,
}

struct HttpSpeechSession {
    client: reqwest::Client,
    base_url: String,
    stream_id: Uuid,
}

#[async_trait]
impl SpeechSession for HttpSpeechSession {
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<Vec<SttEvent>, SwitchboardError> {
        let url = format!("{}/transcribe", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "streamId": self.stream_id,
                "audio": BASE64.encode(chunk),
            }))
            .send()
            .await
            .map_err(|e| SwitchboardError::collaborator("speech", e))?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::collaborator("speech", resp.status()));
        }
        let parsed: TranscribeResponse = resp
            .json()
            .await
            .map_err(|e| SwitchboardError::collaborator("speech", e))?;
        Ok(parsed
            .events
            .into_iter()
            .map(|e| match e {
                WireSttEvent::SpeechStarted => SttEvent::SpeechStarted,
                WireSttEvent::Utterance { text } => SttEvent::Utterance(text),
            })
            .collect())
    }

    async fn synthesize(&mut self, text: &str) -> Result<Vec<Vec<u8>>, SwitchboardError> {
        let url = format!("{}/synthesize", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "streamId": self.stream_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| SwitchboardError::collaborator("speech", e))?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::collaborator("speech", resp.status()));
        }
        let parsed: SynthesizeResponse = resp
            .json()
            .await
            .map_err(|e| SwitchboardError::collaborator("speech", e))?;
        parsed
            .frames
            .iter()
            .map(|f| {
                BASE64
                    .decode(f)
                    .map_err(|e| SwitchboardError::collaborator("speech", e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::json;

    #[tokio::test]
    async fn wire_events_map_to_stt_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/transcribe",
                post(|| async {
                    Json(json!({
                        "events": [
                            {"kind": "speech_started"},
                            {"kind": "utterance", "text": "hello"}
                        ]
                    }))
                }),
            )
            .route(
                "/synthesize",
                post(|| async { Json(json!({"frames": [BASE64.encode(b"pcm")]})) }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let pipeline =
            HttpSpeechPipeline::new(reqwest::Client::new(), format!("http://{addr}"));
        let mut session = pipeline.open().await.unwrap();

        let events = session.push_audio(b"chunk").await.unwrap();
        assert_eq!(
            events,
            vec![SttEvent::SpeechStarted, SttEvent::Utterance("hello".into())]
        );

        let frames = session.synthesize("hello caller").await.unwrap();
        assert_eq!(frames, vec![b"pcm".to_vec()]);
    }
}
