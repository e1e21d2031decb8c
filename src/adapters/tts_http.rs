//! TTS adapter: HTTP client for a local OpenAI-speech-compatible server.
//! Requests WAV, converts to raw PCM Int16, and streams back a single
//! chunk followed by a final marker (§4.4).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use serde::Serialize;
use tracing::{debug, info};

use crate::capability::{Capability, Tts};
use crate::error::ConversationError;
use crate::protocol::event::{AudioData, AudioFormat, TextData};

const MAX_RETRIES: u32 = 3;

pub struct HttpTts {
    base_url: String,
    voice: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl HttpTts {
    pub fn new(base_url: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            voice: voice.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let request = SpeechRequest { model: "tts-1", input: text, voice: &self.voice, response_format: "wav" };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request)
            .send()
            .await
            .context("failed to connect to TTS server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("TTS server error ({status}): {body}");
        }

        let wav_bytes = response.bytes().await.context("failed to read TTS response")?.to_vec();
        wav_to_pcm_i16(&wav_bytes)
    }
}

fn wav_to_pcm_i16(wav_bytes: &[u8]) -> Result<Vec<u8>> {
    let cursor = std::io::Cursor::new(wav_bytes);
    let mut reader = hound::WavReader::new(cursor).context("failed to parse WAV response")?;
    let spec = reader.spec();

    let mut out = Vec::new();
    match spec.sample_format {
        hound::SampleFormat::Int => {
            for sample in reader.samples::<i16>() {
                out.extend_from_slice(&sample.context("invalid PCM sample")?.to_le_bytes());
            }
        }
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                let s = sample.context("invalid float sample")?;
                let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                out.extend_from_slice(&clamped.to_le_bytes());
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl Capability for HttpTts {
    async fn setup(&self) -> Result<()> {
        reqwest::Url::parse(&format!("{}/v1/audio/speech", self.base_url)).context("invalid TTS base_url")?;
        info!(base_url = %self.base_url, voice = %self.voice, "TTS adapter configured");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("TTS adapter shut down");
        Ok(())
    }
}

#[async_trait]
impl Tts for HttpTts {
    async fn synthesize_stream(&self, text: TextData) -> Result<BoxStream<'static, AudioData>> {
        if text.text.is_empty() {
            return Ok(Box::pin(stream::iter(vec![AudioData::final_marker(AudioFormat::Pcm)])));
        }

        debug!(chars = text.text.len(), "synthesizing speech");

        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                info!("retrying TTS synthesis (attempt {})", attempt + 1);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match self.synthesize(&text.text).await {
                Ok(pcm_bytes) => {
                    info!(bytes = pcm_bytes.len(), "TTS produced audio");
                    return Ok(Box::pin(stream::iter(vec![
                        AudioData::new(pcm_bytes, AudioFormat::Pcm),
                        AudioData::final_marker(AudioFormat::Pcm),
                    ])));
                }
                Err(e) => last_err = Some(e),
            }
        }

        let detail = last_err.map(|e| format!("{e:#}")).unwrap_or_else(|| "TTS synthesis failed".to_string());
        Err(ConversationError::processing(detail).into())
    }
}
