//! ASR adapter: HTTP client for a local faster-whisper-style transcription
//! server. Converts PCM samples to WAV in memory, posts base64 JSON, retries
//! once on cold-start failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::capability::{Asr, Capability};
use crate::error::ConversationError;
use crate::protocol::event::AudioData;

pub struct WhisperHttpAsr {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    model: &'a str,
    audio_base64: &'a str,
    format: &'a str,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

impl WhisperHttpAsr {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn run_once(&self, audio_b64: &str) -> Result<String> {
        let request = TranscribeRequest { model: &self.model, audio_base64: audio_b64, format: "wav" };
        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .json(&request)
            .send()
            .await
            .context("failed to connect to transcription server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("transcription server error ({status}): {body}");
        }

        let parsed: TranscribeResponse = response.json().await.context("invalid transcription response")?;
        Ok(parsed.text)
    }
}

fn pcm_to_wav(pcm_bytes: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let samples: Vec<i16> = pcm_bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("failed to create WAV writer")?;
        for sample in samples {
            writer.write_sample(sample).context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV")?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl Capability for WhisperHttpAsr {
    async fn setup(&self) -> Result<()> {
        reqwest::Url::parse(&format!("{}/v1/audio/transcriptions", self.base_url))
            .context("invalid ASR base_url")?;
        info!(base_url = %self.base_url, model = %self.model, "ASR adapter configured");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("ASR adapter shut down");
        Ok(())
    }
}

#[async_trait]
impl Asr for WhisperHttpAsr {
    async fn recognize(&self, audio: AudioData) -> Result<String> {
        if audio.data.is_empty() {
            return Ok(String::new());
        }

        debug!(bytes = audio.data.len(), "transcribing audio segment");
        let wav_bytes = pcm_to_wav(&audio.data, 16_000)?;
        let audio_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &wav_bytes);

        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                info!("retrying transcription (attempt {})", attempt + 1);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match self.run_once(&audio_b64).await {
                Ok(text) => return Ok(text),
                Err(e) => last_err = Some(e),
            }
        }

        let detail = last_err.map(|e| format!("{e:#}")).unwrap_or_else(|| "transcription failed".to_string());
        Err(ConversationError::processing(detail).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_to_wav_produces_a_valid_wav_header() {
        let pcm: Vec<u8> = vec![0, 0, 1, 0, 2, 0];
        let wav = pcm_to_wav(&pcm, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn empty_pcm_produces_an_empty_wav_body() {
        let wav = pcm_to_wav(&[], 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
    }
}
