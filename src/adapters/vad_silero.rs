//! Silero VAD adapter: wraps the ONNX Runtime model behind the `Vad` trait
//! contract from §4.4 (fixed 512-sample window at 16kHz, stateful hidden
//! state carried between calls).

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ort::session::Session;
use ort::value::Value;
use tracing::info;

use crate::capability::{Capability, Vad};

const SILERO_VAD_URL: &str = "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
const MODEL_FILENAME: &str = "silero_vad.onnx";
const SAMPLE_RATE: i64 = 16_000;
pub const WINDOW_SIZE: usize = 512;

struct State {
    session: Session,
    hidden: Vec<f32>,
}

pub struct SileroVadAdapter {
    state: Mutex<State>,
    threshold: f32,
}

impl SileroVadAdapter {
    pub fn new(threshold: f32) -> Result<Self> {
        let model_path = Self::ensure_model()?;
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(&model_path)
            .context("failed to create ONNX session for Silero VAD")?;

        info!("Silero VAD loaded from {}", model_path.display());

        Ok(Self {
            state: Mutex::new(State { session, hidden: vec![0.0f32; 2 * 128] }),
            threshold,
        })
    }

    fn ensure_model() -> Result<PathBuf> {
        let model_dir = directories::ProjectDirs::from("", "", "voicebridge")
            .context("could not determine data directory")?
            .data_dir()
            .join("models");
        std::fs::create_dir_all(&model_dir).context("failed to create models directory")?;

        let model_path = model_dir.join(MODEL_FILENAME);
        if model_path.exists() {
            return Ok(model_path);
        }

        info!("downloading Silero VAD model to {}", model_path.display());
        let response = reqwest::blocking::get(SILERO_VAD_URL).context("failed to download Silero VAD model")?;
        if !response.status().is_success() {
            anyhow::bail!("failed to download Silero VAD model: HTTP {}", response.status());
        }
        let bytes = response.bytes().context("failed to read Silero VAD model bytes")?;
        std::fs::write(&model_path, &bytes).context("failed to save Silero VAD model")?;
        Ok(model_path)
    }

    fn run_inference(&self, audio: &[f32]) -> Result<f32> {
        let mut state = self.state.lock().expect("Silero VAD state mutex poisoned");

        let input = Value::from_array(([1usize, audio.len()], audio.to_vec()))?;
        let hidden = Value::from_array(([2usize, 1usize, 128usize], state.hidden.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let outputs = state.session.run(ort::inputs![input, hidden, sr])?;

        let (_shape, prob) = outputs[0].try_extract_tensor::<f32>()?;
        let prob = prob.first().copied().unwrap_or(0.0);

        let (_shape, new_hidden) = outputs[1].try_extract_tensor::<f32>()?;
        if new_hidden.len() == state.hidden.len() {
            state.hidden.copy_from_slice(new_hidden);
        }

        Ok(prob)
    }
}

fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[async_trait]
impl Capability for SileroVadAdapter {
    /// Runs one silent-window inference so a broken ONNX session (bad model
    /// file, incompatible opset) fails at startup rather than on the first
    /// real audio frame.
    async fn setup(&self) -> Result<()> {
        let silence = vec![0.0f32; WINDOW_SIZE];
        self.run_inference(&silence).context("Silero VAD warm-up inference failed")?;
        info!("Silero VAD warmed up and ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Silero VAD state mutex poisoned");
        state.hidden.fill(0.0);
        info!("Silero VAD hidden state cleared on shutdown");
        Ok(())
    }
}

#[async_trait]
impl Vad for SileroVadAdapter {
    async fn detect(&self, chunk: &[u8]) -> Result<bool> {
        let samples: Vec<i16> = chunk
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let audio = i16_to_f32(&samples);
        let prob = self.run_inference(&audio)?;
        Ok(prob >= self.threshold)
    }

    fn window_size(&self) -> Option<usize> {
        Some(WINDOW_SIZE)
    }

    async fn reset_state(&self) {
        let mut state = self.state.lock().expect("Silero VAD state mutex poisoned");
        state.hidden.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_to_f32_normalizes_into_unit_range() {
        let samples = vec![0i16, 32767, -32768];
        let converted = i16_to_f32(&samples);
        assert!((converted[0]).abs() < 1e-6);
        assert!((converted[1] - 1.0).abs() < 1e-3);
        assert!((converted[2] + 1.0).abs() < 1e-3);
    }
}
