//! Audio Input Pipeline (§4.2): VAD gating, buffering, segment detection,
//! and the ASR driver, wired together into a per-session monitor loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::capability::{Asr, Vad};
use crate::protocol::event::{AudioData, AudioFormat, TextData};

use super::buffer::AudioBuffer;
use super::segment::{self, Decision};

pub const CHECK_INTERVAL: Duration = Duration::from_millis(200);

static SPECIAL_TOKENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\|.*?\|>").unwrap());

fn clean_text(text: &str) -> String {
    SPECIAL_TOKENS.replace_all(text, "").trim().to_string()
}

struct Inner {
    buffer: Mutex<AudioBuffer>,
    transcript_segments: Mutex<Vec<String>>,
    is_processing: AtomicBool,
    client_speech_ended: Notify,
    client_ended_flag: AtomicBool,
}

/// Runs the monitor loop and drives ASR for one session. `on_result` is
/// called with the final joined transcript whenever a final segment closes
/// (even if empty, so the orchestrator can reset turn state).
pub struct AudioInputPipeline<F> {
    inner: Arc<Inner>,
    vad: Option<Arc<dyn Vad>>,
    asr: Arc<dyn Asr>,
    on_result: Arc<F>,
    session_id: String,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F> AudioInputPipeline<F>
where
    F: Fn(TextData) + Send + Sync + 'static,
{
    pub fn new(session_id: impl Into<String>, vad: Option<Arc<dyn Vad>>, asr: Arc<dyn Asr>, on_result: F) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                buffer: Mutex::new(AudioBuffer::new()),
                transcript_segments: Mutex::new(Vec::new()),
                is_processing: AtomicBool::new(false),
                client_speech_ended: Notify::new(),
                client_ended_flag: AtomicBool::new(false),
            }),
            vad,
            asr,
            on_result: Arc::new(on_result),
            session_id: session_id.into(),
            task: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.monitor_loop().await }));
        info!(session_id = %self.session_id, "audio input pipeline started");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!(session_id = %self.session_id, "audio input pipeline stopped");
        }
    }

    /// VAD-gate and buffer one chunk of raw audio (§4.2 chunk handler).
    pub async fn process_chunk(&self, chunk: Vec<u8>) {
        let is_speech = match &self.vad {
            Some(vad) => vad.detect(&chunk).await.unwrap_or_else(|e| {
                warn!(session_id = %self.session_id, error = %e, "VAD error, treating chunk as non-speech");
                false
            }),
            None => {
                warn!(session_id = %self.session_id, "no VAD configured, dropping chunk");
                false
            }
        };

        if is_speech {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.append(chunk, Instant::now());
            debug!(session_id = %self.session_id, "speech chunk buffered");
        } else {
            debug!(session_id = %self.session_id, "non-speech chunk discarded");
        }
    }

    pub fn signal_client_speech_end(&self) {
        info!(session_id = %self.session_id, "client speech-end signal");
        self.inner.client_ended_flag.store(true, Ordering::SeqCst);
        self.inner.client_speech_ended.notify_one();
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.client_speech_ended.notified() => {}
            }

            let client_ended = self.inner.client_ended_flag.swap(false, Ordering::SeqCst);
            self.check_and_process(client_ended).await;
        }
    }

    async fn check_and_process(self: &Arc<Self>, client_ended: bool) {
        if self.inner.is_processing.load(Ordering::SeqCst) {
            return;
        }

        let drained = {
            let mut buffer = self.inner.buffer.lock().await;
            if buffer.is_empty() && !client_ended {
                return;
            }

            let decision: Decision = segment::evaluate(
                std::time::Duration::from_secs_f64(buffer.duration_seconds()),
                buffer.last_speech_time(),
                client_ended,
                Instant::now(),
            );

            if !decision.should_process {
                return;
            }

            info!(
                session_id = %self.session_id,
                reason = ?decision.reason,
                is_final = decision.is_final,
                "processing audio segment"
            );

            Some((buffer.drain(), decision.is_final))
        };

        if let Some((audio_bytes, is_final)) = drained {
            self.inner.is_processing.store(true, Ordering::SeqCst);
            self.process_audio_segment(audio_bytes, is_final).await;
            self.inner.is_processing.store(false, Ordering::SeqCst);
        }
    }

    async fn process_audio_segment(&self, audio_bytes: Vec<u8>, is_final: bool) {
        if audio_bytes.is_empty() {
            if is_final {
                self.send_final_result().await;
            }
            return;
        }

        let audio = AudioData::new(audio_bytes, AudioFormat::Pcm);
        match self.asr.recognize(audio).await {
            Ok(recognized) => {
                let cleaned = clean_text(&recognized);
                if !cleaned.is_empty() {
                    info!(session_id = %self.session_id, text = %cleaned, "ASR result");
                    self.inner.transcript_segments.lock().await.push(cleaned);
                }
                if is_final {
                    self.send_final_result().await;
                }
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "ASR processing failed");
                if is_final {
                    self.send_final_result().await;
                }
            }
        }
    }

    async fn send_final_result(&self) {
        let mut segments = self.inner.transcript_segments.lock().await;
        let final_text = segments
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        segments.clear();
        drop(segments);

        info!(session_id = %self.session_id, text = %final_text, "final transcript");
        (self.on_result)(TextData::new(final_text, true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct AlwaysSpeechVad;
    #[async_trait]
    impl Vad for AlwaysSpeechVad {
        async fn detect(&self, _chunk: &[u8]) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct EchoAsr;
    #[async_trait]
    impl Asr for EchoAsr {
        async fn recognize(&self, audio: AudioData) -> anyhow::Result<String> {
            Ok(format!("<|tag|>heard {} bytes", audio.data.len()))
        }
    }

    #[tokio::test]
    async fn client_speech_end_triggers_a_final_result_with_cleaned_text() {
        let results: Arc<StdMutex<Vec<TextData>>> = Arc::new(StdMutex::new(Vec::new()));
        let results2 = Arc::clone(&results);

        let pipeline = AudioInputPipeline::new(
            "s1",
            Some(Arc::new(AlwaysSpeechVad)),
            Arc::new(EchoAsr),
            move |t: TextData| results2.lock().unwrap().push(t),
        );

        pipeline.process_chunk(vec![0u8; 100]).await;
        pipeline.start().await;
        pipeline.signal_client_speech_end();

        // allow the monitor loop to wake on the notify and process
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.stop().await;

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_final);
        assert_eq!(results[0].text, "heard 100 bytes");
    }

    #[tokio::test]
    async fn non_speech_chunks_are_never_buffered() {
        struct NeverSpeech;
        #[async_trait]
        impl Vad for NeverSpeech {
            async fn detect(&self, _chunk: &[u8]) -> anyhow::Result<bool> {
                Ok(false)
            }
        }

        let results: Arc<StdMutex<Vec<TextData>>> = Arc::new(StdMutex::new(Vec::new()));
        let results2 = Arc::clone(&results);
        let pipeline = AudioInputPipeline::new(
            "s1",
            Some(Arc::new(NeverSpeech)),
            Arc::new(EchoAsr),
            move |t: TextData| results2.lock().unwrap().push(t),
        );

        pipeline.process_chunk(vec![0u8; 100]).await;
        pipeline.start().await;
        pipeline.signal_client_speech_end();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.stop().await;

        // buffer was empty, so the final result is empty text, not "heard ..."
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "");
    }
}
