//! Conversation Orchestrator (§4.3): turn context, barge-in interruption,
//! LLM streaming, sentence splitting, TTS fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::audio::AudioInputPipeline;
use crate::capability::registry::CapabilityRegistry;
use crate::protocol::event::{AudioData, EventType, TextData};
use crate::session::{OutboundFrame, Outbox};

static SENTENCE_DELIMITER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,。!?;、，.!?;]").unwrap());

#[derive(Debug, Clone, Default)]
struct TurnContext {
    last_user_text: String,
    was_interrupted: bool,
}

pub struct Orchestrator {
    session_id: String,
    registry: Arc<CapabilityRegistry>,
    outbox: Outbox,
    turn_context: Mutex<TurnContext>,
    interrupt_flag: Arc<AtomicBool>,
    audio_input: Mutex<Option<Arc<AudioInputPipeline<InputResultSink>>>>,
    input_rx_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

type InputResultSink = Box<dyn Fn(TextData) + Send + Sync>;

impl Orchestrator {
    pub fn new(session_id: impl Into<String>, registry: Arc<CapabilityRegistry>, outbox: Outbox) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            registry,
            outbox,
            turn_context: Mutex::new(TurnContext::default()),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            audio_input: Mutex::new(None),
            input_rx_task: Mutex::new(None),
        })
    }

    /// Wire up the audio pipeline and its result-routing task. Done
    /// separately from `new` because the pipeline's callback needs a way to
    /// reach back into `on_input_result` without a circular `Arc`.
    pub async fn start(self: &Arc<Self>, vad: Option<Arc<dyn crate::capability::Vad>>, asr: Arc<dyn crate::capability::Asr>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TextData>();
        let sink: InputResultSink = Box::new(move |text| {
            let _ = tx.send(text);
        });

        let pipeline = AudioInputPipeline::new(self.session_id.clone(), vad, asr, sink);
        pipeline.start().await;
        *self.audio_input.lock().await = Some(Arc::clone(&pipeline));

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                this.on_input_result(text).await;
            }
        });
        *self.input_rx_task.lock().await = Some(task);

        info!(session_id = %self.session_id, "conversation orchestrator started");
    }

    pub async fn stop(&self) {
        if let Some(pipeline) = self.audio_input.lock().await.take() {
            pipeline.stop().await;
        }
        if let Some(task) = self.input_rx_task.lock().await.take() {
            task.abort();
        }
        if let Some(llm) = self.registry.llm().await {
            llm.clear_history(&self.session_id).await;
        }
        info!(session_id = %self.session_id, "conversation orchestrator stopped");
    }

    // ==================== inputs ====================

    pub async fn handle_audio(&self, chunk: Vec<u8>) {
        if !self.interrupt_flag.swap(true, Ordering::SeqCst) {
            self.turn_context.lock().await.was_interrupted = true;
            debug!(session_id = %self.session_id, "barge-in interruption detected");
        }

        if let Some(pipeline) = self.audio_input.lock().await.as_ref() {
            pipeline.process_chunk(chunk).await;
        }
    }

    pub async fn handle_speech_end(&self) {
        if let Some(pipeline) = self.audio_input.lock().await.as_ref() {
            pipeline.signal_client_speech_end();
        }
    }

    pub async fn handle_text_input(&self, text: String) {
        let normalized = text.trim().to_string();
        self.on_input_result(TextData::new(normalized, true)).await;
    }

    async fn on_input_result(&self, text_data: TextData) {
        if !text_data.is_final {
            return;
        }

        if text_data.is_empty() {
            debug!(session_id = %self.session_id, "empty input result, clearing interrupt state");
            self.turn_context.lock().await.was_interrupted = false;
            return;
        }

        let user_text = {
            let mut ctx = self.turn_context.lock().await;
            let combined = if ctx.was_interrupted {
                format!("{} {}", ctx.last_user_text, text_data.text).trim().to_string()
            } else {
                text_data.text.clone()
            };
            ctx.last_user_text = combined.clone();
            ctx.was_interrupted = false;
            combined
        };

        self.interrupt_flag.store(false, Ordering::SeqCst);
        self.trigger_conversation(user_text).await;
    }

    // ==================== turn execution ====================

    async fn trigger_conversation(&self, user_text: String) {
        let llm = match self.registry.llm().await {
            Some(llm) => llm,
            None => {
                error!(session_id = %self.session_id, "no LLM module registered");
                return;
            }
        };
        let tts = self.registry.tts().await;

        let llm_input = TextData::new(user_text, true);

        match tts {
            Some(tts) => self.process_with_tts(llm_input, llm, tts).await,
            None => self.process_text_only(llm_input, llm).await,
        }
    }

    async fn process_with_tts(&self, llm_input: TextData, llm: Arc<dyn crate::capability::Llm>, tts: Arc<dyn crate::capability::Tts>) {
        let mut stream = match llm.chat_stream(llm_input, &self.session_id).await {
            Ok(s) => s,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "LLM call failed");
                self.send_event(EventType::Error, crate::protocol::event::ErrorData { text: "LLM error".into() }).await;
                return;
            }
        };

        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            if self.interrupt_flag.load(Ordering::SeqCst) {
                info!(session_id = %self.session_id, "turn interrupted during LLM streaming");
                return;
            }
            if chunk.text.is_empty() {
                continue;
            }
            buffer.push_str(&chunk.text);

            if let Some(mat) = SENTENCE_DELIMITER.find(&buffer) {
                let end = mat.end();
                let sentence = buffer[..end].to_string();
                buffer = buffer[end..].to_string();
                self.spawn_sentence(sentence, false, Arc::clone(&tts));
            }
        }

        if self.interrupt_flag.load(Ordering::SeqCst) {
            return;
        }

        if !buffer.is_empty() {
            self.spawn_sentence(buffer, true, tts);
        } else {
            self.send_event(EventType::ServerTextResponse, TextData::new("", true)).await;
        }
    }

    async fn process_text_only(&self, llm_input: TextData, llm: Arc<dyn crate::capability::Llm>) {
        let mut stream = match llm.chat_stream(llm_input, &self.session_id).await {
            Ok(s) => s,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "LLM call failed");
                self.send_event(EventType::Error, crate::protocol::event::ErrorData { text: "LLM error".into() }).await;
                return;
            }
        };

        while let Some(chunk) = stream.next().await {
            if self.interrupt_flag.load(Ordering::SeqCst) {
                return;
            }
            if !chunk.text.is_empty() {
                self.send_event(EventType::ServerTextResponse, TextData::new(chunk.text, false)).await;
            }
        }

        if !self.interrupt_flag.load(Ordering::SeqCst) {
            self.send_event(EventType::ServerTextResponse, TextData::new("", true)).await;
        }
    }

    fn spawn_sentence(&self, sentence: String, is_final: bool, tts: Arc<dyn crate::capability::Tts>) {
        let session_id = self.session_id.clone();
        let outbox = self.outbox.clone();
        let interrupt_flag = Arc::clone(&self.interrupt_flag);
        tokio::spawn(async move {
            send_sentence(session_id, outbox, interrupt_flag, sentence, is_final, tts).await;
        });
    }

    async fn send_event(&self, event_type: EventType, payload: impl serde::Serialize) {
        let event = crate::protocol::event::StreamEvent::new(event_type, payload).with_session(self.session_id.clone());
        let _ = self.outbox.send(OutboundFrame::Event(event)).await;
    }
}

/// Fire-and-forget per-sentence send: text first, then streamed audio
/// (§4.3 `_send_sentence`). Runs as a detached task so consecutive sentences
/// can overlap on the wire; the shared `outbox` preserves per-session FIFO
/// ordering even so.
async fn send_sentence(
    session_id: String,
    outbox: Outbox,
    interrupt_flag: Arc<AtomicBool>,
    sentence: String,
    is_final: bool,
    tts: Arc<dyn crate::capability::Tts>,
) {
    if interrupt_flag.load(Ordering::SeqCst) {
        return;
    }

    let text_event = crate::protocol::event::StreamEvent::new(
        EventType::ServerTextResponse,
        TextData::new(sentence.clone(), is_final),
    )
    .with_session(session_id.clone());
    let _ = outbox.send(OutboundFrame::Event(text_event)).await;

    let mut audio_stream = match tts.synthesize_stream(TextData::new(sentence, false)).await {
        Ok(s) => s,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "TTS call failed");
            return;
        }
    };

    while let Some(audio_chunk) = audio_stream.next().await {
        if interrupt_flag.load(Ordering::SeqCst) {
            break;
        }
        if audio_chunk.data.is_empty() && !audio_chunk.is_final {
            continue;
        }
        let audio_event = crate::protocol::event::StreamEvent::new(
            EventType::ServerAudioResponse,
            AudioData { is_final: audio_chunk.is_final, ..audio_chunk },
        )
        .with_session(session_id.clone());
        let _ = outbox.send(OutboundFrame::Event(audio_event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::AudioFormat;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use std::sync::Mutex as StdMutex;

    struct EchoAsr;
    #[async_trait]
    impl crate::capability::Asr for EchoAsr {
        async fn recognize(&self, _audio: crate::protocol::event::AudioData) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct ScriptedLlm {
        chunks: Vec<&'static str>,
    }
    #[async_trait]
    impl crate::capability::Llm for ScriptedLlm {
        async fn chat_stream(&self, _input: TextData, _session_id: &str) -> anyhow::Result<BoxStream<'static, TextData>> {
            let items: Vec<TextData> = self.chunks.iter().map(|c| TextData::new(*c, false)).collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    struct SilentTts;
    #[async_trait]
    impl crate::capability::Tts for SilentTts {
        async fn synthesize_stream(&self, _text: TextData) -> anyhow::Result<BoxStream<'static, AudioData>> {
            Ok(Box::pin(stream::iter(vec![AudioData::new(vec![1, 2, 3], AudioFormat::Pcm)])))
        }
    }

    fn collect_events(mut rx: mpsc::Receiver<OutboundFrame>) -> Arc<StdMutex<Vec<crate::protocol::event::StreamEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events2 = Arc::clone(&events);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let OutboundFrame::Event(e) = frame {
                    events2.lock().unwrap().push(e);
                }
            }
        });
        events
    }

    #[tokio::test]
    async fn text_only_turn_ends_with_one_final_empty_marker() {
        let registry = CapabilityRegistry::new();
        registry.set_llm(Arc::new(ScriptedLlm { chunks: vec!["hi", " there"] })).await;

        let (tx, rx) = mpsc::channel(32);
        let events = collect_events(rx);
        let orchestrator = Orchestrator::new("s1", registry, tx);
        orchestrator.start(None, Arc::new(EchoAsr)).await;

        orchestrator.handle_text_input("hello".into()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let events = events.lock().unwrap();
        let texts: Vec<TextData> = events
            .iter()
            .filter(|e| e.event_type == Some(EventType::ServerTextResponse))
            .map(|e| serde_json::from_value(e.event_data.clone()).unwrap())
            .collect();
        assert_eq!(texts.last().unwrap().is_final, true);
        assert_eq!(texts.last().unwrap().text, "");
    }

    #[tokio::test]
    async fn with_tts_sends_text_before_audio_for_each_sentence() {
        let registry = CapabilityRegistry::new();
        registry.set_llm(Arc::new(ScriptedLlm { chunks: vec!["Hello, world"] })).await;
        registry.set_tts(Arc::new(SilentTts)).await;

        let (tx, rx) = mpsc::channel(32);
        let events = collect_events(rx);
        let orchestrator = Orchestrator::new("s1", registry, tx);
        orchestrator.start(None, Arc::new(EchoAsr)).await;

        orchestrator.handle_text_input("hi".into()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.event_type == Some(EventType::ServerTextResponse)));
        assert!(events.iter().any(|e| e.event_type == Some(EventType::ServerAudioResponse)));
        let first_text_idx = events.iter().position(|e| e.event_type == Some(EventType::ServerTextResponse)).unwrap();
        let first_audio_idx = events.iter().position(|e| e.event_type == Some(EventType::ServerAudioResponse)).unwrap();
        assert!(first_text_idx < first_audio_idx);
    }

    #[tokio::test]
    async fn barge_in_concatenates_previous_and_new_utterance() {
        let registry = CapabilityRegistry::new();
        registry.set_llm(Arc::new(ScriptedLlm { chunks: vec![] })).await;

        let (tx, rx) = mpsc::channel(32);
        let _events = collect_events(rx);
        let orchestrator = Orchestrator::new("s1", registry, tx);
        orchestrator.start(None, Arc::new(EchoAsr)).await;

        orchestrator.handle_text_input("tell me a long story".into()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // simulate barge-in: raw audio arrives, marking an interruption
        orchestrator.handle_audio(vec![0u8; 10]).await;
        assert!(orchestrator.turn_context.lock().await.was_interrupted);

        orchestrator.on_input_result(TextData::new("continue please", true)).await;
        let ctx = orchestrator.turn_context.lock().await;
        assert_eq!(ctx.last_user_text, "tell me a long story continue please");
        assert!(!ctx.was_interrupted);
    }
}
