//! Reference capability adapters (§10): HTTP/ONNX implementations of the
//! `Vad`/`Asr`/`Llm`/`Tts` traits, wired up by `cli::run` from config.

#[cfg(feature = "voice")]
pub mod vad_silero;

pub mod asr_http;
pub mod llm_openai;
pub mod tts_http;

pub use asr_http::WhisperHttpAsr;
pub use llm_openai::OpenAiLlm;
pub use tts_http::HttpTts;

#[cfg(feature = "voice")]
pub use vad_silero::SileroVadAdapter;
