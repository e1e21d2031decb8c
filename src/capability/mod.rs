//! Capability contracts (§4.4) and the process-wide registry that resolves
//! them by role name at turn time.

pub mod registry;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::protocol::event::{AudioData, TextData};

/// Process lifecycle shared by all four roles (§4.4): `setup()` runs once at
/// registry build time before a capability is handed to any session, and
/// `close()` runs once at server shutdown. Implementations with nothing to
/// warm up or release can keep the default no-ops; the point is that every
/// adapter is a real `impl Capability` wired into startup/shutdown, not just
/// a trait nobody calls.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Voice-activity detection. Stateful; implementations synchronize their own
/// internal model state and must be safe to call repeatedly from one
/// session's monitor loop (never concurrently for the same session).
#[async_trait]
pub trait Vad: Capability {
    async fn detect(&self, chunk: &[u8]) -> anyhow::Result<bool>;

    /// Required input chunk size in samples, if the implementation has a
    /// fixed window (e.g. Silero's 512 samples at 16kHz). `None` means any
    /// size is accepted.
    fn window_size(&self) -> Option<usize> {
        None
    }

    async fn reset_state(&self) {}
}

/// Speech recognition. One call per drained audio segment.
#[async_trait]
pub trait Asr: Capability {
    async fn recognize(&self, audio: AudioData) -> anyhow::Result<String>;
}

/// Chat completion, streamed, with per-session history maintained by the
/// implementation (§4.4, §5).
#[async_trait]
pub trait Llm: Capability {
    async fn chat_stream(
        &self,
        input: TextData,
        session_id: &str,
    ) -> anyhow::Result<BoxStream<'static, TextData>>;

    /// Drop any history kept for `session_id`. Sessions are not persisted
    /// across restarts (Non-goal), so this is only invoked on disconnect to
    /// bound memory use.
    async fn clear_history(&self, _session_id: &str) {}
}

/// Speech synthesis, streamed per call.
#[async_trait]
pub trait Tts: Capability {
    async fn synthesize_stream(
        &self,
        text: TextData,
    ) -> anyhow::Result<BoxStream<'static, AudioData>>;
}
