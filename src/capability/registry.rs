//! Process-wide capability registry. Populated once at startup from
//! configuration; the orchestrator resolves each role by name at turn time
//! rather than holding its own reference, which is what makes hot-swapping
//! (replacing the active LLM while sessions are live) possible.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Asr, Llm, Tts, Vad};

#[derive(Default)]
pub struct CapabilityRegistry {
    vad: RwLock<Option<Arc<dyn Vad>>>,
    asr: RwLock<Option<Arc<dyn Asr>>>,
    llm: RwLock<Option<Arc<dyn Llm>>>,
    tts: RwLock<Option<Arc<dyn Tts>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_vad(&self, vad: Arc<dyn Vad>) {
        *self.vad.write().await = Some(vad);
    }
    pub async fn set_asr(&self, asr: Arc<dyn Asr>) {
        *self.asr.write().await = Some(asr);
    }
    pub async fn set_llm(&self, llm: Arc<dyn Llm>) {
        *self.llm.write().await = Some(llm);
    }
    pub async fn set_tts(&self, tts: Arc<dyn Tts>) {
        *self.tts.write().await = Some(tts);
    }

    pub async fn vad(&self) -> Option<Arc<dyn Vad>> {
        self.vad.read().await.clone()
    }
    pub async fn asr(&self) -> Option<Arc<dyn Asr>> {
        self.asr.read().await.clone()
    }
    pub async fn llm(&self) -> Option<Arc<dyn Llm>> {
        self.llm.read().await.clone()
    }
    pub async fn tts(&self) -> Option<Arc<dyn Tts>> {
        self.tts.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::protocol::event::{AudioData, AudioFormat, TextData};
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};

    struct StubVad;
    #[async_trait]
    impl Capability for StubVad {}
    #[async_trait]
    impl Vad for StubVad {
        async fn detect(&self, _chunk: &[u8]) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct StubTts;
    #[async_trait]
    impl Capability for StubTts {}
    #[async_trait]
    impl Tts for StubTts {
        async fn synthesize_stream(&self, _text: TextData) -> anyhow::Result<BoxStream<'static, AudioData>> {
            Ok(Box::pin(stream::iter(vec![AudioData::final_marker(AudioFormat::Pcm)])))
        }
    }

    #[tokio::test]
    async fn roles_resolve_independently_and_are_absent_until_set() {
        let registry = CapabilityRegistry::new();
        assert!(registry.vad().await.is_none());
        assert!(registry.tts().await.is_none());

        registry.set_vad(Arc::new(StubVad)).await;
        assert!(registry.vad().await.is_some());
        assert!(registry.tts().await.is_none());

        registry.set_tts(Arc::new(StubTts)).await;
        assert!(registry.tts().await.is_some());
    }

    #[tokio::test]
    async fn hot_swap_replaces_the_active_instance() {
        let registry = CapabilityRegistry::new();
        registry.set_vad(Arc::new(StubVad)).await;
        let first = registry.vad().await.unwrap();
        registry.set_vad(Arc::new(StubVad)).await;
        let second = registry.vad().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
