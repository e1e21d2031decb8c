//! Bounded speech-only audio buffer (§3, §4.2).

use std::time::Instant;

use tracing::warn;

/// 16kHz mono 16-bit PCM: 2 bytes/sample * 16000 samples/sec.
pub const BYTES_PER_SECOND: usize = 32_000;
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

pub struct AudioBuffer {
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
    last_speech_time: Option<Instant>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self { chunks: Vec::new(), total_bytes: 0, last_speech_time: None }
    }

    /// Append a speech chunk, clearing the buffer first if it would
    /// otherwise exceed `MAX_BUFFER_BYTES` (I4). Updates `last_speech_time`.
    pub fn append(&mut self, chunk: Vec<u8>, now: Instant) {
        if self.total_bytes + chunk.len() > MAX_BUFFER_BYTES {
            warn!(
                size = self.total_bytes,
                "audio buffer overflow risk, clearing buffer"
            );
            self.chunks.clear();
            self.total_bytes = 0;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
        self.last_speech_time = Some(now);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_SECOND as f64
    }

    pub fn last_speech_time(&self) -> Option<Instant> {
        self.last_speech_time
    }

    /// Drain all buffered bytes in arrival order and reset `last_speech_time`.
    pub fn drain(&mut self) -> Vec<u8> {
        self.last_speech_time = None;
        self.total_bytes = 0;
        self.chunks.drain(..).flatten().collect()
    }
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn duration_is_bytes_over_bytes_per_second() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![0u8; BYTES_PER_SECOND], Instant::now());
        assert!((buf.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overflow_clears_before_inserting_the_new_chunk() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![0u8; MAX_BUFFER_BYTES - 10], Instant::now());
        buf.append(vec![0u8; 20], Instant::now());
        // the oversized append cleared the buffer first, so only the new
        // 20-byte chunk remains, not MAX_BUFFER_BYTES + 10.
        assert_eq!(buf.duration_seconds(), 20.0 / BYTES_PER_SECOND as f64);
    }

    #[test]
    fn drain_resets_state() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![1, 2, 3], Instant::now());
        let drained = buf.drain();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(buf.is_empty());
        assert!(buf.last_speech_time().is_none());
    }

    #[test]
    fn drain_preserves_chunk_arrival_order() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![1, 2], Instant::now());
        buf.append(vec![3, 4], Instant::now() + Duration::from_millis(1));
        assert_eq!(buf.drain(), vec![1, 2, 3, 4]);
    }
}
