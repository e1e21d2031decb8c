//! Pure segment-detection rule table (§4.2). Deliberately decoupled from any
//! I/O so it can be tested as plain data in, data out.

use std::time::{Duration, Instant};

pub const SILENCE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const MAX_BUFFER_DURATION: Duration = Duration::from_millis(5000);
pub const MIN_SEGMENT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ClientSignal,
    SilenceTimeout,
    MaxBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub should_process: bool,
    pub is_final: bool,
    pub reason: Option<Reason>,
}

impl Decision {
    fn waiting() -> Self {
        Self { should_process: false, is_final: false, reason: None }
    }

    fn process(is_final: bool, reason: Reason) -> Self {
        Self { should_process: true, is_final, reason: Some(reason) }
    }
}

/// Evaluate the ordered rule table: client_signal > silence_timeout >
/// max_buffer > waiting. The first matching rule wins.
pub fn evaluate(
    buffer_duration: Duration,
    last_speech_time: Option<Instant>,
    client_ended: bool,
    now: Instant,
) -> Decision {
    if client_ended {
        return Decision::process(true, Reason::ClientSignal);
    }

    if let Some(last_speech) = last_speech_time {
        if now.saturating_duration_since(last_speech) >= SILENCE_TIMEOUT
            && buffer_duration >= MIN_SEGMENT
        {
            return Decision::process(true, Reason::SilenceTimeout);
        }
    }

    if buffer_duration >= MAX_BUFFER_DURATION {
        return Decision::process(false, Reason::MaxBuffer);
    }

    Decision::waiting()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_signal_wins_over_everything_else() {
        let now = Instant::now();
        let d = evaluate(Duration::from_secs(10), Some(now), true, now);
        assert_eq!(d, Decision::process(true, Reason::ClientSignal));
    }

    #[test]
    fn silence_timeout_requires_both_elapsed_time_and_minimum_segment() {
        let start = Instant::now();
        let now = start + SILENCE_TIMEOUT;

        // elapsed but under MIN_SEGMENT duration -> not yet
        let d = evaluate(Duration::from_millis(100), Some(start), false, now);
        assert!(!d.should_process);

        let d = evaluate(MIN_SEGMENT, Some(start), false, now);
        assert_eq!(d, Decision::process(true, Reason::SilenceTimeout));
    }

    #[test]
    fn max_buffer_triggers_non_final_processing() {
        let now = Instant::now();
        let d = evaluate(MAX_BUFFER_DURATION, None, false, now);
        assert_eq!(d, Decision::process(false, Reason::MaxBuffer));
    }

    #[test]
    fn nothing_matching_means_keep_waiting() {
        let now = Instant::now();
        let d = evaluate(Duration::from_millis(500), Some(now), false, now);
        assert_eq!(d, Decision::waiting());
    }

    #[test]
    fn no_speech_yet_skips_silence_timeout_rule() {
        let now = Instant::now();
        let d = evaluate(Duration::from_millis(200), None, false, now);
        assert_eq!(d, Decision::waiting());
    }
}
