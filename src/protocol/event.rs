//! Wire schema: the single `StreamEvent` envelope and its payload variants.
//!
//! Every message in either direction is one `StreamEvent`. Client binary
//! frames are not `StreamEvent`s at all — they are raw audio bytes handled
//! separately by the connection loop (see `protocol::server`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // client -> server
    SystemClientSessionStart,
    ClientTextInput,
    ClientSpeechEnd,
    StreamEnd,
    ConfigGet,
    ConfigSet,
    ModuleStatusGet,

    // server -> client
    SystemServerSessionStart,
    ServerTextResponse,
    ServerAudioResponse,
    Error,
    ConfigSnapshot,
    ModuleStatusReport,
}

/// `event_data` is untyped at the envelope level (it varies per `event_type`);
/// callers deserialize into the variant they expect once `event_type` is known.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamEvent {
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub event_data: serde_json::Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tag_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl StreamEvent {
    pub fn new(event_type: EventType, event_data: impl Serialize) -> Self {
        Self {
            event_type: Some(event_type),
            event_data: serde_json::to_value(event_data).unwrap_or(serde_json::Value::Null),
            session_id: None,
            tag_id: None,
            timestamp: Some(now_seconds()),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tag(mut self, tag_id: impl Into<String>) -> Self {
        self.tag_id = Some(tag_id.into());
        self
    }
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Text payload: the shape of `event_data` for `CLIENT_TEXT_INPUT`,
/// `ASR_RESULT` (internal, never serialized to the wire directly), and
/// `SERVER_TEXT_RESPONSE`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TextData {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
}

impl TextData {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self { text: text.into(), is_final }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm,
    Mp3,
    Wav,
}

/// Audio payload. On the wire, `data` is base64 text inside the JSON
/// envelope (§6); internally it is carried as raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioData {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub format: AudioFormat,
    #[serde(default)]
    pub is_final: bool,
}

impl AudioData {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format, is_final: false }
    }

    pub fn final_marker(format: AudioFormat) -> Self {
        Self { data: Vec::new(), format, is_final: true }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        s.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_data_roundtrips_through_event_data() {
        let event = StreamEvent::new(EventType::ServerTextResponse, TextData::new("hi", true));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: StreamEvent = serde_json::from_str(&json).unwrap();
        let text: TextData = serde_json::from_value(parsed.event_data).unwrap();
        assert_eq!(text.text, "hi");
        assert!(text.is_final);
    }

    #[test]
    fn audio_data_base64_roundtrips() {
        let audio = AudioData::new(vec![1, 2, 3, 4], AudioFormat::Pcm);
        let json = serde_json::to_string(&audio).unwrap();
        let parsed: AudioData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn event_type_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&EventType::ClientTextInput).unwrap();
        assert_eq!(json, "\"CLIENT_TEXT_INPUT\"");
    }
}
