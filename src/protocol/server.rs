//! Protocol Server (§4.1): WebSocket upgrade, handshake, routing, and the
//! per-connection sender task that owns the socket's write half.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::registry::CapabilityRegistry;
use crate::config::Config;
use crate::conversation::Orchestrator;
use crate::error::ConversationError;
use crate::protocol::event::{ErrorData, EventType, StreamEvent};
use crate::session::{OutboundFrame, SessionRegistry};

#[derive(Clone)]
pub struct ServerState {
    pub sessions: Arc<SessionRegistry>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub config: Arc<RwLock<Config>>,
}

impl ServerState {
    pub fn new(capabilities: Arc<CapabilityRegistry>, config: Config) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            capabilities,
            config: Arc::new(RwLock::new(config)),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: ServerState) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::channel::<OutboundFrame>(128);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            match frame {
                OutboundFrame::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize outbound event"),
                },
                OutboundFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Handshake: the first frame must be SYSTEM_CLIENT_SESSION_START.
    let first_message = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => break Some(text),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => break None,
        }
    };

    let Some(first_message) = first_message else {
        sender_task.abort();
        return;
    };

    let event: StreamEvent = match serde_json::from_str(&first_message) {
        Ok(e) => e,
        Err(e) => {
            let err = ConversationError::protocol(format!("malformed handshake frame: {e}"));
            warn!(error = %err, "rejecting connection");
            sender_task.abort();
            return;
        }
    };

    if event.event_type != Some(EventType::SystemClientSessionStart) {
        let err = ConversationError::protocol("expected SYSTEM_CLIENT_SESSION_START as first frame");
        warn!(error = %err, "rejecting connection");
        let _ = outbox
            .send(OutboundFrame::Event(StreamEvent::new(EventType::Error, ErrorData { text: err.to_string() })))
            .await;
        sender_task.abort();
        return;
    }

    let Some(tag_id) = event.tag_id else {
        let err = ConversationError::protocol("handshake missing tag_id");
        warn!(error = %err, "rejecting connection");
        sender_task.abort();
        return;
    };

    let (session, superseded) = state.sessions.handshake(tag_id.clone(), connection_id, outbox.clone()).await;

    if let Some(old_session) = superseded {
        info!(session_id = %old_session.session_id, "tearing down superseded session");
        let _ = old_session.outbox.send(OutboundFrame::Close).await;
    }

    let orchestrator = Orchestrator::new(session.session_id.clone(), Arc::clone(&state.capabilities), outbox.clone());
    let vad = state.capabilities.vad().await;
    let asr = match state.capabilities.asr().await {
        Some(asr) => asr,
        None => {
            error!(session_id = %session.session_id, "no ASR module registered at startup");
            sender_task.abort();
            state.sessions.remove_by_connection(connection_id).await;
            return;
        }
    };
    orchestrator.start(vad, asr).await;

    let ack = StreamEvent::new(EventType::SystemServerSessionStart, serde_json::json!({}))
        .with_session(session.session_id.clone())
        .with_tag(tag_id);
    let _ = outbox.send(OutboundFrame::Event(ack)).await;

    info!(session_id = %session.session_id, "session established");

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text_frame(&text, &session.session_id, &orchestrator, &state, &outbox).await;
            }
            Ok(Message::Binary(bytes)) => {
                orchestrator.handle_audio(bytes.into()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session.session_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    orchestrator.stop().await;
    state.sessions.remove_by_connection(connection_id).await;
    sender_task.abort();
    info!(session_id = %session.session_id, "session closed");
}

async fn handle_text_frame(
    text: &str,
    session_id: &str,
    orchestrator: &Arc<Orchestrator>,
    state: &ServerState,
    outbox: &crate::session::Outbox,
) {
    let event: StreamEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            let err = ConversationError::protocol(format!("malformed JSON frame: {e}"));
            warn!(session_id = %session_id, error = %err, "ignoring frame");
            let _ = outbox.send(OutboundFrame::Event(StreamEvent::new(EventType::Error, ErrorData { text: err.to_string() }))).await;
            return;
        }
    };

    match event.event_type {
        Some(EventType::ClientTextInput) => {
            if let Ok(payload) = serde_json::from_value::<crate::protocol::event::TextData>(event.event_data) {
                orchestrator.handle_text_input(payload.text).await;
            }
        }
        Some(EventType::ClientSpeechEnd) | Some(EventType::StreamEnd) => {
            orchestrator.handle_speech_end().await;
        }
        Some(EventType::ConfigGet) => {
            let config = state.config.read().await;
            let snapshot = config.masked_snapshot();
            let reply = StreamEvent::new(EventType::ConfigSnapshot, snapshot).with_session(session_id.to_string());
            let _ = outbox.send(OutboundFrame::Event(reply)).await;
        }
        Some(EventType::ConfigSet) => {
            let mut config = state.config.write().await;
            if let Err(e) = config.apply_masked_patch(event.event_data) {
                let _ = outbox
                    .send(OutboundFrame::Event(StreamEvent::new(
                        EventType::Error,
                        ErrorData { text: format!("invalid config: {e}") },
                    )))
                    .await;
            } else {
                let snapshot = config.masked_snapshot();
                let reply = StreamEvent::new(EventType::ConfigSnapshot, snapshot).with_session(session_id.to_string());
                let _ = outbox.send(OutboundFrame::Event(reply)).await;
            }
        }
        Some(EventType::ModuleStatusGet) => {
            let status = serde_json::json!({
                "vad": state.capabilities.vad().await.is_some(),
                "asr": state.capabilities.asr().await.is_some(),
                "llm": state.capabilities.llm().await.is_some(),
                "tts": state.capabilities.tts().await.is_some(),
            });
            let reply = StreamEvent::new(EventType::ModuleStatusReport, status).with_session(session_id.to_string());
            let _ = outbox.send(OutboundFrame::Event(reply)).await;
        }
        other => {
            debug!(session_id = %session_id, event_type = ?other, "frame not handled by protocol server");
        }
    }
}
