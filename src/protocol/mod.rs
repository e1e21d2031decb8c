//! External interface (§6): the StreamEvent wire schema and the WebSocket
//! protocol server that frames it.

pub mod event;
pub mod server;

pub use event::{AudioData, AudioFormat, ErrorData, EventType, StreamEvent, TextData};
pub use server::{router, ServerState};
