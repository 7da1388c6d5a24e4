//! Live preview over WebSocket
//!
//! A client asks for a preview of one account's folder; the server runs a
//! first-match pass and streams a progress event per stage and per message,
//! followed by the full result. Nothing in the mailbox is modified.

pub mod protocol;
pub mod server;
pub mod streamer;

pub use protocol::{ClientMessage, PreviewRequest, PreviewStage, ProgressPayload, ProtocolError, ServerMessage};
pub use server::{OriginPolicy, PreviewConfig, PreviewServer, RunningServer, MAX_QUEUED_REQUESTS};
pub use streamer::PreviewStreamer;
