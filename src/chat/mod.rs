//! Chat feed integration.
//!
//! The feed delivers chat events over a persistent WebSocket. [`socket`]
//! owns the connection lifecycle (connect, heartbeat, bounded reconnect),
//! [`message`] owns the wire format, and [`ChatHandle`] is the write side
//! handed to components that need to speak into the room.

pub mod message;
pub mod socket;

pub use message::{InboundMessage, parse_envelope, send_frame};
pub use socket::{ChatSocket, ConnectionState, RetryAction, RetryPolicy};

use tokio::sync::mpsc;
use tracing::warn;

/// Cloneable write handle for the chat socket.
///
/// Frames are queued on a channel and written by the connection task.
/// Sends are dropped with a warning while the socket is down.
#[derive(Clone)]
pub struct ChatHandle {
    tx: mpsc::Sender<String>,
    room_id: String,
    prefix: String,
}

impl ChatHandle {
    pub fn new(tx: mpsc::Sender<String>, room_id: String, prefix: String) -> Self {
        Self {
            tx,
            room_id,
            prefix,
        }
    }

    /// Send a message into the chat room.
    pub async fn send_chat(&self, text: &str) {
        let frame = send_frame(&self.room_id, text);
        if self.tx.send(frame).await.is_err() {
            warn!("Chat socket is down, dropping outbound chat message");
        }
    }

    /// Send a message into the chat room that must not be mirrored back
    /// to Discord. The app prefix is the loop guard the dispatcher keys on.
    pub async fn send_chat_only(&self, text: &str) {
        let wrapped = format!("{}{}\"", self.prefix, text);
        self.send_chat(&wrapped).await;
    }
}
