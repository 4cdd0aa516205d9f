//! Dispatch stage: the far side of the delivery queue.
//!
//! Every message bound for Discord passes through here exactly once,
//! whether it was drained from the queue or originated locally. The
//! command router gets first refusal; what it does not handle is
//! formatted and forwarded. A failed forward is logged and dropped, never
//! retried — duplicate forwards are worse than an occasional loss.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::chat::message::InboundMessage;
use crate::discord::client::DiscordError;
use crate::relay::stats::RelayStats;

/// The external send collaborator: ack or error per message.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn forward(&self, text: &str) -> Result<(), DiscordError>;
    /// Best-effort copy to the archive channel. Failures are the sink's
    /// problem to log.
    async fn archive(&self, text: &str);
}

/// The command interface: returns whether the message was handled and
/// should not be forwarded.
#[async_trait]
pub trait CommandDispatch: Send + Sync {
    async fn dispatch(&self, msg: &InboundMessage) -> bool;
}

pub struct Dispatcher {
    /// `None` when chat interaction is disabled by configuration.
    router: Option<Arc<dyn CommandDispatch>>,
    sink: Arc<dyn Outbound>,
    archive: bool,
    chat_prefix: String,
    stats: Arc<RelayStats>,
}

impl Dispatcher {
    pub fn new(
        router: Option<Arc<dyn CommandDispatch>>,
        sink: Arc<dyn Outbound>,
        archive: bool,
        chat_prefix: String,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            router,
            sink,
            archive,
            chat_prefix,
            stats,
        }
    }

    pub async fn dispatch(&self, msg: InboundMessage) {
        // Loop guard: never mirror our own chat messages back.
        if msg.text.contains(&self.chat_prefix) {
            debug!(id = %msg.id, "Skipping our own chat message");
            return;
        }

        if let Some(router) = &self.router {
            if router.dispatch(&msg).await {
                info!(id = %msg.id, sender = %msg.sender_name, "Handled as internal command");
                return;
            }
        }

        let formatted = format_message(&msg);
        match self.sink.forward(&formatted).await {
            Ok(()) => {
                self.stats.incr_forwarded();
                info!(id = %msg.id, seq = msg.sequence_number, "Mirrored");
            }
            Err(e) => {
                // At-most-once: log, do not retry.
                warn!(id = %msg.id, error = %e, "Forward failed, message dropped");
            }
        }

        if self.archive {
            self.sink.archive(&formatted).await;
        }
    }
}

/// Discord-side rendering of a chat message.
pub fn format_message(msg: &InboundMessage) -> String {
    if msg.sender_id.is_empty() {
        format!("**{}**: {}", msg.sender_name, msg.text)
    } else {
        format!("**{}** [{}]: {}", msg.sender_name, msg.sender_id, msg.text)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records forwards instead of POSTing them.
    pub struct RecordingSink {
        sent: Mutex<Vec<String>>,
        archived: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                archived: Mutex::new(Vec::new()),
            })
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub fn archived(&self) -> Vec<String> {
            self.archived.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Outbound for RecordingSink {
        async fn forward(&self, text: &str) -> Result<(), DiscordError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn archive(&self, text: &str) {
            self.archived.lock().unwrap().push(text.to_string());
        }
    }

    /// A dispatcher with no router and no archive, wired to a recording sink.
    pub fn dispatcher_with_sink() -> (Dispatcher, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::new(
            None,
            sink.clone(),
            false,
            "...FacRelay says: \"".to_string(),
            Arc::new(RelayStats::new()),
        );
        (dispatcher, sink)
    }

    struct AlwaysHandles;

    #[async_trait]
    impl CommandDispatch for AlwaysHandles {
        async fn dispatch(&self, _msg: &InboundMessage) -> bool {
            true
        }
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage {
            id: "m1".to_string(),
            sequence_number: 7,
            room_id: "Faction:8151".to_string(),
            sender_id: "1285627".to_string(),
            sender_name: "Artemis".to_string(),
            text: text.to_string(),
            received_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_format_with_and_without_sender_id() {
        let mut m = msg("hello");
        assert_eq!(format_message(&m), "**Artemis** [1285627]: hello");
        m.sender_id.clear();
        assert_eq!(format_message(&m), "**Artemis**: hello");
    }

    #[tokio::test]
    async fn test_forwarded_message_reaches_sink() {
        let (dispatcher, sink) = dispatcher_with_sink();
        dispatcher.dispatch(msg("hello")).await;
        assert_eq!(sink.sent(), vec!["**Artemis** [1285627]: hello"]);
    }

    #[tokio::test]
    async fn test_own_messages_are_not_mirrored() {
        let (dispatcher, sink) = dispatcher_with_sink();
        dispatcher
            .dispatch(msg("...FacRelay says: \"see Discord\""))
            .await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_handled_command_is_not_forwarded() {
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::new(
            Some(Arc::new(AlwaysHandles)),
            sink.clone(),
            false,
            "...FacRelay says: \"".to_string(),
            Arc::new(RelayStats::new()),
        );
        dispatcher.dispatch(msg("@terminate")).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_archive_copy() {
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::new(
            None,
            sink.clone(),
            true,
            "...FacRelay says: \"".to_string(),
            Arc::new(RelayStats::new()),
        );
        dispatcher.dispatch(msg("hello")).await;
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.archived().len(), 1);
    }
}
