//! Delayed delivery queue.
//!
//! Stage one of the pipeline: inbound messages pass the duplicate check
//! and sit in a FIFO buffer. A drain task pops exactly one message per
//! tick and hands it to the dispatch stage, so a burst arrives in Discord
//! as a steady trickle — the tick interval is the single knob controlling
//! outbound rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chat::message::InboundMessage;
use crate::relay::dedup::DedupCache;
use crate::relay::dispatch::Dispatcher;
use crate::relay::stats::RelayStats;

pub struct DeliveryQueue {
    buffer: Mutex<VecDeque<InboundMessage>>,
    dedup: Arc<Mutex<DedupCache>>,
    stats: Arc<RelayStats>,
    log_duplicates: bool,
}

impl DeliveryQueue {
    pub fn new(
        dedup: Arc<Mutex<DedupCache>>,
        stats: Arc<RelayStats>,
        log_duplicates: bool,
    ) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            dedup,
            stats,
            log_duplicates,
        }
    }

    /// Stage one: duplicate check, then buffer in arrival order.
    ///
    /// Returns whether the message was queued. Duplicates are counted and
    /// dropped; at-most-once forwarding starts here.
    pub async fn ingest(&self, msg: InboundMessage) -> bool {
        {
            let mut dedup = self.dedup.lock().await;
            if dedup.seen(&msg.id) {
                self.stats.incr_duplicates();
                if self.log_duplicates {
                    info!(id = %msg.id, seq = msg.sequence_number, "Duplicate suppressed");
                }
                return false;
            }
            dedup.record(msg.id.clone());
        }

        let mut buffer = self.buffer.lock().await;
        buffer.push_back(msg);
        self.stats.note_queue_depth(buffer.len());
        true
    }

    /// Pop the oldest buffered message.
    pub async fn pop(&self) -> Option<InboundMessage> {
        self.buffer.lock().await.pop_front()
    }

    pub async fn depth(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

/// Spawn the drain task: one message per tick into the dispatch stage.
pub fn spawn_drain(
    queue: Arc<DeliveryQueue>,
    dispatcher: Arc<Dispatcher>,
    delay: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(delay);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(msg) = queue.pop().await {
                        debug!(id = %msg.id, seq = msg.sequence_number, "Dequeued for dispatch");
                        dispatcher.dispatch(msg).await;
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Delivery queue drain stopped");
                    break;
                }
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::dispatch::tests::{RecordingSink, dispatcher_with_sink};

    fn msg(id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            sequence_number: 0,
            room_id: "Faction:8151".to_string(),
            sender_id: "1".to_string(),
            sender_name: "tester".to_string(),
            text: text.to_string(),
            received_at: chrono::Utc::now(),
        }
    }

    fn queue_with_stats() -> (Arc<DeliveryQueue>, Arc<RelayStats>) {
        let stats = Arc::new(RelayStats::new());
        let dedup = Arc::new(Mutex::new(DedupCache::new(100)));
        (
            Arc::new(DeliveryQueue::new(dedup, stats.clone(), false)),
            stats,
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, _) = queue_with_stats();
        queue.ingest(msg("1", "first")).await;
        queue.ingest(msg("2", "second")).await;
        queue.ingest(msg("3", "third")).await;

        assert_eq!(queue.pop().await.unwrap().text, "first");
        assert_eq!(queue.pop().await.unwrap().text, "second");
        assert_eq!(queue.pop().await.unwrap().text, "third");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicates_are_suppressed() {
        let (queue, stats) = queue_with_stats();
        assert!(queue.ingest(msg("A", "hello")).await);
        assert!(!queue.ingest(msg("A", "hello again")).await);
        assert_eq!(queue.depth().await, 1);
        assert_eq!(stats.duplicates(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_scenario_sends_each_id_once_in_order() {
        // Feed A, B, A, C: exactly three forwards occur, for A, B, C, in order.
        let (queue, _) = queue_with_stats();
        let (dispatcher, sink) = dispatcher_with_sink();

        for (id, text) in [("A", "msg-a"), ("B", "msg-b"), ("A", "msg-a-dup"), ("C", "msg-c")] {
            queue.ingest(msg(id, text)).await;
        }
        while let Some(m) = queue.pop().await {
            dispatcher.dispatch(m).await;
        }

        let sent = sink.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("msg-a"));
        assert!(sent[1].contains("msg-b"));
        assert!(sent[2].contains("msg-c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_task_trickles_one_per_tick() {
        let (queue, _) = queue_with_stats();
        let (dispatcher, sink) = dispatcher_with_sink();
        for i in 0..3 {
            queue.ingest(msg(&format!("id-{i}"), &format!("text-{i}"))).await;
        }

        let shutdown = CancellationToken::new();
        let handle = spawn_drain(
            queue.clone(),
            Arc::new(dispatcher),
            Duration::from_millis(100),
            shutdown.clone(),
        );

        // First tick fires immediately, then one message per interval.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.sent().len(), 3);
        assert_eq!(queue.depth().await, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
