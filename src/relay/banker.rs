//! Banker request throttle.
//!
//! Banker requests ping a role in a dedicated channel, so one sender must
//! not be able to flood it. Each admitted sender gets an entry with an
//! expiry timer; until the timer fires, further requests from that sender
//! are held and told how long is left. Timers are children of the
//! shutdown token so pending entries never keep the process alive.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of a banker admission check.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Already admitted recently; `remaining` is the time until re-admission.
    Held { remaining: Duration },
}

pub struct BankerQueue {
    entries: Arc<DashMap<String, Instant>>,
    window: Duration,
    shutdown: CancellationToken,
}

impl BankerQueue {
    /// `shutdown` should be a child of the process shutdown token.
    pub fn new(window: Duration, shutdown: CancellationToken) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
            shutdown,
        }
    }

    /// Admit a sender, or report the cooldown remaining on their entry.
    pub fn try_admit(&self, sender_id: &str) -> Admission {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(sender_id) {
            let expiry = *entry;
            if expiry > now {
                return Admission::Held {
                    remaining: expiry - now,
                };
            }
            // Expired but the reaper has not run yet; fall through and renew.
        }

        let expiry = now + self.window;
        self.entries.insert(sender_id.to_string(), expiry);
        self.spawn_reaper(sender_id.to_string(), expiry);
        Admission::Admitted
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    fn spawn_reaper(&self, sender_id: String, expiry: Instant) {
        let entries = self.entries.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(expiry) => {
                    // Remove only if nothing renewed the entry meanwhile.
                    entries.remove_if(&sender_id, |_, e| *e <= Instant::now());
                    debug!(sender = %sender_id, "Banker cooldown expired");
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }
}

/// Whether a banker request actually names an amount. Requests without one
/// are bounced back to the sender instead of pinging the channel.
pub fn mentions_amount(text: &str) -> bool {
    for part in text.split_whitespace() {
        let lower = part.to_lowercase();
        if lower.contains("balance") || lower.contains("everything") {
            return true;
        }
        if part.chars().any(|c| c.is_ascii_digit()) {
            return true;
        }
    }
    false
}

/// Human-readable remaining time, e.g. `9m 30s`.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.as_secs();
    let minutes = total / 60;
    let seconds = total % 60;
    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_amount() {
        assert!(mentions_amount("can I have $100m please"));
        assert!(mentions_amount("give me everything"));
        assert!(mentions_amount("my full balance please"));
        assert!(!mentions_amount("can I have some money"));
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(570)), "9m 30s");
        assert_eq!(format_remaining(Duration::from_secs(42)), "42s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_is_held_with_remaining_time() {
        let queue = BankerQueue::new(Duration::from_secs(600), CancellationToken::new());
        assert_eq!(queue.try_admit("100"), Admission::Admitted);

        tokio::time::sleep(Duration::from_secs(30)).await;
        match queue.try_admit("100") {
            Admission::Held { remaining } => {
                assert!(remaining > Duration::ZERO);
                assert!(remaining <= Duration::from_secs(570));
            }
            Admission::Admitted => panic!("expected the sender to be held"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmitted_after_window() {
        let queue = BankerQueue::new(Duration::from_secs(600), CancellationToken::new());
        assert_eq!(queue.try_admit("100"), Admission::Admitted);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(queue.try_admit("100"), Admission::Admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_senders_are_independent() {
        let queue = BankerQueue::new(Duration::from_secs(600), CancellationToken::new());
        assert_eq!(queue.try_admit("100"), Admission::Admitted);
        assert_eq!(queue.try_admit("200"), Admission::Admitted);
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_clears_expired_entries() {
        let queue = BankerQueue::new(Duration::from_secs(60), CancellationToken::new());
        queue.try_admit("100");
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_timers() {
        let token = CancellationToken::new();
        let queue = BankerQueue::new(Duration::from_secs(600), token.clone());
        queue.try_admit("100");
        token.cancel();
        // The reaper exits without waiting out the window; entries are
        // simply dropped with the process.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.pending(), 1);
    }
}
