//! Scheduled channel purge.
//!
//! Periodically walks channel history backward from the newest message and
//! deletes everything older than the retention threshold. The platform
//! imposes two deletion paths: bulk delete for messages under the 14-day
//! ceiling, single delete for anything older. Pinned messages are never
//! touched.
//!
//! A cycle is scan-then-drain; an in-progress guard prevents the next
//! timer tick from starting a second cycle while the previous one is
//! still draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PurgeConfig;
use crate::discord::client::{ChannelApi, DiscordError};

// ============================================================================
// Classification
// ============================================================================

/// Age bucket of a purge candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeBucket {
    /// Younger than the retention threshold: kept.
    Recent,
    /// Old enough to purge and young enough for the bulk API.
    BulkEligible,
    /// Beyond the bulk ceiling: the platform only allows single deletion.
    SingleOnly,
}

pub fn classify(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    retention_days: i64,
    bulk_ceiling_days: i64,
) -> AgeBucket {
    let age = now - timestamp;
    if age < ChronoDuration::days(retention_days) {
        AgeBucket::Recent
    } else if age < ChronoDuration::days(bulk_ceiling_days) {
        AgeBucket::BulkEligible
    } else {
        AgeBucket::SingleOnly
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// What one purge cycle accomplished.
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// A tick fired while the previous cycle was still running.
    pub skipped: bool,
    pub scanned: usize,
    pub bulk_deleted: usize,
    pub single_deleted: usize,
    pub dropped: usize,
}

pub struct PurgeScheduler {
    api: Arc<dyn ChannelApi>,
    channel_id: String,
    cfg: PurgeConfig,
    in_progress: AtomicBool,
}

impl PurgeScheduler {
    pub fn new(api: Arc<dyn ChannelApi>, channel_id: String, cfg: PurgeConfig) -> Self {
        Self {
            api,
            channel_id,
            cfg,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Spawn the periodic purge task. The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.cfg.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.run_cycle().await {
                            Ok(report) if report.skipped => {}
                            Ok(report) => {
                                info!(
                                    scanned = report.scanned,
                                    bulk_deleted = report.bulk_deleted,
                                    single_deleted = report.single_deleted,
                                    dropped = report.dropped,
                                    "Purge cycle complete"
                                );
                            }
                            Err(e) => {
                                // Transient fetch failure: retried next tick.
                                warn!(error = %e, "Purge scan aborted");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Purge scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Run one scan-and-drain cycle, unless one is already running.
    pub async fn run_cycle(&self) -> Result<PurgeReport, DiscordError> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            warn!("Previous purge cycle still draining, skipping this tick");
            return Ok(PurgeReport {
                skipped: true,
                ..PurgeReport::default()
            });
        }
        let result = self.scan_and_drain().await;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn scan_and_drain(&self) -> Result<PurgeReport, DiscordError> {
        let (scanned, bulk, single) = self.scan().await?;
        info!(
            scanned,
            bulk = bulk.len(),
            single = single.len(),
            "Purge scan complete"
        );
        let mut report = self.drain(bulk, single).await;
        report.scanned = scanned;
        Ok(report)
    }

    /// Page backward through channel history classifying candidates.
    ///
    /// The last message of a full page is not classified; it only advances
    /// the cursor. A short or empty page ends the scan.
    async fn scan(&self) -> Result<(usize, Vec<String>, Vec<String>), DiscordError> {
        let mut cursor: Option<String> = None;
        let mut scanned = 0;
        let mut bulk = Vec::new();
        let mut single = Vec::new();

        loop {
            let page = self
                .api
                .messages_before(&self.channel_id, cursor.as_deref(), self.cfg.page_size)
                .await?;
            scanned += page.len();
            let full = page.len() >= self.cfg.page_size;
            let classify_upto = if full { page.len() - 1 } else { page.len() };

            let now = Utc::now();
            for msg in &page[..classify_upto] {
                if msg.pinned {
                    continue;
                }
                match classify(
                    msg.timestamp,
                    now,
                    self.cfg.retention_days,
                    self.cfg.bulk_ceiling_days,
                ) {
                    AgeBucket::Recent => {}
                    AgeBucket::BulkEligible => bulk.push(msg.id.clone()),
                    AgeBucket::SingleOnly => single.push(msg.id.clone()),
                }
            }

            if !full {
                break;
            }
            cursor = page.last().map(|m| m.id.clone());
            // Pace the history API.
            time::sleep(self.cfg.page_delay()).await;
        }

        Ok((scanned, bulk, single))
    }

    /// Drain the bulk queue in staggered chunks, then the singles.
    async fn drain(&self, bulk: Vec<String>, mut single: Vec<String>) -> PurgeReport {
        let mut report = PurgeReport::default();

        for chunk in bulk.chunks(self.cfg.page_size) {
            if chunk.len() == 1 {
                // The bulk API rejects batches of one.
                single.push(chunk[0].clone());
                continue;
            }
            time::sleep(self.cfg.chunk_stagger()).await;
            match self.api.delete_bulk(&self.channel_id, chunk).await {
                Ok(()) => {
                    report.bulk_deleted += chunk.len();
                    debug!(count = chunk.len(), "Bulk chunk deleted");
                }
                Err(e) => {
                    warn!(count = chunk.len(), error = %e, "Bulk delete failed, chunk dropped");
                    report.dropped += chunk.len();
                }
            }
        }

        while let Some(id) = single.pop() {
            let mut attempts = 0;
            loop {
                match self.api.delete_one(&self.channel_id, &id).await {
                    Ok(()) => {
                        report.single_deleted += 1;
                        break;
                    }
                    Err(DiscordError::RateLimit { retry_after }) => {
                        attempts += 1;
                        if attempts > self.cfg.max_rate_limit_retries {
                            warn!(id = %id, "Rate-limit retries exhausted, dropping");
                            report.dropped += 1;
                            break;
                        }
                        let cooldown = Duration::from_secs(retry_after.unwrap_or(1))
                            + Duration::from_millis(100);
                        debug!(id = %id, ?cooldown, "Single delete rate limited, retrying");
                        time::sleep(cooldown).await;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "Unable to delete message, dropping");
                        report.dropped += 1;
                        break;
                    }
                }
            }
            time::sleep(self.cfg.single_delay()).await;
        }

        report
    }
}

// ============================================================================
// Tests
// ============================================================================
