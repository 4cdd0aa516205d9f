//! The relay engine.
//!
//! Inbound messages flow: socket -> [`dedup`] check -> [`queue`] -> (after
//! the queue delay) -> [`dispatch`] -> command router or webhook send.
//! Locally-originated messages skip the queue and go straight to the
//! dispatch stage. [`banker`] throttles the rate-limited forwarding
//! category, [`stats`] carries the observability counters.

pub mod banker;
pub mod dedup;
pub mod dispatch;
pub mod queue;
pub mod stats;

pub use banker::{Admission, BankerQueue};
pub use dedup::DedupCache;
pub use dispatch::Dispatcher;
pub use queue::DeliveryQueue;
pub use stats::RelayStats;
