//! Discord integration: webhook forwarding, the channel REST client, and
//! the scheduled history purge.

pub mod client;
pub mod purge;
pub mod webhook;

pub use client::{ChannelApi, ChannelMessage, DiscordError, RestClient};
pub use purge::{AgeBucket, PurgeReport, PurgeScheduler};
pub use webhook::Webhook;
