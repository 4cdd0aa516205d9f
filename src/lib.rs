//! Facrelay - relays a faction chat WebSocket feed into Discord.
//!
//! The relay engine receives chat messages over a persistent WebSocket,
//! suppresses duplicates, holds messages in a short delivery queue, and
//! forwards them to Discord webhooks. A maintenance scheduler purges old
//! messages from the destination channel through the bulk and single
//! deletion APIs.

pub mod chat;
pub mod commands;
pub mod config;
pub mod discord;
pub mod relay;
pub mod server;
pub mod shutdown;
