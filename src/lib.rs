//! Offline-first caching and sync layer for the SUTUTEH portal.
//!
//! Outgoing requests go through [`router::Router`], which picks a caching
//! strategy per route and falls back to cached pages when the network is
//! gone. Public data is mirrored into the [`store::Store`] by the
//! [`warmer::CacheWarmer`], and mutations made offline wait in a queue that
//! the [`sync::SyncEngine`] replays on reconnect. [`service::OfflineService`]
//! ties the pieces together behind a message-based control API.

pub mod cache;
pub mod db;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod net;
pub mod precache;
pub mod router;
pub mod service;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod warmer;

#[cfg(test)]
mod testing;

pub use error::{OfflineError, Result};
