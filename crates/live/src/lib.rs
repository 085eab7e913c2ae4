//! quire-live: realtime collaborative document sync server.
//!
//! Clients speak the y-sync/y-awareness protocol over WebSocket. Each
//! document open on a process is owned by one session task that merges
//! updates, relays them to local participants, fans them out to sibling
//! processes over the backplane and persists debounced snapshots.

pub mod auth;
pub mod backplane;
pub mod broadcast;
pub mod config;
pub mod crdt;
pub mod db;
pub mod embeds;
pub mod error;
pub mod guard;
pub mod persistence;
pub mod server;
pub mod session;
pub mod sync;
