//! Message synchronization pipeline for a chat client: a SQLite-backed local
//! store as the source of truth, a reconnecting WebSocket for inbound
//! messages, an HTTP submission client for outbound ones, and a sync engine
//! mediating between them.

pub mod common;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod sync;
