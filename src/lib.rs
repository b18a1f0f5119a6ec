//! # sharenet
//!
//! Peer overlay and version-hash-chained database synchronization for file
//! sharing nodes.
//!
//! Nodes discover each other over a small length-prefixed TCP protocol, keep
//! a directory of which node serves which content, and replicate a small
//! relational store by exchanging hash-linked version records, optionally
//! through a central sync authority.
//!
//! ## Core Modules
//!
//! - [`protocol`] - Message model and frame codec
//! - [`registry`] - Location directory (node ↔ content)
//! - [`p2p`] - Connection endpoint, handshake and dispatch
//! - [`requests`] - Request/response correlation over the overlay
//! - [`storage`] - Version store: tables, change history, outbox
//! - [`sync`] - Sync engine and version sources
//! - [`authority`] - HTTP client for the sync authority
//! - [`config`] - Configuration management
//!
//! ## Quick Start
//!
//! ```bash
//! sharenet init --port 8000 --bootstrap 127.0.0.1:8001
//! sharenet run
//! ```

pub mod authority;
pub mod cli;
pub mod config;
pub mod error;
pub mod p2p;
pub mod protocol;
pub mod registry;
pub mod requests;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use p2p::{Peer, PeerHandle};
pub use storage::VersionStore;
pub use sync::SyncEngine;
