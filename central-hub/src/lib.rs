//! # central-hub: shared state hub for cooperating processes
//!
//! Subsystems (sensors, planners, dashboards) connect over WebSocket and
//! share one authoritative key/value state. Every accepted write gets a
//! per-key version and is pushed to every subscriber of that key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ HubClient   │ ◄────────────────► │ Hub          │
//! │ (per proc)  │     JSON frames    │ (central)    │
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ mirror      │                    │ StateStore   │
//! │ (local)     │                    │ (authority)  │
//! └─────────────┘                    └──────┬───────┘
//!                                           │
//!                                   ┌───────┴────────┐
//!                                   │BroadcastEngine │
//!                                   │ (fan-out)      │
//!                                   └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: versioned key/value state with conditional writes
//! - [`protocol`]: JSON wire messages and their codec
//! - [`registry`]: key → subscriber index
//! - [`broadcast`]: fan-out onto bounded per-client queues
//! - [`server`]: WebSocket hub, connection lifecycle, start/stop
//! - [`client`]: WebSocket client with a local state mirror
//! - [`config`]: defaults and validation

pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;

pub use broadcast::{BroadcastEngine, BroadcastEvent, BroadcastStats};
pub use client::{send_update, HubClient, HubEvent, UpdateOutcome};
pub use config::{HubConfig, DEFAULT_PORT};
pub use protocol::{ClientMessage, HubMessage, KeySet, ProtocolError};
pub use registry::SubscriptionRegistry;
pub use server::{Hub, HubError, HubStats};
pub use store::{Snapshot, StateStore, StoreError, VersionedValue};
