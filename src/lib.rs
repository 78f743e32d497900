//! # Foreman — chat-driven task dispatch broker
//!
//! Foreman mediates between a team chat workspace and a fleet of
//! long-running worker agents executing AI coding tasks inside project
//! checkouts. A chat command becomes a persisted task, streams to an agent
//! over a persistent authenticated duplex connection, and the agent's
//! acknowledgements, tool-use progress, text deltas and terminal result
//! fan back into chat as live-updated messages, reactions and blocks.
//!
//! ## Core components
//!
//! - [`gateway`]: authenticated WebSocket connections, heartbeats, one live
//!   connection per agent.
//! - [`registry`]: connected-agent table, `auto` resolution, connection
//!   edges.
//! - [`router`]: agent-frame demux into state transitions and chat effects.
//! - [`commands`]: submit / decomposition / resubmit / cancel.
//! - [`offline_queue`]: durable per-agent outbox with TTL and ordered
//!   redelivery.
//! - [`stream_accumulator`] and [`progress`]: live chat updates.
//! - [`sync`]: test → build → restart → deploy orchestration.
//! - [`agent`]: the worker-side runtime with auto-continuation.

pub mod admin_api;
pub mod agent;
pub mod blocks;
pub mod bots;
pub mod broker;
pub mod chat;
pub mod commands;
pub mod config;
pub mod database;
pub mod domain;
pub mod gateway;
pub mod health;
pub mod notifier;
pub mod offline_queue;
pub mod pending;
pub mod progress;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod storage;
pub mod stream_accumulator;
pub mod sync;

pub use broker::Broker;
pub use config::{AgentConfig, BrokerConfig};
pub use database::{Database, StorageError};
pub use protocol::Frame;
