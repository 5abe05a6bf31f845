//! # relay-core
//!
//! Core types and message routing for the relay chat server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Session** - Connection identity and the session table
//! - **Group** - Named sets of sessions for fan-out
//! - **Router** - Broadcast, unicast, and group routing over the table
//! - **Message** - Rendered deliveries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Dispatcher │────▶│ SessionTable │◀────│   Router    │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!                            │                    │
//!                            ▼                    ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │    Group    │     │  Delivery   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! The table is owned by a single task; nothing here locks.

pub mod group;
pub mod message;
pub mod router;
pub mod session;

pub use group::{Group, GroupName};
pub use message::Delivery;
pub use router::{Router, RoutingError};
pub use session::{ConnectionId, Session, SessionError, SessionTable, TableStats};
