//! # relay-server
//!
//! The relay chat server: a single-task multiplexing loop over TCP control
//! connections, a command dispatcher, and inline or datagram file transfers
//! from a shared directory.
//!
//! ```rust,ignore
//! let config = relay_server::Config::load()?;
//! relay_server::Server::bind(&config).await?.run().await?;
//! ```

pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod server;
pub mod transfer;

pub use catalog::{CatalogEntry, CatalogError, SharedCatalog};
pub use config::Config;
pub use dispatcher::{Dispatcher, Flow};
pub use server::Server;
pub use transfer::{TransferCoordinator, TransferError, TransferMode, TransferState};
