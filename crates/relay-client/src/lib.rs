//! # relay-client
//!
//! Interactive terminal client for the relay chat server.
//!
//! Typed lines are translated by [`InputState`] into protocol commands
//! according to the current mode (broadcast, unicast, or group). Server
//! output is read through the mode-switching codec so inline downloads are
//! saved byte for byte; datagram downloads are received on a socket bound
//! before the request is sent.

pub mod downloads;
pub mod input;
pub mod session;

pub use downloads::{DownloadError, Downloads};
pub use input::{Action, InputState, Mode, TransferKind, MENU};
pub use session::{receive_loop, run};
