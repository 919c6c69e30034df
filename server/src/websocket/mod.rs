//! Realtime change feeds over WebSocket.
//!
//! Clients open one socket to `/realtime` and multiplex subscriptions on it.
//! Each subscription forwards one store feed as `change` messages until the
//! client unsubscribes or the socket closes.

mod handler;
mod manager;

pub use handler::handle_websocket_connection;
pub use manager::{Connection, ConnectionManager, MessageSender, Subscription};
