//! Realtime push channel for the Stockyard sync layer.
//!
//! A single [`SocketChannel`] per app session keeps a WebSocket open to the
//! server, decodes Socket.IO event frames and fans them out to registered
//! handlers. Outbound events are queued until the connection is up.

mod channel;
mod error;
mod frame;
mod transport;

pub use channel::{EventHandler, ListenerId, SocketChannel, Subscription};
pub use error::{Result, SocketError};
pub use frame::{decode, encode_connect, encode_event, encode_pong, Frame, FrameProtocol};
pub use transport::{ReconnectPolicy, SocketConfig};
