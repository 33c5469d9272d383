//! Gateway side of the connector.
//!
//! [`GatewayClient`] drives one connection at a time for a session. Frames
//! go through [`codec::GatewayFrameCodec`], lifecycle decisions are made by
//! [`session::GatewaySession`], and every connect attempt waits its turn in
//! a [`reconnect::ReconnectCoordinator`] shared by all sessions of the process.

pub mod client;
pub mod close_code;
pub mod codec;
pub mod heartbeat;
pub mod reconnect;
pub mod sender;
pub mod session;

pub use client::{EventCallback, GatewayClient};
pub use close_code::CloseCode;
pub use codec::GatewayFrameCodec;
pub use reconnect::{ReconnectCoordinator, ReconnectTicket, SessionKey};
pub use session::{ConnectKind, ConnectionStatus, GatewaySession};
