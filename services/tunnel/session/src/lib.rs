//! Transport dialing, tuning, socket protection and multiplexed sessions for the tunnel client.
//!
//! This crate turns a remote address into a ready-to-use multiplexed session:
//! it dials the transport, applies the tuning parameters, optionally layers
//! compression on top, and starts a stream multiplexer over the result.
//!
//! ## Features
//!
//! - **Transport seam**: [`TransportDialer`] / [`TransportConn`] with a TCP implementation
//! - **Socket protection**: [`SocketProtector`] strategy, fd hand-off over a Unix socket in VPN mode
//! - **Multiplexing**: [`TransportSession`] capability backed by yamux
//! - **Session factory**: one-shot creation plus a fixed-delay retry loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod factory;
pub mod mux;
pub mod protect;
pub mod transport;

// Re-export main types
pub use error::SessionError;
pub use factory::{SessionConfig, SessionFactory, SessionSource, RETRY_DELAY};
pub use mux::{BoxedStream, MuxConfig, SharedSession, TransportSession, YamuxSession};
pub use protect::{NoopProtector, RawSocket, SocketProtector};
pub use transport::{
    listen_tcp, AsyncStream, FecConfig, NoDelayConfig, TcpConn, TcpDialer, TransportConn,
    TransportDialer,
};

#[cfg(unix)]
pub use protect::UnixSocketProtector;
