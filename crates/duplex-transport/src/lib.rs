//! Full-duplex TCP transport.
//!
//! One socket per peer carries calls in both directions. This crate provides:
//!
//! - [`Connection`]: a handshaken socket with independent read and write
//!   locks and client-side reconnection
//! - [`ConnectionRegistry`]: deduplication of connections by dial address,
//!   peer id and advertised addresses
//! - [`ListenerManager`]: the accept loop folding inbound sockets into the
//!   same registry
//! - [`DuplexTransport`]: the facade tying them to one frame handler

pub mod connection;
pub mod handshake;
pub mod listener;
pub mod pump;
pub mod registry;
pub mod stats;
pub mod transport;

pub use connection::{Connection, ConnectionId, ConnectionState, Role};
pub use handshake::LocalIdentity;
pub use listener::{advertised_addresses, ListenerManager};
pub use pump::FrameHandler;
pub use registry::{ConnectionRegistry, RegisterOutcome};
pub use stats::StatsSnapshot;
pub use transport::DuplexTransport;

pub use duplex_common::{
    ChannelIdentity, Frame, FrameReader, FrameWriter, PeerId, Result, TransportConfig,
    TransportError,
};
