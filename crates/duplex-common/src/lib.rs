//! Duplex Common Types
//!
//! This crate provides the pieces shared by every part of the duplex
//! transport: peer identity and its handshake encoding, length-prefixed
//! framing, configuration and the error taxonomy.
//!
//! # Overview
//!
//! A duplex transport carries calls in both directions over one TCP
//! connection. Before any frame flows, both sides exchange a
//! [`ChannelIdentity`] so each knows who is at the other end and how to
//! reach it again.
//!
//! - **Identity**: 128-bit random [`PeerId`] plus advertised addresses and port
//! - **Framing**: `[4-byte length prefix as u32 big-endian] + [payload]`
//! - **Max Frame Size**: 100 MB (prevents memory exhaustion)
//!
//! # Components
//!
//! - [`identity`] - Channel identity and the versioned handshake codec
//! - [`frame`] - Frame reader/writer
//! - [`config`] - Transport configuration and defaults
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```
//! use duplex_common::{ChannelIdentity, PeerId};
//!
//! let identity = ChannelIdentity::new(PeerId::random(), vec!["127.0.0.1:7000".into()], 7000);
//! let bytes = identity.encode().unwrap();
//! assert_eq!(ChannelIdentity::decode(&bytes).unwrap(), identity);
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod identity;

pub use config::{KeepAlive, TransportConfig};
pub use error::{Result, TransportError};
pub use frame::{Frame, FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use identity::{ChannelIdentity, PeerId};
