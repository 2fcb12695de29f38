//! Socket establishment and the identity exchange.
//!
//! The dialing side writes its identity first and then reads the peer's; the
//! accepting side reads first and then writes. The fixed order means both
//! sides never block writing to each other at the same time.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use duplex_common::frame::MAX_FRAME_SIZE;
use duplex_common::identity::MAX_HANDSHAKE_SIZE;
use duplex_common::{
    ChannelIdentity, FrameReader, FrameWriter, KeepAlive, PeerId, Result, TransportConfig,
    TransportError,
};
use parking_lot::RwLock;
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, warn};

use crate::connection::Role;

/// Shared handle on the local identity of one transport.
///
/// The id never changes; the advertised addresses are replaced once the
/// transport starts listening. Connections read the current value each time
/// they (re)handshake.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    current: Arc<RwLock<Arc<ChannelIdentity>>>,
}

impl LocalIdentity {
    pub fn new(identity: ChannelIdentity) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(identity))),
        }
    }

    /// Identity of a fresh transport with a random id and no addresses.
    pub fn generate() -> Self {
        Self::new(ChannelIdentity::unlistened(PeerId::random()))
    }

    pub fn id(&self) -> PeerId {
        self.current.read().id()
    }

    pub fn current(&self) -> Arc<ChannelIdentity> {
        self.current.read().clone()
    }

    /// Replaces the advertised part of the identity, keeping the id.
    pub fn advertise(&self, addresses: Vec<String>, port: u16) -> Arc<ChannelIdentity> {
        let mut current = self.current.write();
        let identity = Arc::new(ChannelIdentity::new(current.id(), addresses, port));
        *current = identity.clone();
        identity
    }
}

/// A socket that completed the identity exchange.
pub(crate) struct Established {
    pub stream: TcpStream,
    pub reader: FrameReader<TcpStream>,
    pub writer: FrameWriter<TcpStream>,
    pub remote: ChannelIdentity,
}

impl Established {
    pub fn abandon(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Dials `address` and performs the client side of the handshake.
pub(crate) fn connect(
    address: &str,
    local: &ChannelIdentity,
    config: &TransportConfig,
    keepalive: KeepAlive,
) -> Result<Established> {
    let stream = dial(address, config.connect_timeout())?;
    establish(stream, Role::Client, local, config, keepalive)
}

/// Performs the server side of the handshake on an accepted socket.
pub(crate) fn accept(
    stream: TcpStream,
    local: &ChannelIdentity,
    config: &TransportConfig,
) -> Result<Established> {
    establish(stream, Role::Server, local, config, config.keepalive())
}

/// Connects to a remote endpoint.
///
/// The address may resolve to several socket addresses; each one is tried
/// until a connection succeeds.
fn dial(address: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = address.to_socket_addrs().map_err(|e| TransportError::Dial {
        address: address.to_string(),
        reason: format!("invalid address: {}", e),
    })?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(address, %socket_addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(TransportError::Dial {
        address: address.to_string(),
        reason: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "address resolved to nothing".to_string()),
    })
}

fn establish(
    stream: TcpStream,
    role: Role,
    local: &ChannelIdentity,
    config: &TransportConfig,
    keepalive: KeepAlive,
) -> Result<Established> {
    match try_establish(&stream, role, local, config, keepalive) {
        Ok((reader, writer, remote)) => Ok(Established {
            stream,
            reader,
            writer,
            remote,
        }),
        Err(e) => {
            // The socket is closed before the error reaches the caller
            let _ = stream.shutdown(Shutdown::Both);
            Err(e)
        }
    }
}

fn try_establish(
    stream: &TcpStream,
    role: Role,
    local: &ChannelIdentity,
    config: &TransportConfig,
    keepalive: KeepAlive,
) -> Result<(FrameReader<TcpStream>, FrameWriter<TcpStream>, ChannelIdentity)> {
    stream.set_nodelay(true)?;
    if let Err(e) = apply_keepalive(stream, keepalive) {
        warn!(error = %e, "Failed to apply keepalive");
    }

    let timeout = Some(config.handshake_timeout());
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let mut reader = FrameReader::new(stream.try_clone()?, config.frame_buffer_size)
        .with_max_frame_size(MAX_HANDSHAKE_SIZE);
    let mut writer = FrameWriter::new(stream.try_clone()?, config.frame_buffer_size);

    let remote = exchange(&mut reader, &mut writer, role, local)?;

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    reader.set_max_frame_size(MAX_FRAME_SIZE);
    reader.take_counts();
    writer.take_counts();

    Ok((reader, writer, remote))
}

/// Runs the one-round identity exchange in the order fixed by `role`.
pub(crate) fn exchange<R: io::Read, W: io::Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: Role,
    local: &ChannelIdentity,
) -> Result<ChannelIdentity> {
    match role {
        Role::Client => {
            send_identity(writer, local)?;
            receive_identity(reader)
        }
        Role::Server => {
            let remote = receive_identity(reader)?;
            send_identity(writer, local)?;
            Ok(remote)
        }
    }
}

fn send_identity<W: io::Write>(writer: &mut FrameWriter<W>, local: &ChannelIdentity) -> Result<()> {
    let payload = local.encode()?;
    writer
        .write_frame(&payload)
        .and_then(|_| writer.flush())
        .map_err(|e| TransportError::Handshake(format!("sending identity: {}", e)))
}

fn receive_identity<R: io::Read>(reader: &mut FrameReader<R>) -> Result<ChannelIdentity> {
    let frame = reader
        .read_frame()
        .map_err(|e| TransportError::Handshake(format!("receiving identity: {}", e)))?;
    ChannelIdentity::decode(frame.as_bytes())
}

/// Applies OS-level keepalive parameters to a socket.
pub(crate) fn apply_keepalive(stream: &TcpStream, keepalive: KeepAlive) -> io::Result<()> {
    let socket = SockRef::from(stream);
    if !keepalive.enabled {
        return socket.set_keepalive(false);
    }

    let params = TcpKeepalive::new().with_time(keepalive.time);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        windows
    ))]
    let params = params.with_interval(keepalive.interval);

    socket.set_tcp_keepalive(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wire(identity: &ChannelIdentity) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new(), 64);
        send_identity(&mut writer, identity).unwrap();
        writer.get_ref().clone()
    }

    #[test]
    fn test_client_writes_before_reading() {
        let local = ChannelIdentity::new(PeerId::random(), vec!["127.0.0.1:1".into()], 1);
        let remote = ChannelIdentity::new(PeerId::random(), vec!["127.0.0.1:2".into()], 2);

        let mut reader = FrameReader::new(Cursor::new(wire(&remote)), 64);
        let mut writer = FrameWriter::new(Vec::new(), 64);
        let learned = exchange(&mut reader, &mut writer, Role::Client, &local).unwrap();

        assert_eq!(learned, remote);
        assert_eq!(writer.get_ref(), &wire(&local));
    }

    #[test]
    fn test_server_does_not_write_when_read_fails() {
        let local = ChannelIdentity::unlistened(PeerId::random());
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 64);
        let mut writer = FrameWriter::new(Vec::new(), 64);

        let result = exchange(&mut reader, &mut writer, Role::Server, &local);
        assert!(matches!(result, Err(TransportError::Handshake(_))));
        assert!(writer.get_ref().is_empty());
    }

    #[test]
    fn test_garbage_identity_is_handshake_error() {
        let mut garbage = FrameWriter::new(Vec::new(), 64);
        garbage.write_frame(b"hello").unwrap();
        garbage.flush().unwrap();

        let mut reader = FrameReader::new(Cursor::new(garbage.get_ref().clone()), 64);
        let mut writer = FrameWriter::new(Vec::new(), 64);
        let local = ChannelIdentity::unlistened(PeerId::random());

        let result = exchange(&mut reader, &mut writer, Role::Server, &local);
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[test]
    fn test_dial_invalid_address() {
        let result = dial("not an address", Duration::from_millis(100));
        match result {
            Err(TransportError::Dial { address, .. }) => assert_eq!(address, "not an address"),
            other => panic!("expected Dial error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_local_identity_advertise_keeps_id() {
        let local = LocalIdentity::generate();
        let id = local.id();
        let updated = local.advertise(vec!["127.0.0.1:7000".into()], 7000);
        assert_eq!(updated.id(), id);
        assert_eq!(local.current().port(), 7000);
    }
}
