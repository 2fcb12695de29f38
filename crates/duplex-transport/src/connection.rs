//! One full-duplex socket with independent read and write sides.

use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use duplex_common::{
    ChannelIdentity, Frame, FrameReader, FrameWriter, KeepAlive, PeerId, Result, TransportConfig,
    TransportError,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::handshake::{self, Established, LocalIdentity};
use crate::registry::RegistryInner;
use crate::stats::{ConnectionStats, StatsSnapshot};

/// Process-wide counter for connection ids
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local identifier of a connection, used in logs and thread names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    /// Dialed by this transport; can reconnect.
    Client,
    /// Accepted by this transport's listener; cannot reconnect.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Unconnected,
    Handshaking,
    Active,
    Faulted,
    Reconnecting,
    Closed,
}

struct ReadHalf {
    generation: u64,
    frames: FrameReader<TcpStream>,
}

struct WriteHalf {
    generation: u64,
    frames: FrameWriter<TcpStream>,
}

struct Socket {
    generation: u64,
    stream: TcpStream,
}

/// Why a connection was closed by the transport rather than by its owner.
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Exhausted { attempts: u32 },
    Unsupported,
}

/// A handshaken TCP connection carrying frames in both directions.
///
/// Reads and writes are guarded by separate locks, so one thread can block in
/// [`receive`](Self::receive) while others complete [`send`](Self::send)s.
/// A connection is only handed out once its handshake has succeeded.
///
/// # Socket Generations
///
/// Every installed socket gets a new generation number. A failure observed on
/// one socket only faults the connection if that socket is still the current
/// one, so a late error from a replaced socket never tears down its successor.
///
/// # Lock Order
///
/// reconnect gate, then reader, then writer, then socket, then state, then
/// close reason. Send and receive hold only their own side's lock and never
/// reconnect while holding it.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    remote_address: String,
    remote_id: PeerId,
    local: LocalIdentity,
    config: TransportConfig,
    remote_identity: RwLock<Option<ChannelIdentity>>,
    reader: Mutex<Option<ReadHalf>>,
    writer: Mutex<Option<WriteHalf>>,
    socket: Mutex<Option<Socket>>,
    state: Mutex<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    reconnect_gate: Mutex<()>,
    generation: AtomicU64,
    keepalive: Mutex<KeepAlive>,
    registry: Mutex<Option<Weak<RegistryInner>>>,
    stats: ConnectionStats,
}

impl Connection {
    /// Dials `address` and performs the client side of the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Dial`] when no socket could be opened and
    /// [`TransportError::Handshake`] when the identity exchange failed. The
    /// socket is closed in both cases.
    pub fn connect(
        address: &str,
        local: &LocalIdentity,
        config: &TransportConfig,
    ) -> Result<Arc<Self>> {
        let established =
            handshake::connect(address, &local.current(), config, config.keepalive())?;
        Ok(Self::from_established(
            Role::Client,
            address.to_string(),
            established,
            local.clone(),
            config.clone(),
        ))
    }

    /// Performs the server side of the handshake on an accepted socket.
    pub fn accept(
        stream: TcpStream,
        local: &LocalIdentity,
        config: &TransportConfig,
    ) -> Result<Arc<Self>> {
        let remote_address = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let established = handshake::accept(stream, &local.current(), config)?;
        Ok(Self::from_established(
            Role::Server,
            remote_address,
            established,
            local.clone(),
            config.clone(),
        ))
    }

    fn from_established(
        role: Role,
        remote_address: String,
        established: Established,
        local: LocalIdentity,
        config: TransportConfig,
    ) -> Arc<Self> {
        let Established {
            stream,
            reader,
            writer,
            remote,
        } = established;
        let generation = 1;
        let connection = Self {
            id: ConnectionId::next(),
            role,
            remote_address,
            remote_id: remote.id(),
            local,
            keepalive: Mutex::new(config.keepalive()),
            config,
            remote_identity: RwLock::new(Some(remote)),
            reader: Mutex::new(Some(ReadHalf {
                generation,
                frames: reader,
            })),
            writer: Mutex::new(Some(WriteHalf {
                generation,
                frames: writer,
            })),
            socket: Mutex::new(Some(Socket { generation, stream })),
            state: Mutex::new(ConnectionState::Active),
            close_reason: Mutex::new(None),
            reconnect_gate: Mutex::new(()),
            generation: AtomicU64::new(generation),
            registry: Mutex::new(None),
            stats: ConnectionStats::default(),
        };
        info!(
            connection = %connection.id,
            role = ?connection.role,
            peer = %connection.remote_id,
            address = %connection.remote_address,
            "Connection established"
        );
        Arc::new(connection)
    }

    /// Runs `write` against the outbound frame stream under the write lock,
    /// then flushes.
    ///
    /// Never waits for inbound traffic. A faulted client connection is
    /// reconnected before the write lock is taken.
    pub fn send<T>(
        &self,
        write: impl FnOnce(&mut FrameWriter<TcpStream>) -> Result<T>,
    ) -> Result<T> {
        self.ready()?;

        let mut guard = self.writer.lock();
        let half = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let generation = half.generation;

        let written = write(&mut half.frames);
        // Complete frames buffered before a callback error still go out
        let flushed = half.frames.flush();
        self.stats.record_sent(half.frames.take_counts());
        drop(guard);

        let result = match (written, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };
        self.settle(result, generation, false)
    }

    /// Runs `read` against the inbound frame stream under the read lock.
    ///
    /// May block indefinitely. A blocked call returns once the socket is shut
    /// down by [`close`](Self::close) or [`interrupt`](Self::interrupt).
    pub fn receive<T>(
        &self,
        read: impl FnOnce(&mut FrameReader<TcpStream>) -> Result<T>,
    ) -> Result<T> {
        self.ready()?;

        let mut guard = self.reader.lock();
        let half = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let generation = half.generation;

        let result = read(&mut half.frames);
        self.stats.record_received(half.frames.take_counts());
        drop(guard);

        self.settle(result, generation, true)
    }

    pub fn send_frame(&self, payload: &[u8]) -> Result<()> {
        self.send(|writer| writer.write_frame(payload))
    }

    pub fn receive_frame(&self) -> Result<Frame> {
        self.receive(|reader| reader.read_frame())
    }

    /// Faults the connection on socket errors and reports closure uniformly.
    fn settle<T>(&self, result: Result<T>, generation: u64, inbound: bool) -> Result<T> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        // An oversized inbound length leaves the stream unsynchronized
        let desynced = inbound && matches!(error, TransportError::FrameTooLarge { .. });
        if error.is_connection_fault() || desynced {
            self.fault(generation, &error.to_string());
            if self.is_closed() {
                return Err(self.closed_error());
            }
        }
        Err(error)
    }

    fn ready(&self) -> Result<()> {
        let state = *self.state.lock();
        match state {
            ConnectionState::Active => Ok(()),
            ConnectionState::Closed => Err(self.closed_error()),
            _ => self.ensure_connected(),
        }
    }

    /// Error reported to callers that find the connection closed.
    ///
    /// A connection the transport gave up on keeps answering with the reason,
    /// so every caller waiting on the reconnect learns why it failed.
    fn closed_error(&self) -> TransportError {
        match *self.close_reason.lock() {
            Some(CloseReason::Exhausted { attempts }) => TransportError::ReconnectExhausted {
                address: self.remote_address.clone(),
                attempts,
            },
            Some(CloseReason::Unsupported) => {
                TransportError::ReconnectUnsupported(self.remote_address.clone())
            }
            None => TransportError::Closed,
        }
    }

    fn close_because(&self, reason: CloseReason) {
        {
            let state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *self.close_reason.lock() = Some(reason);
        }
        self.close();
    }

    /// Marks the socket of `generation` dead and shuts it down.
    fn fault(&self, generation: u64, reason: &str) {
        let mut socket = self.socket.lock();
        if socket.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        if let Some(socket) = socket.take() {
            let _ = socket.stream.shutdown(Shutdown::Both);
        }
        drop(socket);

        let mut state = self.state.lock();
        if *state == ConnectionState::Active {
            *state = ConnectionState::Faulted;
            warn!(
                connection = %self.id,
                role = ?self.role,
                address = %self.remote_address,
                reason,
                "Connection faulted"
            );
        }
    }

    /// Forcibly shuts the live socket down, leaving the connection faulted.
    ///
    /// Any blocked [`receive`](Self::receive) returns with an error. The next
    /// send or receive on a client connection reconnects.
    pub fn interrupt(&self) {
        let generation = self.socket.lock().as_ref().map(|s| s.generation);
        if let Some(generation) = generation {
            self.fault(generation, "interrupted");
        }
    }

    /// Restores a faulted connection.
    ///
    /// Client connections re-dial their original address up to `max_retries`
    /// times, sleeping `retry_delay_ms` between attempts; each attempt is a
    /// fresh dial and handshake. A handshake that reports a different peer id
    /// counts as a failed attempt. Server connections cannot reconnect and are
    /// closed immediately.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ReconnectUnsupported`] for server connections
    /// - [`TransportError::ReconnectExhausted`] once every attempt failed
    /// - [`TransportError::Closed`] if the connection is or becomes closed
    ///
    /// The connection is closed after either of the first two, and later
    /// calls keep returning the same error.
    pub fn ensure_connected(&self) -> Result<()> {
        let _gate = self.reconnect_gate.lock();

        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Active => return Ok(()),
                ConnectionState::Closed => return Err(self.closed_error()),
                _ if self.role == Role::Server => {}
                _ => *state = ConnectionState::Reconnecting,
            }
        }

        if self.role == Role::Server {
            warn!(
                connection = %self.id,
                address = %self.remote_address,
                "Server-side connection lost, closing"
            );
            self.close_because(CloseReason::Unsupported);
            return Err(TransportError::ReconnectUnsupported(
                self.remote_address.clone(),
            ));
        }

        let max_retries = self.config.max_retries;

        for attempt in 1..=max_retries {
            if attempt > 1 {
                thread::sleep(self.config.retry_delay());
            }
            match self.state() {
                ConnectionState::Closed => return Err(self.closed_error()),
                // Took over an inbound socket from the same peer meanwhile
                ConnectionState::Active => return Ok(()),
                _ => {}
            }

            self.stats.record_reconnect_attempt();
            match self.reconnect_once() {
                Ok(()) => {
                    self.stats.record_reconnect();
                    info!(
                        connection = %self.id,
                        address = %self.remote_address,
                        attempt,
                        "Reconnected"
                    );
                    return Ok(());
                }
                Err(TransportError::Closed) => return Err(self.closed_error()),
                Err(e) => {
                    warn!(
                        connection = %self.id,
                        address = %self.remote_address,
                        attempt,
                        max_retries,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }

        self.close_because(CloseReason::Exhausted {
            attempts: max_retries,
        });
        Err(TransportError::ReconnectExhausted {
            address: self.remote_address.clone(),
            attempts: max_retries,
        })
    }

    fn reconnect_once(&self) -> Result<()> {
        let local = self.local.current();
        let keepalive = *self.keepalive.lock();
        let established =
            handshake::connect(&self.remote_address, &local, &self.config, keepalive)?;

        let actual = established.remote.id();
        if actual != self.remote_id {
            established.abandon();
            return Err(TransportError::PeerMismatch {
                expected: self.remote_id.to_string(),
                actual: actual.to_string(),
            });
        }

        self.install(established, false)
    }

    /// Takes over the socket of `inbound`, an accepted connection from the
    /// same peer, and leaves `inbound` closed without touching its socket.
    ///
    /// The current socket is retired first so a blocked receive returns, and
    /// its late errors never fault this connection. Registered callers keep
    /// using this connection unchanged.
    pub(crate) fn adopt(&self, inbound: &Connection) -> Result<()> {
        let established = inbound.surrender()?;
        if let Err(e) = handshake::apply_keepalive(&established.stream, *self.keepalive.lock()) {
            warn!(connection = %self.id, error = %e, "Failed to apply keepalive");
        }

        if let Some(old) = self.socket.lock().take() {
            let _ = old.stream.shutdown(Shutdown::Both);
        }
        self.install(established, true)?;

        info!(
            connection = %self.id,
            adopted = %inbound.id,
            peer = %self.remote_id,
            "Connection took over inbound socket"
        );
        Ok(())
    }

    /// Hands the live socket to another connection and closes this one.
    fn surrender(&self) -> Result<Established> {
        let mut read_half = self.reader.lock();
        let mut write_half = self.writer.lock();
        let mut socket = self.socket.lock();
        let mut state = self.state.lock();

        if *state == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        *state = ConnectionState::Closed;
        let parts = (
            read_half.take(),
            write_half.take(),
            socket.take(),
            self.remote_identity.write().take(),
        );
        let (Some(read_half), Some(write_half), Some(socket), Some(remote)) = parts else {
            return Err(TransportError::Closed);
        };

        Ok(Established {
            stream: socket.stream,
            reader: read_half.frames,
            writer: write_half.frames,
            remote,
        })
    }

    /// Swaps in a freshly handshaken socket unless the connection closed.
    ///
    /// A reconnect that lands after the connection already took over an
    /// inbound socket is abandoned.
    fn install(&self, established: Established, adopted: bool) -> Result<()> {
        let Established {
            stream,
            reader,
            writer,
            remote,
        } = established;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut read_half = self.reader.lock();
        let mut write_half = self.writer.lock();
        let mut socket = self.socket.lock();
        let mut state = self.state.lock();

        match *state {
            ConnectionState::Closed => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(TransportError::Closed);
            }
            ConnectionState::Active if !adopted => {
                debug!(connection = %self.id, "Already active, dropping reconnected socket");
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
            _ => {}
        }

        *read_half = Some(ReadHalf {
            generation,
            frames: reader,
        });
        *write_half = Some(WriteHalf {
            generation,
            frames: writer,
        });
        *socket = Some(Socket { generation, stream });
        *self.remote_identity.write() = Some(remote);
        *state = ConnectionState::Active;
        Ok(())
    }

    /// Closes the connection and removes it from its registry.
    ///
    /// Idempotent and callable from any thread. The socket is shut down first
    /// so a blocked receive wakes up, then both sides are released under the
    /// read lock and the write lock, taken in that order. Release failures are
    /// ignored.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if let Some(socket) = self.socket.lock().as_ref() {
            let _ = socket.stream.shutdown(Shutdown::Both);
        }

        let mut reader = self.reader.lock();
        let mut writer = self.writer.lock();
        let read_half = reader.take();
        let write_half = writer.take();
        let socket = self.socket.lock().take();
        self.remote_identity.write().take();
        drop(writer);
        drop(reader);

        drop(read_half);
        drop(write_half);
        drop(socket);

        let registry = self.registry.lock().take();
        if let Some(registry) = registry.and_then(|weak| weak.upgrade()) {
            registry.remove_all(self);
        }

        info!(
            connection = %self.id,
            role = ?self.role,
            address = %self.remote_address,
            "Connection closed"
        );
    }

    /// Applies OS keepalive to the live socket and remembers it for reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when there is no live socket.
    pub fn set_keep_alive(&self, enabled: bool, time_ms: u64, interval_ms: u64) -> Result<()> {
        let keepalive = KeepAlive {
            enabled,
            time: std::time::Duration::from_millis(time_ms),
            interval: std::time::Duration::from_millis(interval_ms),
        };
        *self.keepalive.lock() = keepalive;

        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or(TransportError::Closed)?;
        handshake::apply_keepalive(&socket.stream, keepalive)?;
        debug!(connection = %self.id, enabled, time_ms, interval_ms, "Keepalive updated");
        Ok(())
    }

    pub(crate) fn attach_registry(&self, registry: Weak<RegistryInner>) {
        *self.registry.lock() = Some(registry);
    }

    pub(crate) fn detach_registry(&self) {
        self.registry.lock().take();
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Address this connection was dialed at, or the peer's socket address
    /// for accepted connections.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Peer id learned during the first handshake. Kept after close.
    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    /// Identity the peer sent in the latest handshake; `None` once closed.
    pub fn remote_identity(&self) -> Option<ChannelIdentity> {
        self.remote_identity.read().clone()
    }

    /// Id of the local transport this connection belongs to.
    pub fn local_id(&self) -> PeerId {
        self.local.id()
    }

    pub fn keepalive(&self) -> KeepAlive {
        *self.keepalive.lock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_address", &self.remote_address)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn pair(config: &TransportConfig) -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server_config = config.clone();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            Connection::accept(stream, &LocalIdentity::generate(), &server_config).unwrap()
        });
        let client = Connection::connect(&address, &LocalIdentity::generate(), config).unwrap();
        (client, server.join().unwrap())
    }

    #[test]
    fn test_handshake_exchanges_ids() {
        let (client, server) = pair(&TransportConfig::default());
        assert_eq!(client.role(), Role::Client);
        assert_eq!(server.role(), Role::Server);
        assert_eq!(client.remote_id(), server.local_id());
        assert_eq!(server.remote_id(), client.local_id());
        assert_eq!(client.state(), ConnectionState::Active);
        assert_ne!(client.id(), server.id());
    }

    #[test]
    fn test_frames_flow_both_ways() {
        let (client, server) = pair(&TransportConfig::default());

        client.send_frame(b"ping").unwrap();
        assert_eq!(server.receive_frame().unwrap().as_bytes(), b"ping");

        server.send_frame(b"pong").unwrap();
        assert_eq!(client.receive_frame().unwrap().as_bytes(), b"pong");

        let stats = client.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, 8);
        assert_eq!(stats.frames_received, 1);
    }

    #[test]
    fn test_send_batches_frames_under_one_lock() {
        let (client, server) = pair(&TransportConfig::default());
        client
            .send(|writer| {
                writer.write_frame(b"a")?;
                writer.write_frame(b"b")
            })
            .unwrap();
        assert_eq!(server.receive_frame().unwrap().as_bytes(), b"a");
        assert_eq!(server.receive_frame().unwrap().as_bytes(), b"b");
    }

    #[test]
    fn test_send_completes_while_receive_blocks() {
        let (client, server) = pair(&TransportConfig::default());

        let reader = client.clone();
        let blocked = thread::spawn(move || reader.receive_frame());
        thread::sleep(Duration::from_millis(50));

        client.send_frame(b"while blocked").unwrap();
        assert_eq!(server.receive_frame().unwrap().as_bytes(), b"while blocked");

        server.send_frame(b"unblock").unwrap();
        assert_eq!(blocked.join().unwrap().unwrap().as_bytes(), b"unblock");
    }

    #[test]
    fn test_close_is_idempotent_and_wakes_receiver() {
        let (client, _server) = pair(&TransportConfig::default());

        let reader = client.clone();
        let blocked = thread::spawn(move || reader.receive_frame());
        thread::sleep(Duration::from_millis(50));

        client.close();
        client.close();

        assert!(matches!(blocked.join().unwrap(), Err(TransportError::Closed)));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.remote_identity().is_none());
        assert!(matches!(client.send_frame(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn test_server_role_cannot_reconnect() {
        let (_client, server) = pair(&TransportConfig::default());
        server.interrupt();
        assert_eq!(server.state(), ConnectionState::Faulted);

        let result = server.send_frame(b"x");
        assert!(matches!(result, Err(TransportError::ReconnectUnsupported(_))));
        assert_eq!(server.state(), ConnectionState::Closed);

        // Later callers learn why it closed
        assert!(matches!(
            server.receive_frame(),
            Err(TransportError::ReconnectUnsupported(_))
        ));
    }

    #[test]
    fn test_set_keep_alive_requires_socket() {
        let (client, _server) = pair(&TransportConfig::default());
        client.set_keep_alive(true, 10_000, 500).unwrap();
        assert_eq!(client.keepalive().time, Duration::from_millis(10_000));

        client.close();
        assert!(matches!(
            client.set_keep_alive(false, 0, 0),
            Err(TransportError::Closed)
        ));
    }
}
