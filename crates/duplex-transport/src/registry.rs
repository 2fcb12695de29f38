//! Connection registry deduplicating sockets per peer.
//!
//! A connection is reachable under several keys: the literal address it was
//! dialed at, the string form of the peer id, and every address the peer
//! advertised in its handshake. At most one live connection is registered per
//! peer id.
//!
//! When two live sockets join the same pair of transports, both ends keep the
//! one dialed by the transport with the smaller peer id. A client connection
//! whose own socket loses takes over the surviving inbound socket, so the
//! handle its dialer holds stays usable.

use std::collections::HashMap;
use std::sync::Arc;

use duplex_common::{PeerId, Result, TransportConfig};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionState, Role};
use crate::handshake::LocalIdentity;

/// Result of adding a connection to the registry.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// The connection is new and now registered.
    Created(Arc<Connection>),
    /// A connection to the same peer was already registered; any newly built
    /// duplicate has been closed.
    FoundExisting(Arc<Connection>),
}

impl RegisterOutcome {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            RegisterOutcome::Created(connection) | RegisterOutcome::FoundExisting(connection) => {
                connection
            }
        }
    }

    pub fn into_connection(self) -> Arc<Connection> {
        match self {
            RegisterOutcome::Created(connection) | RegisterOutcome::FoundExisting(connection) => {
                connection
            }
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, RegisterOutcome::Created(_))
    }
}

pub(crate) struct RegistryInner {
    local: LocalIdentity,
    config: TransportConfig,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    by_key: HashMap<String, Arc<Connection>>,
    /// Accepted ends of this transport dialing itself; never keyed
    loopback: Vec<Arc<Connection>>,
}

impl RegistryState {
    fn live(&self, key: &str) -> Option<Arc<Connection>> {
        self.by_key.get(key).filter(|c| !c.is_closed()).cloned()
    }

    fn keys_for(&self, connection: &Connection) -> Vec<String> {
        let mut keys: Vec<String> = self
            .by_key
            .iter()
            .filter(|(_, c)| std::ptr::eq(Arc::as_ptr(c), connection))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn remove(&mut self, connection: &Connection) -> usize {
        let before = self.by_key.len();
        self.by_key
            .retain(|_, c| !std::ptr::eq(Arc::as_ptr(c), connection));
        self.loopback
            .retain(|c| !std::ptr::eq(Arc::as_ptr(c), connection));
        before - self.by_key.len()
    }

    fn distinct(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> = Vec::new();
        for connection in self.by_key.values() {
            if !connections.iter().any(|c| Arc::ptr_eq(c, connection)) {
                connections.push(connection.clone());
            }
        }
        connections.sort_by_key(|c| c.id());
        connections
    }

    /// Keys `connection` under its peer id and advertised addresses, plus the
    /// dial address when there is one.
    ///
    /// The dial address and the id always point at `connection`. An
    /// advertised address already held by another live connection is left
    /// alone.
    fn insert(&mut self, connection: &Arc<Connection>, dial_address: Option<&str>) {
        if let Some(address) = dial_address {
            self.by_key.insert(address.to_string(), connection.clone());
        }
        self.by_key
            .insert(connection.remote_id().to_string(), connection.clone());

        let Some(identity) = connection.remote_identity() else {
            return;
        };
        for address in identity.addresses() {
            match self.by_key.get(address) {
                Some(holder) if !Arc::ptr_eq(holder, connection) && !holder.is_closed() => {
                    debug!(
                        address = %address,
                        holder = %holder.id(),
                        "Advertised address already registered"
                    );
                }
                _ => {
                    self.by_key.insert(address.clone(), connection.clone());
                }
            }
        }
    }
}

impl RegistryInner {
    /// Drops every key pointing at `connection`. Called once from
    /// [`Connection::close`].
    pub(crate) fn remove_all(&self, connection: &Connection) {
        let removed = self.state.lock().remove(connection);
        debug!(connection = %connection.id(), removed, "Connection unregistered");
    }
}

/// Map from lookup key to connection, owned by one transport.
///
/// Cloning yields another handle on the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry whose outbound connections handshake with
    /// `local`.
    pub fn new(local: LocalIdentity, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                local,
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Returns the connection registered under `address`, dialing it if there
    /// is none.
    ///
    /// The registry lock is held through the dial and handshake, so concurrent
    /// callers for the same address observe a single connection. When the
    /// handshake reveals a peer that is already registered, the new socket is
    /// usually closed and `address` becomes another key of the existing
    /// connection. The new connection replaces an existing inbound one
    /// instead when that one is no longer active, or when this transport has
    /// the smaller peer id and so its socket is the one both ends keep.
    ///
    /// # Errors
    ///
    /// Dial and handshake errors are returned as is; nothing is registered.
    pub fn get_or_create(&self, address: &str) -> Result<RegisterOutcome> {
        let mut state = self.inner.state.lock();

        if let Some(existing) = state.by_key.get(address).cloned() {
            if !existing.is_closed() {
                return Ok(RegisterOutcome::FoundExisting(existing));
            }
            state.remove(&existing);
        }

        let connection = Connection::connect(address, &self.inner.local, &self.inner.config)?;

        if let Some(existing) = state.live(&connection.remote_id().to_string()) {
            let replace = existing.role() == Role::Server
                && (existing.state() != ConnectionState::Active
                    || !self.peer_dial_wins(existing.remote_id()));
            if !replace {
                state.by_key.insert(address.to_string(), existing.clone());
                drop(state);

                info!(
                    address,
                    peer = %existing.remote_id(),
                    existing = %existing.id(),
                    "Peer already connected, reusing existing connection"
                );
                connection.close();
                return Ok(RegisterOutcome::FoundExisting(existing));
            }

            self.replace(&mut state, &existing, &connection, Some(address));
            drop(state);
            info!(
                address,
                peer = %connection.remote_id(),
                replaced = %existing.id(),
                connection = %connection.id(),
                "Outbound connection replaces inbound connection"
            );
            existing.close();
            return Ok(RegisterOutcome::Created(connection));
        }

        state.insert(&connection, Some(address));
        self.attach(&mut state, &connection);
        Ok(RegisterOutcome::Created(connection))
    }

    /// Registers an accepted connection.
    ///
    /// When the peer has no live registered connection the new one is keyed
    /// and returned as created. Otherwise:
    ///
    /// - an existing client connection takes over the inbound socket when it
    ///   is not active, or when the peer's dial wins the tie-break; the
    ///   inbound connection is consumed and the existing one returned
    /// - an existing active connection is kept otherwise, and the new one is
    ///   closed
    /// - an existing inbound connection that is faulted is replaced: its keys
    ///   move to the new connection and it is closed
    ///
    /// A connection from this transport to itself is kept as a loopback end
    /// without keys.
    pub fn register(&self, connection: Arc<Connection>) -> RegisterOutcome {
        let mut state = self.inner.state.lock();

        if connection.remote_id() == self.inner.local.id() {
            state.loopback.retain(|c| !c.is_closed());
            state.loopback.push(connection.clone());
            self.attach(&mut state, &connection);
            debug!(connection = %connection.id(), "Loopback connection registered");
            return RegisterOutcome::Created(connection);
        }

        let Some(existing) = state.live(&connection.remote_id().to_string()) else {
            state.insert(&connection, None);
            self.attach(&mut state, &connection);
            return RegisterOutcome::Created(connection);
        };
        let active = existing.state() == ConnectionState::Active;

        if existing.role() == Role::Client
            && (!active || self.peer_dial_wins(connection.remote_id()))
        {
            match existing.adopt(&connection) {
                Ok(()) => {
                    state.insert(&existing, None);
                    return RegisterOutcome::FoundExisting(existing);
                }
                Err(e) => {
                    // Either end closed concurrently; the peer redials
                    debug!(existing = %existing.id(), error = %e, "Socket takeover failed");
                    if existing.is_closed() {
                        state.remove(&existing);
                    }
                    connection.close();
                    return RegisterOutcome::FoundExisting(existing);
                }
            }
        }

        if active {
            drop(state);
            info!(
                peer = %connection.remote_id(),
                existing = %existing.id(),
                discarded = %connection.id(),
                "Peer already connected, discarding inbound duplicate"
            );
            connection.close();
            return RegisterOutcome::FoundExisting(existing);
        }

        self.replace(&mut state, &existing, &connection, None);
        drop(state);
        info!(
            peer = %connection.remote_id(),
            replaced = %existing.id(),
            connection = %connection.id(),
            "Inbound connection replaces stale connection"
        );
        existing.close();
        RegisterOutcome::Created(connection)
    }

    /// Whether a socket dialed by `peer` beats one dialed by this transport.
    /// Both ends reach the same answer: the smaller id's socket survives.
    fn peer_dial_wins(&self, peer: PeerId) -> bool {
        peer < self.inner.local.id()
    }

    /// Re-points every key of `existing` at `connection` and registers it.
    /// The caller closes `existing` after releasing the lock.
    fn replace(
        &self,
        state: &mut RegistryState,
        existing: &Arc<Connection>,
        connection: &Arc<Connection>,
        dial_address: Option<&str>,
    ) {
        for key in state.keys_for(existing) {
            state.by_key.insert(key, connection.clone());
        }
        existing.detach_registry();
        state.insert(connection, dial_address);
        self.attach(state, connection);
    }

    fn attach(&self, state: &mut RegistryState, connection: &Arc<Connection>) {
        connection.attach_registry(Arc::downgrade(&self.inner));
        // Closed before the back-reference existed, so nobody else unregisters it
        if connection.is_closed() {
            state.remove(connection);
        }
    }

    /// Deletes every key pointing at `connection`.
    pub fn remove_all(&self, connection: &Connection) {
        self.inner.remove_all(connection);
    }

    /// Live connection registered under `key`.
    pub fn lookup(&self, key: &str) -> Option<Arc<Connection>> {
        self.inner.state.lock().live(key)
    }

    /// Every key currently pointing at `connection`, sorted.
    pub fn keys_for(&self, connection: &Connection) -> Vec<String> {
        self.inner.state.lock().keys_for(connection)
    }

    /// Distinct keyed connections, ordered by connection id.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.state.lock().distinct()
    }

    /// Every connection, loopback ends included, created under `local_id`.
    pub fn connections_for_local_identity(&self, local_id: PeerId) -> Vec<Arc<Connection>> {
        let state = self.inner.state.lock();
        let mut connections = state.distinct();
        connections.extend(state.loopback.iter().cloned());
        connections.retain(|c| c.local_id() == local_id);
        connections
    }

    /// Number of distinct keyed connections.
    pub fn len(&self) -> usize {
        self.inner.state.lock().distinct().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().by_key.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.inner.state.lock().by_key.len()
    }

    /// Empties the registry and closes every connection it held.
    pub fn close_all(&self) {
        let connections = {
            let mut state = self.inner.state.lock();
            let mut connections = state.distinct();
            connections.append(&mut state.loopback);
            state.by_key.clear();
            connections
        };
        for connection in connections {
            connection.close();
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local.id()
    }
}
