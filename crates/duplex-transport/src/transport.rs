use std::net::SocketAddr;
use std::sync::Arc;

use duplex_common::{ChannelIdentity, PeerId, Result, TransportConfig};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::handshake::LocalIdentity;
use crate::listener::ListenerManager;
use crate::pump::{self, FrameHandler};
use crate::registry::{ConnectionRegistry, RegisterOutcome};

/// Duplex transport endpoint.
///
/// Owns a local identity, a connection registry and a listener. Every frame
/// received on any connection, dialed or accepted, is handed to the single
/// [`FrameHandler`] given at construction; replies and unsolicited calls are
/// written back with [`Connection::send`] on the same connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use duplex_common::{Frame, Result, TransportConfig};
/// use duplex_transport::{Connection, DuplexTransport};
///
/// # fn main() -> Result<()> {
/// let transport = DuplexTransport::new(
///     TransportConfig::default(),
///     |connection: &Arc<Connection>, frame: Frame| -> Result<()> {
///         connection.send_frame(frame.as_bytes())
///     },
/// )?;
/// transport.listen(7000)?;
/// let peer = transport.dial("10.0.0.2:7000")?;
/// peer.send_frame(b"hello")?;
/// # Ok(())
/// # }
/// ```
pub struct DuplexTransport {
    local: LocalIdentity,
    config: TransportConfig,
    registry: ConnectionRegistry,
    listener: ListenerManager,
    handler: Arc<dyn FrameHandler>,
}

impl DuplexTransport {
    /// Creates a transport with a fresh random identity.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `config` does not validate.
    pub fn new(config: TransportConfig, handler: impl FrameHandler) -> Result<Self> {
        config.validate()?;

        let local = LocalIdentity::generate();
        let handler: Arc<dyn FrameHandler> = Arc::new(handler);
        let registry = ConnectionRegistry::new(local.clone(), config.clone());
        let listener = ListenerManager::new(
            registry.clone(),
            handler.clone(),
            local.clone(),
            config.clone(),
        );

        info!(peer = %local.id(), "Transport created");
        Ok(Self {
            local,
            config,
            registry,
            listener,
            handler,
        })
    }

    /// Returns the connection to `address`, dialing it if needed.
    ///
    /// A newly created connection gets its own receive pump, so frames the
    /// peer initiates on it reach the frame handler.
    pub fn dial(&self, address: &str) -> Result<Arc<Connection>> {
        let outcome = self.registry.get_or_create(address)?;
        if let RegisterOutcome::Created(connection) = &outcome {
            if let Err(e) = pump::spawn(connection.clone(), self.handler.clone()) {
                warn!(connection = %connection.id(), error = %e, "Failed to start receive pump");
                connection.close();
                return Err(e.into());
            }
        }
        Ok(outcome.into_connection())
    }

    /// Starts listening on `port` (0 for any) and advertises the reachable
    /// addresses in the local identity.
    pub fn listen(&self, port: u16) -> Result<SocketAddr> {
        let bound = self.listener.start_listening(port)?;
        let addresses = crate::listener::advertised_addresses(bound, self.local.id());
        let identity = self.local.advertise(addresses, bound.port());
        info!(address = %bound, identity = %identity, "Transport listening");
        Ok(bound)
    }

    /// Listens on the configured port.
    pub fn listen_default(&self) -> Result<SocketAddr> {
        self.listen(self.config.listen_port)
    }

    /// Stops listening and closes every connection created under `local_id`.
    pub fn shutdown(&self, local_id: PeerId) {
        self.listener.stop_listening();
        let connections = self.registry.connections_for_local_identity(local_id);
        let count = connections.len();
        for connection in connections {
            connection.close();
        }
        info!(peer = %local_id, closed = count, "Transport shut down");
    }

    /// Shuts down everything this transport owns.
    pub fn close(&self) {
        self.shutdown(self.local.id());
        self.registry.close_all();
    }

    pub fn identity(&self) -> Arc<ChannelIdentity> {
        self.local.current()
    }

    pub fn local_id(&self) -> PeerId {
        self.local.id()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Distinct keyed connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.connections()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_port()
    }

    pub fn advertised_addresses(&self) -> Option<Vec<String>> {
        self.listener.advertised_addresses(self.local.id())
    }
}

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        self.close();
    }
}
