//! Listening socket and accept loop.

use std::io;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use duplex_common::{PeerId, Result, TransportConfig, TransportError};
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::handshake::LocalIdentity;
use crate::pump::{self, FrameHandler};
use crate::registry::{ConnectionRegistry, RegisterOutcome};

/// Documentation-range targets used to discover the outbound interface.
/// Connecting a UDP socket sends nothing.
const PROBE_V4: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
const PROBE_V6: IpAddr = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

/// Timeout of the self-connection that wakes a blocked accept loop where
/// shutting the listening socket down does not.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

struct ListenerBinding {
    local_addr: SocketAddr,
    /// Handle on the socket the accept loop blocks on
    socket: TcpListener,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

/// Owns the listening socket of one transport.
///
/// Accepted sockets are handshaken, registered and pumped on their own
/// threads; the accept loop only hands them off. The listener owns no
/// connections: stopping it leaves accepted connections running.
pub struct ListenerManager {
    registry: ConnectionRegistry,
    handler: Arc<dyn FrameHandler>,
    local: LocalIdentity,
    config: TransportConfig,
    binding: Mutex<Option<ListenerBinding>>,
}

impl ListenerManager {
    pub fn new(
        registry: ConnectionRegistry,
        handler: Arc<dyn FrameHandler>,
        local: LocalIdentity,
        config: TransportConfig,
    ) -> Self {
        Self {
            registry,
            handler,
            local,
            config,
            binding: Mutex::new(None),
        }
    }

    /// Binds `listen_host:port` and starts the accept loop.
    ///
    /// Port 0 lets the OS choose; the bound address is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if this listener is already
    /// bound or the address cannot be bound.
    pub fn start_listening(&self, port: u16) -> Result<SocketAddr> {
        let mut binding = self.binding.lock();
        if let Some(existing) = binding.as_ref() {
            return Err(TransportError::Configuration(format!(
                "Already listening on {}",
                existing.local_addr
            )));
        }

        let host: IpAddr = self.config.listen_host.parse().map_err(|e| {
            TransportError::Configuration(format!(
                "Invalid listen host '{}': {}",
                self.config.listen_host, e
            ))
        })?;
        let listener = TcpListener::bind((host, port)).map_err(|e| {
            TransportError::Configuration(format!("Failed to bind to {}:{}: {}", host, port, e))
        })?;
        let local_addr = listener.local_addr()?;
        let socket = listener.try_clone()?;

        let running = Arc::new(AtomicBool::new(true));
        let accept_loop = AcceptLoop {
            registry: self.registry.clone(),
            handler: self.handler.clone(),
            local: self.local.clone(),
            config: self.config.clone(),
            running: running.clone(),
        };
        let accept_thread = thread::Builder::new()
            .name(format!("duplex-accept-{}", local_addr.port()))
            .spawn(move || accept_loop.run(listener))?;

        info!(address = %local_addr, "Listening");
        *binding = Some(ListenerBinding {
            local_addr,
            socket,
            running,
            accept_thread: Some(accept_thread),
        });
        Ok(local_addr)
    }

    /// Closes the listening socket and joins the accept loop.
    ///
    /// Accepted connections are unaffected. Does nothing when not listening.
    pub fn stop_listening(&self) {
        let Some(mut binding) = self.binding.lock().take() else {
            return;
        };
        binding.running.store(false, Ordering::SeqCst);

        let woken = match interrupt_accept(&binding.socket) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    address = %binding.local_addr,
                    error = %e,
                    "Listener shutdown unsupported, connecting instead"
                );
                let wake = wake_address(binding.local_addr);
                match TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(address = %binding.local_addr, error = %e, "Failed to wake accept loop");
                        false
                    }
                }
            }
        };
        if woken {
            if let Some(handle) = binding.accept_thread.take() {
                let _ = handle.join();
            }
        }
        info!(address = %binding.local_addr, "Stopped listening");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.binding.lock().as_ref().map(|b| b.local_addr)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn is_listening(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Addresses peers can reach this listener at, or `None` when not bound.
    pub fn advertised_addresses(&self, local_id: PeerId) -> Option<Vec<String>> {
        self.local_addr()
            .map(|bound| advertised_addresses(bound, local_id))
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

struct AcceptLoop {
    registry: ConnectionRegistry,
    handler: Arc<dyn FrameHandler>,
    local: LocalIdentity,
    config: TransportConfig,
    running: Arc<AtomicBool>,
}

impl AcceptLoop {
    fn run(self, listener: TcpListener) {
        let accept_loop = Arc::new(self);
        for stream in listener.incoming() {
            if !accept_loop.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => accept_loop.dispatch(stream),
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!("Accept loop stopped");
    }

    fn dispatch(self: &Arc<Self>, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!(peer = %peer, "Connection accepted");

        let accept_loop = self.clone();
        let spawned = thread::Builder::new()
            .name("duplex-inbound".to_string())
            .spawn(move || accept_loop.serve(stream, peer));
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn connection thread");
        }
    }

    /// Handshake, registration and receive pump of one inbound socket.
    fn serve(&self, stream: TcpStream, peer: String) {
        let connection = match Connection::accept(stream, &self.local, &self.config) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Inbound handshake failed");
                return;
            }
        };

        match self.registry.register(connection) {
            RegisterOutcome::Created(connection) => {
                pump::run(&connection, self.handler.as_ref());
            }
            RegisterOutcome::FoundExisting(existing) => {
                debug!(peer = %peer, existing = %existing.id(), "Inbound socket merged into existing connection");
            }
        }
    }
}

/// Computes the addresses advertised for a listener bound at `bound`.
///
/// The list holds the bound address (for an unspecified bind, the primary
/// outbound interface of the bound family, falling back to the other family),
/// the loopback address at the same port and finally `local_id` itself.
/// Duplicates are removed keeping the first occurrence.
pub fn advertised_addresses(bound: SocketAddr, local_id: PeerId) -> Vec<String> {
    let port = bound.port();
    let mut hosts = Vec::new();

    if bound.ip().is_unspecified() {
        let (preferred, fallback) = if bound.is_ipv4() {
            (PROBE_V4, PROBE_V6)
        } else {
            (PROBE_V6, PROBE_V4)
        };
        if let Some(ip) = primary_interface(preferred).or_else(|| primary_interface(fallback)) {
            hosts.push(ip);
        }
    } else {
        hosts.push(bound.ip());
    }

    hosts.push(if bound.is_ipv4() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    });

    let mut addresses: Vec<String> = Vec::new();
    let candidates = hosts
        .into_iter()
        .map(|host| SocketAddr::new(host, port).to_string())
        .chain(std::iter::once(local_id.to_string()));
    for candidate in candidates {
        if !addresses.contains(&candidate) {
            addresses.push(candidate);
        }
    }
    addresses
}

fn primary_interface(target: IpAddr) -> Option<IpAddr> {
    let unspecified = match target {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind((unspecified, 0)).ok()?;
    socket.connect((target, 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Shuts the listening socket down, which makes a blocked accept return on
/// Linux without any client connecting.
fn interrupt_accept(listener: &TcpListener) -> io::Result<()> {
    SockRef::from(listener).shutdown(Shutdown::Both)
}

fn wake_address(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_common::Frame;

    fn manager() -> ListenerManager {
        let local = LocalIdentity::generate();
        let config = TransportConfig::default().with_listen_host("127.0.0.1");
        let registry = ConnectionRegistry::new(local.clone(), config.clone());
        let handler: Arc<dyn FrameHandler> =
            Arc::new(|_: &Arc<Connection>, _: Frame| -> Result<()> { Ok(()) });
        ListenerManager::new(registry, handler, local, config)
    }

    #[test]
    fn test_specific_bind_advertises_bound_address_then_loopback_then_id() {
        let id = PeerId::random();
        let bound: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        assert_eq!(
            advertised_addresses(bound, id),
            vec![
                "10.1.2.3:7000".to_string(),
                "127.0.0.1:7000".to_string(),
                id.to_string()
            ]
        );
    }

    #[test]
    fn test_loopback_bind_is_not_duplicated() {
        let id = PeerId::random();
        let bound: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        assert_eq!(
            advertised_addresses(bound, id),
            vec!["127.0.0.1:7001".to_string(), id.to_string()]
        );
    }

    #[test]
    fn test_unspecified_bind_still_advertises_loopback_and_id() {
        let id = PeerId::random();
        let bound: SocketAddr = "0.0.0.0:7002".parse().unwrap();
        let addresses = advertised_addresses(bound, id);
        assert!(addresses.contains(&"127.0.0.1:7002".to_string()));
        assert_eq!(addresses.last(), Some(&id.to_string()));
        assert!(!addresses.iter().any(|a| a.starts_with("0.0.0.0")));
    }

    #[test]
    fn test_listen_twice_is_configuration_error() {
        let manager = manager();
        let bound = manager.start_listening(0).unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(manager.local_port(), Some(bound.port()));

        let again = manager.start_listening(0);
        assert!(matches!(again, Err(TransportError::Configuration(_))));
        manager.stop_listening();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shutdown_wakes_blocked_accept_without_a_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let handle = listener.try_clone().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(listener.accept().is_err());
        });
        thread::sleep(Duration::from_millis(50));

        interrupt_accept(&handle).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
    }

    #[test]
    fn test_stop_listening_releases_port() {
        let manager = manager();
        let bound = manager.start_listening(0).unwrap();
        manager.stop_listening();
        assert!(!manager.is_listening());
        assert!(TcpStream::connect_timeout(&bound, Duration::from_millis(200)).is_err());

        // Can listen again afterwards
        manager.start_listening(0).unwrap();
    }
}
