//! Receive loop forwarding inbound frames to the upper layer.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use duplex_common::{Frame, Result, TransportError};
use tracing::{debug, warn};

use crate::connection::{Connection, Role};

/// Callback invoked for every frame received on any connection of a
/// transport.
///
/// Returning an error is treated as connection loss: the connection is closed
/// and its pump stops.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) -> Result<()>;
}

impl<F> FrameHandler for F
where
    F: Fn(&Arc<Connection>, Frame) -> Result<()> + Send + Sync + 'static,
{
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) -> Result<()> {
        self(connection, frame)
    }
}

/// Starts the receive pump of `connection` on its own thread.
pub fn spawn(
    connection: Arc<Connection>,
    handler: Arc<dyn FrameHandler>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("duplex-pump-{}", connection.id()))
        .spawn(move || run(&connection, handler.as_ref()))
}

/// Delivers frames in wire order until the connection closes.
///
/// A client connection that loses its socket keeps pumping: the next receive
/// reconnects it, and the connection closes itself once reconnecting is
/// exhausted. A server connection is closed on the first socket error.
pub fn run(connection: &Arc<Connection>, handler: &dyn FrameHandler) {
    debug!(connection = %connection.id(), "Receive pump started");

    loop {
        match connection.receive_frame() {
            Ok(frame) => {
                if let Err(e) = handler.on_frame(connection, frame) {
                    warn!(
                        connection = %connection.id(),
                        error = %e,
                        "Frame handler failed, closing connection"
                    );
                    connection.close();
                    break;
                }
            }
            Err(TransportError::Closed) => break,
            Err(e) if connection.role() == Role::Client && !connection.is_closed() => {
                debug!(connection = %connection.id(), error = %e, "Receive failed, will reconnect");
            }
            Err(e) => {
                debug!(connection = %connection.id(), error = %e, "Receive failed, closing");
                connection.close();
                break;
            }
        }
    }

    debug!(connection = %connection.id(), "Receive pump stopped");
}
