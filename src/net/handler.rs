//! Connection handler module
//!
//! Handles the lifecycle of client connections including:
//! - Initial connection setup (TCP or WebSocket)
//! - Session registration and the outbound writer task
//! - The read loop, with idle timeout and close requests
//! - Teardown once the loop ends, whatever the reason

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, RealmError, Result};
use crate::net::dispatcher::{Flow, SessionDispatcher};
use crate::net::session::Session;
use crate::net::transport::{run_writer, FrameReader, UnifiedTransport};
use crate::AppState;

/// How long teardown waits for queued frames to reach the socket
const WRITER_DRAIN_SECS: u64 = 5;

/// Connection handler for processing client connections
pub struct ConnectionHandler {
    state: Arc<AppState>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Handle a TCP connection (native client)
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling TCP connection");
        stream.set_nodelay(true)?;
        self.handle_connection(UnifiedTransport::tcp(stream), addr)
            .await
    }

    /// Handle a WebSocket connection (browser client)
    pub async fn handle_websocket(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling WebSocket connection");
        stream.set_nodelay(true)?;
        let transport = UnifiedTransport::accept_websocket(stream).await?;
        info!(address = %addr, "WebSocket connection established");
        self.handle_connection(transport, addr).await
    }

    /// Run a connection from registration to teardown
    pub async fn handle_connection(
        &self,
        transport: UnifiedTransport,
        addr: SocketAddr,
    ) -> Result<()> {
        let (session, outbound_rx) = self
            .state
            .sessions
            .create_session(addr, transport.is_websocket())?;
        let session_id = session.id;

        let (mut reader, writer) = transport.split(self.state.config.net.max_frame_size);
        let writer_task = tokio::spawn(run_writer(writer, outbound_rx));

        debug!(
            session_id = session_id,
            address = %addr,
            "Starting connection handler"
        );

        let dispatcher = SessionDispatcher::new(self.state.clone(), session.clone());
        let result = self.read_loop(&mut reader, &dispatcher, &session).await;

        debug!(session_id = session_id, "Connection handler ending");
        dispatcher.teardown().await;

        // The writer finishes once the last queue sender (held by the session) is gone
        drop(dispatcher);
        drop(session);
        if timeout(Duration::from_secs(WRITER_DRAIN_SECS), writer_task)
            .await
            .is_err()
        {
            warn!(session_id = session_id, "Writer did not drain in time");
        }

        info!(session_id = session_id, address = %addr, "Connection closed");
        result
    }

    async fn read_loop(
        &self,
        reader: &mut FrameReader,
        dispatcher: &SessionDispatcher,
        session: &Session,
    ) -> Result<()> {
        let idle = Duration::from_secs(self.state.config.net.idle_timeout_secs);

        loop {
            let frame = tokio::select! {
                read = timeout(idle, reader.read_frame()) => match read {
                    Ok(Ok(Some(frame))) => frame,
                    Ok(Ok(None)) => {
                        debug!(session_id = session.id, "Connection closed by peer");
                        return Ok(());
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        info!(session_id = session.id, "Session idle timeout");
                        return Err(RealmError::Network(NetworkError::Timeout));
                    }
                },
                _ = session.closed() => {
                    debug!(session_id = session.id, "Close requested");
                    return Ok(());
                }
            };

            session.touch();
            if dispatcher.handle_frame(&frame).await == Flow::Close {
                return Ok(());
            }
        }
    }
}
