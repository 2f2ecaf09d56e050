//! TCP server accepting line-protocol clients.
//!
//! Binds the listener, accepts connections and spawns one independent
//! session task per client. Sessions share nothing; a failing session never
//! affects the accept loop or other clients.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::session::{Session, SessionConfig};
use crate::transcript::Transcript;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Pending connection backlog for the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept so persistent errors (e.g. EMFILE) don't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Settings every connection task needs.
struct Shared {
    session: SessionConfig,
    transcript_dir: PathBuf,
    clock: SharedClock,
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(config: &Config, clock: SharedClock) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(config.listen_addr())?)?;

        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                session: config.session(),
                transcript_dir: config.transcript_dir.clone(),
                clock,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!(
                address = %addr,
                timeout_secs = self.shared.session.idle_timeout.as_secs(),
                "Server listening"
            );
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, &shared).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: &Shared) {
    info!(peer = %addr, "Client connected");

    let transcript = match Transcript::open(&shared.transcript_dir, addr.ip()).await {
        Ok(transcript) => transcript,
        Err(e) => {
            error!(peer = %addr, error = %e, "Failed to open transcript");
            return;
        }
    };

    let session = Session::new(
        stream,
        addr,
        transcript,
        Arc::clone(&shared.clock),
        shared.session.clone(),
    );
    match session.run().await {
        Ok(reason) => info!(peer = %addr, %reason, "Client disconnected"),
        Err(e) => warn!(peer = %addr, error = %e, "Client disconnected"),
    }
}

/// Create a nonblocking TCP listener with SO_REUSEADDR so restarts can
/// rebind while old connections sit in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
