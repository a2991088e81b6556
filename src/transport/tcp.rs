//! TCP Transport Implementation
//!
//! Carries framed packets over a TCP stream. An outbound transport dials
//! its peer when started (upstream side); an accepted transport wraps a
//! stream handed over by [`TcpListenerService`] (downstream side).

use super::{PortTransport, TransportError, TransportState};
use crate::packet::Packet;
use crate::port::{Port, PortId, PortLink};
use crate::protocol::{encode_frame, FrameDecoder, MAX_PAYLOAD};
use crate::router::Router;
use crate::utils::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read buffer size for the receive loop.
const READ_BUF_SIZE: usize = 64 * 1024;

enum Endpoint {
    /// Dial this address on start.
    Connect(String),
    /// Already-accepted stream, consumed on start.
    Accepted(Option<TcpStream>),
}

struct TcpState {
    state: TransportState,
    endpoint: Endpoint,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
    remote_addr: Option<SocketAddr>,
}

/// TCP transport for one port.
pub struct TcpTransport {
    inner: Mutex<TcpState>,
    closed: Arc<Notify>,
}

impl TcpTransport {
    /// Transport that dials `addr` when started.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::with_endpoint(Endpoint::Connect(addr.into()))
    }

    /// Transport over an accepted stream.
    pub fn accepted(stream: TcpStream) -> Self {
        Self::with_endpoint(Endpoint::Accepted(Some(stream)))
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            inner: Mutex::new(TcpState {
                state: TransportState::Configured,
                endpoint,
                writer: None,
                tasks: Vec::new(),
                remote_addr: None,
            }),
            closed: Arc::new(Notify::new()),
        }
    }

    /// Signalled once when the peer closes the stream.
    pub fn closed_signal(&self) -> Arc<Notify> {
        self.closed.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        lock(&self.inner).state
    }

    /// Remote address, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner).remote_addr
    }
}

#[async_trait]
impl PortTransport for TcpTransport {
    fn describe(&self) -> String {
        let inner = lock(&self.inner);
        match (&inner.endpoint, inner.remote_addr) {
            (_, Some(addr)) => format!("tcp/{}", addr),
            (Endpoint::Connect(addr), None) => format!("tcp/{}", addr),
            (Endpoint::Accepted(_), None) => "tcp/accepted".to_string(),
        }
    }

    async fn start(&self, link: PortLink) -> Result<(), TransportError> {
        let pending = {
            let mut inner = lock(&self.inner);
            if !inner.state.can_start() {
                return Err(TransportError::AlreadyStarted);
            }
            match &mut inner.endpoint {
                Endpoint::Connect(addr) => Err(addr.clone()),
                Endpoint::Accepted(stream) => {
                    Ok(stream.take().ok_or(TransportError::AlreadyStarted)?)
                }
            }
        };

        let stream = match pending {
            Ok(stream) => stream,
            Err(addr) => TcpStream::connect(&addr)
                .await
                .map_err(|e| TransportError::StartFailed(format!("connect {}: {}", addr, e)))?,
        };
        let _ = stream.set_nodelay(true);
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(tcp_write_loop(writer, rx));

        // The link may transmit from its first callback.
        let mut inner = lock(&self.inner);
        inner.state = TransportState::Up;
        inner.writer = Some(tx);
        inner.remote_addr = remote_addr;
        let read_task = tokio::spawn(tcp_read_loop(reader, link, self.closed.clone()));
        inner.tasks = vec![read_task, write_task];

        if let Some(addr) = remote_addr {
            info!(remote_addr = %addr, "TCP transport started");
        }
        Ok(())
    }

    async fn stop(&self) {
        let tasks = {
            let mut inner = lock(&self.inner);
            if !inner.state.is_operational() {
                return;
            }
            inner.state = TransportState::Down;
            inner.writer = None;
            std::mem::take(&mut inner.tasks)
        };
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        debug!("TCP transport stopped");
    }

    fn transmit(&self, packet: Packet) -> Result<(), TransportError> {
        // The peer drops the stream on a frame it cannot accept.
        if packet.payload_len() > MAX_PAYLOAD {
            return Err(TransportError::PacketTooLarge {
                max: MAX_PAYLOAD,
                got: packet.payload_len(),
            });
        }
        let inner = lock(&self.inner);
        let writer = inner.writer.as_ref().ok_or(TransportError::NotStarted)?;
        writer
            .send(encode_frame(&packet))
            .map_err(|_| TransportError::SendFailed("connection closed".into()))
    }
}

/// Receive loop: deframe packets and hand them to the port.
async fn tcp_read_loop(mut reader: OwnedReadHalf, link: PortLink, closed: Arc<Notify>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    if !link.connected() {
        closed.notify_one();
        return;
    }

    'outer: loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_packet() {
                        Ok(Some(packet)) => link.received_packet(packet),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Invalid frame, dropping connection");
                            break 'outer;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "TCP receive error");
                break;
            }
        }
    }

    link.disconnected();
    closed.notify_one();
}

/// Send loop: write queued frames in order.
async fn tcp_write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "TCP send error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ============================================================================
// Listener
// ============================================================================

/// Downstream ports served by a listener.
type PeerTable = Arc<Mutex<HashMap<PortId, Arc<Port>>>>;

/// Accepts TCP connections and serves each as a downstream port.
pub struct TcpListenerService {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
    peers: PeerTable,
    stop: watch::Sender<bool>,
}

impl TcpListenerService {
    /// Bind `addr` and start accepting peers for `router`.
    pub async fn bind(addr: &str, router: Arc<Router>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::StartFailed(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!(local_addr = %local_addr, "TCP listener started");

        let peers = PeerTable::default();
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, router, peers.clone(), stopped));
        Ok(Self {
            local_addr,
            task,
            peers,
            stop,
        })
    }

    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of downstream ports currently served.
    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Stop accepting and finish every downstream port of this listener.
    pub async fn shutdown(&self) {
        self.task.abort();
        self.stop.send_replace(true);
        let peers: Vec<Arc<Port>> = lock(&self.peers).drain().map(|(_, port)| port).collect();
        let count = peers.len();
        for port in peers {
            port.finish().await;
        }
        info!(local_addr = %self.local_addr, peers = count, "TCP listener stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    peers: PeerTable,
    stopped: watch::Receiver<bool>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                continue;
            }
        };
        debug!(remote_addr = %remote_addr, "Accepted TCP peer");

        let transport = TcpTransport::accepted(stream);
        let closed = transport.closed_signal();
        let port = Port::new(router.clone(), transport);
        lock(&peers).insert(port.id(), port.clone());

        let peers = peers.clone();
        let mut stopped = stopped.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = serve_peer(&port, closed, remote_addr) => {}
                // The listener finishes its ports itself.
                _ = stopped.wait_for(|stop| *stop) => return,
            }
            port.finish().await;
            lock(&peers).remove(&port.id());
            debug!(remote_addr = %remote_addr, "Downstream port closed");
        });
    }
}

/// Run a downstream port until its peer closes the stream.
async fn serve_peer(port: &Port, closed: Arc<Notify>, remote_addr: SocketAddr) {
    if let Err(e) = port.init_downstream().await {
        warn!(remote_addr = %remote_addr, error = %e, "Failed to start downstream port");
        return;
    }
    closed.notified().await;
}
