//! Port: a router-to-router link.
//!
//! A port wraps a [`PortTransport`] and runs the attachment handshake on
//! top of it. The accepting (downstream) side delegates a sub-network to
//! its peer with a DHCP-OFFER as soon as the link is up; the dialing
//! (upstream) side waits for that offer, adopts the addressing and hands
//! itself to the router as the upstream route.
//!
//! ```text
//! UNINITIALIZED --init_upstream--> UPSTREAM_UNBOUND --offer--> UPSTREAM_BOUND
//!       |                                  |                       |
//!       |                               (bad offer)         router accepted
//!       |                                  v                       v
//!       |                            UPSTREAM_DEAD <--lost-- UPSTREAM_CONNECTED
//!       |
//!       +--init_downstream--> DOWNSTREAM_UNCONNECTED <--lost--+
//!                                  |                          |
//!                              connected --> DOWNSTREAM_CONNECTED
//! ```


use crate::packet::{Packet, PacketType};
use crate::protocol::{DhcpOffer, ProtocolError};
use crate::router::{DownstreamLease, Router, RouterError, UpstreamBinding};
use crate::transport::{PortTransport, TransportError};
use crate::utils::lock;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Errors related to port operations.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("operation not allowed in state {0}")]
    InvalidState(PortState),

    #[error("upstream handshake failed")]
    HandshakeFailed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

/// Router-assigned port identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// Port lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    /// Initial state, and the state after `finish`.
    Uninitialized,
    /// Waiting for the peer's DHCP offer.
    UpstreamUnbound,
    /// Offer adopted, router attachment in progress.
    UpstreamBound,
    UpstreamConnected,
    /// Link lost or handshake failed. Only `finish` leaves this state.
    UpstreamDead,
    /// Waiting for a peer.
    DownstreamUnconnected,
    DownstreamConnected,
}

impl PortState {
    /// Check if packets may be sent in this state.
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            PortState::UpstreamBound | PortState::UpstreamConnected | PortState::DownstreamConnected
        )
    }

    /// Check if the port is attached to its router.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            PortState::UpstreamConnected | PortState::DownstreamConnected
        )
    }

    /// Check if this is an upstream-side state.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            PortState::UpstreamUnbound
                | PortState::UpstreamBound
                | PortState::UpstreamConnected
                | PortState::UpstreamDead
        )
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortState::Uninitialized => "uninitialized",
            PortState::UpstreamUnbound => "upstream-unbound",
            PortState::UpstreamBound => "upstream-bound",
            PortState::UpstreamConnected => "upstream-connected",
            PortState::UpstreamDead => "upstream-dead",
            PortState::DownstreamUnconnected => "downstream-unconnected",
            PortState::DownstreamConnected => "downstream-connected",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Port Statistics
// ============================================================================

/// Traffic counters for a port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Total packets sent.
    pub packets_sent: u64,
    /// Total packets received.
    pub packets_recv: u64,
    /// Total payload bytes sent.
    pub bytes_sent: u64,
    /// Total payload bytes received.
    pub bytes_recv: u64,
    /// Packets refused by state or transport.
    pub send_failures: u64,
}

impl PortStats {
    /// Record a sent packet.
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a received packet.
    pub fn record_recv(&mut self, bytes: usize) {
        self.packets_recv += 1;
        self.bytes_recv += bytes as u64;
    }
}

// ============================================================================
// Port
// ============================================================================

enum Handshake {
    Bound(UpstreamBinding),
    Dead,
}

struct PortInner {
    state: PortState,
    /// Transport started and not yet stopped.
    running: bool,
    lease: Option<DownstreamLease>,
    binding: Option<UpstreamBinding>,
    handshake: Option<oneshot::Sender<Handshake>>,
    stats: PortStats,
}

/// A link to a neighbouring router.
pub struct Port {
    id: PortId,
    router: Arc<Router>,
    transport: Box<dyn PortTransport>,
    inner: Mutex<PortInner>,
    me: Weak<Port>,
}

impl Port {
    /// Create an uninitialized port over `transport`.
    pub fn new(router: Arc<Router>, transport: impl PortTransport) -> Arc<Self> {
        let id = router.next_port_id();
        Arc::new_cyclic(|me| Self {
            id,
            router,
            transport: Box::new(transport),
            inner: Mutex::new(PortInner {
                state: PortState::Uninitialized,
                running: false,
                lease: None,
                binding: None,
                handshake: None,
                stats: PortStats::default(),
            }),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn state(&self) -> PortState {
        lock(&self.inner).state
    }

    pub fn stats(&self) -> PortStats {
        lock(&self.inner).stats
    }

    /// Network delegated to the peer, for a connected downstream port.
    pub fn lease(&self) -> Option<DownstreamLease> {
        lock(&self.inner).lease.clone()
    }

    /// Addressing adopted from the peer, for a bound upstream port.
    pub fn binding(&self) -> Option<UpstreamBinding> {
        lock(&self.inner).binding
    }

    fn link(&self) -> PortLink {
        PortLink {
            port: self.me.clone(),
        }
    }

    fn arc(&self) -> Option<Arc<Port>> {
        self.me.upgrade()
    }

    /// Start as the accepting side and wait for a peer.
    pub async fn init_downstream(&self) -> Result<(), PortError> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != PortState::Uninitialized {
                return Err(PortError::InvalidState(inner.state));
            }
            inner.state = PortState::DownstreamUnconnected;
            inner.running = true;
        }

        if let Err(e) = self.transport.start(self.link()).await {
            let mut inner = lock(&self.inner);
            inner.state = PortState::Uninitialized;
            inner.running = false;
            return Err(e.into());
        }
        debug!(port = %self.id, transport = %self.transport.describe(), "Downstream port started");
        Ok(())
    }

    /// Start as the dialing side and attach to the router as its upstream.
    ///
    /// Completes once the offer is adopted and the router (including the
    /// name server role change for `sub_domain`) accepted the port. Any
    /// failure tears the port down to `Uninitialized`.
    pub async fn init_upstream(&self, sub_domain: &str) -> Result<(), PortError> {
        let handshake = {
            let mut inner = lock(&self.inner);
            if inner.state != PortState::Uninitialized {
                return Err(PortError::InvalidState(inner.state));
            }
            let (tx, rx) = oneshot::channel();
            inner.state = PortState::UpstreamUnbound;
            inner.running = true;
            inner.handshake = Some(tx);
            rx
        };

        if let Err(e) = self.transport.start(self.link()).await {
            self.finish().await;
            return Err(e.into());
        }

        let binding = match handshake.await {
            Ok(Handshake::Bound(binding)) => binding,
            Ok(Handshake::Dead) | Err(_) => {
                self.finish().await;
                return Err(PortError::HandshakeFailed);
            }
        };

        let Some(me) = self.arc() else {
            return Err(PortError::HandshakeFailed);
        };
        if let Err(e) = self.router.add_upstream_port(me, binding, sub_domain).await {
            self.finish().await;
            return Err(e.into());
        }

        let attached = {
            let mut inner = lock(&self.inner);
            let bound = inner.state == PortState::UpstreamBound;
            if bound {
                inner.state = PortState::UpstreamConnected;
            }
            bound
        };
        if !attached {
            // Link dropped while the router was attaching us.
            self.finish().await;
            return Err(PortError::HandshakeFailed);
        }
        info!(
            port = %self.id,
            net_addr = %binding.net_addr,
            prefix_len = binding.prefix_len,
            "Upstream port connected"
        );
        Ok(())
    }

    /// Stop the transport and detach from the router. Idempotent.
    pub async fn finish(&self) {
        let pending = {
            let mut inner = lock(&self.inner);
            if !inner.running {
                inner.state = PortState::Uninitialized;
                return;
            }
            inner.running = false;
            inner.handshake.take()
        };
        if let Some(tx) = pending {
            let _ = tx.send(Handshake::Dead);
        }

        self.transport.stop().await;
        self.router.del_port(self.id);

        let mut inner = lock(&self.inner);
        inner.state = PortState::Uninitialized;
        inner.lease = None;
        inner.binding = None;
        debug!(port = %self.id, "Port finished");
    }

    /// Send a packet to the peer. Returns false if refused.
    pub fn send_packet(&self, packet: Packet) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.state.can_send() {
            inner.stats.send_failures += 1;
            trace!(port = %self.id, state = %inner.state, "Send refused");
            return false;
        }
        let len = packet.payload_len();
        match self.transport.transmit(packet) {
            Ok(()) => {
                inner.stats.record_sent(len);
                true
            }
            Err(e) => {
                inner.stats.send_failures += 1;
                debug!(port = %self.id, error = %e, "Transmit failed");
                false
            }
        }
    }

    // === Link events ===

    /// The transport link is usable.
    ///
    /// The downstream side allocates a lease, announces it with a DHCP
    /// offer and registers the port with the router. Returns false if the
    /// link should be dropped.
    pub fn connected(&self) -> bool {
        let state = self.state();
        match state {
            PortState::DownstreamUnconnected => self.offer_lease(),
            PortState::UpstreamUnbound => true,
            other => {
                warn!(port = %self.id, state = %other, "Unexpected link up");
                false
            }
        }
    }

    fn offer_lease(&self) -> bool {
        let lease = match self.router.allocate_downstream_addr() {
            Ok(lease) => lease,
            Err(e) => {
                warn!(port = %self.id, error = %e, "Cannot delegate a subnet to peer");
                return false;
            }
        };
        let Some(me) = self.arc() else {
            self.router.free_downstream_addr(&lease);
            return false;
        };

        {
            let mut inner = lock(&self.inner);
            inner.state = PortState::DownstreamConnected;
            inner.lease = Some(lease.clone());
        }
        let offer = Packet::new(
            PacketType::DhcpOffer,
            self.router.own_host(),
            lease.address,
            0,
            lease.offer().encode(),
        );
        if !self.send_packet(offer) {
            let mut inner = lock(&self.inner);
            inner.state = PortState::DownstreamUnconnected;
            inner.lease = None;
            drop(inner);
            self.router.free_downstream_addr(&lease);
            return false;
        }

        self.router.add_downstream_port(me, &lease);
        true
    }

    /// The peer went away.
    pub fn disconnected(&self) {
        let (state, pending) = {
            let mut inner = lock(&self.inner);
            (inner.state, inner.handshake.take())
        };
        match state {
            PortState::UpstreamUnbound => {
                self.set_state(PortState::UpstreamDead);
                if let Some(tx) = pending {
                    let _ = tx.send(Handshake::Dead);
                }
            }
            PortState::UpstreamBound | PortState::UpstreamConnected => {
                self.router.del_port(self.id);
                self.set_state(PortState::UpstreamDead);
                info!(port = %self.id, "Upstream link lost");
            }
            PortState::DownstreamConnected => {
                self.router.del_port(self.id);
                let mut inner = lock(&self.inner);
                inner.state = PortState::DownstreamUnconnected;
                inner.lease = None;
                info!(port = %self.id, "Downstream peer disconnected");
            }
            _ => {}
        }
    }

    /// A packet arrived from the peer.
    pub fn received_packet(&self, packet: Packet) {
        let state = {
            let mut inner = lock(&self.inner);
            inner.stats.record_recv(packet.payload_len());
            inner.state
        };

        match (state, packet.packet_type()) {
            (_, PacketType::OutOfBand(code)) => {
                trace!(port = %self.id, code, "Ignoring out-of-band packet");
            }
            (PortState::UpstreamUnbound, PacketType::DhcpOffer) => self.adopt_offer(&packet),
            (PortState::UpstreamUnbound, other) => {
                self.protocol_violation(&format!("{} before DHCP offer", other));
            }
            (_, PacketType::DhcpOffer) => {
                self.protocol_violation("unexpected DHCP offer");
            }
            (PortState::UpstreamBound | PortState::UpstreamConnected | PortState::DownstreamConnected, _) => {
                self.router.route_packet(packet, Some(self.id));
            }
            (other, packet_type) => {
                debug!(port = %self.id, state = %other, packet_type = %packet_type, "Dropping packet");
            }
        }
    }

    fn adopt_offer(&self, packet: &Packet) {
        let offer = match DhcpOffer::decode(packet.payload()) {
            Ok(offer) => offer,
            Err(e) => {
                self.reject_offer(e);
                return;
            }
        };
        let binding = UpstreamBinding::from_offer(&offer);
        let pending = {
            let mut inner = lock(&self.inner);
            inner.state = PortState::UpstreamBound;
            inner.binding = Some(binding);
            inner.handshake.take()
        };
        debug!(port = %self.id, address = %offer.address, prefix_len = offer.prefix_len, "Received DHCP offer");
        if let Some(tx) = pending {
            let _ = tx.send(Handshake::Bound(binding));
        }
    }

    fn reject_offer(&self, error: ProtocolError) {
        warn!(port = %self.id, error = %error, "Invalid DHCP offer");
        self.protocol_violation("invalid DHCP offer");
    }

    /// Treat the connection as lost.
    fn protocol_violation(&self, what: &str) {
        warn!(port = %self.id, violation = what, "Protocol violation, dropping link");
        self.disconnected();
    }

    fn set_state(&self, state: PortState) {
        lock(&self.inner).state = state;
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Link handle
// ============================================================================

/// Link event sink handed to a transport.
///
/// Holds the port weakly; events for a dropped port are ignored.
#[derive(Clone)]
pub struct PortLink {
    port: Weak<Port>,
}

impl PortLink {
    /// See [`Port::connected`].
    pub fn connected(&self) -> bool {
        self.port.upgrade().is_some_and(|port| port.connected())
    }

    /// See [`Port::disconnected`].
    pub fn disconnected(&self) {
        if let Some(port) = self.port.upgrade() {
            port.disconnected();
        }
    }

    /// See [`Port::received_packet`].
    pub fn received_packet(&self, packet: Packet) {
        if let Some(port) = self.port.upgrade() {
            port.received_packet(packet);
        }
    }
}
