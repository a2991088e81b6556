//! Router
//!
//! Every process hosts one router. It owns the interface address space of
//! its host, the table of local mailboxes, the ports to neighbouring
//! routers and the multicast groups used for broadcasting and death
//! notification.
//!
//! ## Locking
//!
//! All tables live behind a single mutex. Operations compute their side
//! effects (packets for ports, deliveries to mailboxes) under the lock and
//! run them after it is released, so a port or queue may call back into
//! the router from inside a delivery.
//!
//! ## Addressing
//!
//! A router owns the network `net_addr/prefix_len` (the whole space for a
//! root router). Its own host address is `net_addr | INTERFACE_BIT`, and
//! each downstream port is delegated a sub-network carved from the bits
//! just below the prefix.

mod multicast;
mod ports;
#[cfg(test)]
mod tests;

pub use ports::{DownstreamLease, UpstreamBinding};

use crate::address::{network_mask, IfcAddr, INTERFACE_ADDR_SIZE, INTERFACE_BIT};
use crate::config::RouterConfig;
use crate::nameserver::{NameServer, NameServerError};
use crate::packet::{Packet, PacketType};
use crate::port::{Port, PortId};
use crate::utils::{lock, SequenceAllocator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors related to router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("interface address space exhausted")]
    AddressSpaceExhausted,

    #[error("downstream ports are disabled (subnet prefix length is 0)")]
    DownstreamDisabled,

    #[error("no free subnet for a downstream port")]
    SubnetSpaceExhausted,

    #[error("invalid subnet prefix length: {0}")]
    InvalidSubnetPrefix(u8),

    #[error("subnets are allocated")]
    SubnetsAllocated,

    #[error("an upstream port is already attached")]
    UpstreamExists,

    #[error("name server unavailable")]
    NameServerUnavailable,

    #[error("name server error: {0}")]
    NameServer(#[from] NameServerError),
}

/// Packet sink for a local interface address.
///
/// Implemented by mailbox queues; the router keeps only weak references.
pub trait Mailbox: Send + Sync {
    /// Decode and enqueue a packet addressed to one of the queue's
    /// interfaces. Returns false if the packet was dropped.
    fn push_packet(&self, packet: Packet, multicast: bool) -> bool;

    /// The interface `dead` that `receiver` was attached to went away.
    fn push_death(&self, receiver: IfcAddr, dead: IfcAddr);
}

/// Router traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Packets delivered to local mailboxes.
    pub delivered_local: u64,
    /// Packets handed to ports.
    pub forwarded: u64,
    /// Packets with no route or no receiver.
    pub dropped: u64,
    /// Extra copies made by multicast fan-out.
    pub multicast_copies: u64,
    /// Multicast groups whose publisher died.
    pub deaths: u64,
}

/// Egress decision for a destination address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    /// Local interface (already stripped of the host part).
    Local(IfcAddr),
    /// Forward through this port.
    Port(PortId),
    Unroutable,
}

/// Side effect computed under the lock, executed after it.
pub(crate) enum Dispatch {
    Send {
        port: Arc<Port>,
        packet: Packet,
    },
    Deliver {
        to: Arc<dyn Mailbox>,
        packet: Packet,
        multicast: bool,
    },
    Death {
        to: Arc<dyn Mailbox>,
        receiver: IfcAddr,
        dead: IfcAddr,
    },
}

/// Multicast group keyed by a local publisher or a stub address.
#[derive(Debug)]
pub(crate) struct Group {
    pub(crate) receivers: Vec<IfcAddr>,
    pub(crate) alive: bool,
}

pub(crate) struct PortEntry {
    pub(crate) port: Arc<Port>,
    /// Delegated network, for downstream ports.
    pub(crate) lease: Option<DownstreamLease>,
}

pub(crate) struct RouterState {
    pub(crate) net_addr: IfcAddr,
    pub(crate) prefix_len: u8,
    /// Interface part of the local name server's address.
    pub(crate) ns_addr: IfcAddr,
    pub(crate) interfaces: SequenceAllocator,
    pub(crate) local: HashMap<IfcAddr, Weak<dyn Mailbox>>,
    pub(crate) ports: HashMap<PortId, PortEntry>,
    pub(crate) upstream: Option<PortId>,
    pub(crate) subnet_prefix_len: u8,
    pub(crate) subnets: SequenceAllocator,
    pub(crate) groups: HashMap<IfcAddr, Group>,
    /// Remote publisher -> local stub.
    pub(crate) stubs: HashMap<IfcAddr, IfcAddr>,
    /// Local stub -> remote publisher.
    pub(crate) stub_publishers: HashMap<IfcAddr, IfcAddr>,
    pub(crate) stats: RouterStats,
}

fn subnet_allocator(hop: u8) -> SequenceAllocator {
    // Sequence 0 would alias the parent's own network.
    SequenceAllocator::new(1, 1u64 << hop)
}

impl RouterState {
    fn new(subnet_prefix_len: u8) -> Self {
        Self {
            net_addr: IfcAddr::LOOPBACK,
            prefix_len: 0,
            ns_addr: IfcAddr::LOOPBACK,
            interfaces: SequenceAllocator::new(1, 1u64 << INTERFACE_ADDR_SIZE),
            local: HashMap::new(),
            ports: HashMap::new(),
            upstream: None,
            subnet_prefix_len,
            subnets: subnet_allocator(subnet_prefix_len),
            groups: HashMap::new(),
            stubs: HashMap::new(),
            stub_publishers: HashMap::new(),
            stats: RouterStats::default(),
        }
    }

    pub(crate) fn own_host(&self) -> IfcAddr {
        IfcAddr::new(self.net_addr.as_u64() | INTERFACE_BIT)
    }

    /// Attach the host part to a local address.
    pub(crate) fn global(&self, addr: IfcAddr) -> IfcAddr {
        if addr.is_local() {
            IfcAddr::compose(self.own_host(), addr.as_u64())
        } else {
            addr
        }
    }

    /// Strip the host part from an address of this host.
    pub(crate) fn localize(&self, addr: IfcAddr) -> IfcAddr {
        if addr.is_host(self.own_host()) {
            addr.interface()
        } else {
            addr
        }
    }

    pub(crate) fn resolve(&self, dest: IfcAddr) -> Route {
        if dest.is_local() {
            return Route::Local(dest);
        }
        if dest.is_host(self.own_host()) {
            return Route::Local(dest.interface());
        }
        for (id, entry) in &self.ports {
            if let Some(lease) = &entry.lease
                && dest.is_on_network(lease.address, network_mask(lease.prefix_len))
            {
                return Route::Port(*id);
            }
        }
        if let Some(up) = self.upstream
            && !dest.is_on_network(self.net_addr, network_mask(self.prefix_len))
        {
            return Route::Port(up);
        }
        Route::Unroutable
    }

    pub(crate) fn mailbox(&self, addr: IfcAddr) -> Option<Arc<dyn Mailbox>> {
        self.local.get(&addr).and_then(Weak::upgrade)
    }

    /// Prepare a packet for a port, globalizing a local sender.
    pub(crate) fn egress(&mut self, id: PortId, mut packet: Packet) -> Option<Dispatch> {
        let port = self.ports.get(&id)?.port.clone();
        if packet.sender().is_local() {
            packet.set_sender(self.global(packet.sender()));
        }
        self.stats.forwarded += 1;
        Some(Dispatch::Send { port, packet })
    }

    /// Route a non-control packet.
    fn switch(&mut self, mut packet: Packet) -> Option<Vec<Dispatch>> {
        match self.resolve(packet.receiver()) {
            Route::Local(addr) => {
                packet.set_receiver(addr);
                match packet.packet_type() {
                    PacketType::Unicast => match self.mailbox(addr) {
                        Some(to) => {
                            self.stats.delivered_local += 1;
                            Some(vec![Dispatch::Deliver {
                                to,
                                packet,
                                multicast: false,
                            }])
                        }
                        None => {
                            debug!(receiver = %addr, "No local interface, dropping packet");
                            None
                        }
                    },
                    PacketType::Multicast => Some(self.fanout(addr, packet)),
                    PacketType::DeathNotification => Some(self.death_arrived(addr, packet.sender())),
                    other => {
                        warn!(packet_type = %other, receiver = %addr, "Unexpected local packet");
                        None
                    }
                }
            }
            Route::Port(id) => self.egress(id, packet).map(|d| vec![d]),
            Route::Unroutable => {
                warn!(receiver = %packet.receiver(), "No route to destination");
                None
            }
        }
    }
}

/// Process-wide message router.
pub struct Router {
    state: Mutex<RouterState>,
    config: RouterConfig,
    name_server: Mutex<Option<Arc<NameServer>>>,
    next_port_id: AtomicU64,
}

impl Router {
    /// Create a router and start its name server.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RouterConfig) -> Result<Arc<Self>, RouterError> {
        let hop = config.subnet_prefix_len();
        if hop as u32 >= crate::address::HOST_ADDR_BITS {
            return Err(RouterError::InvalidSubnetPrefix(hop));
        }
        let router = Arc::new(Self {
            state: Mutex::new(RouterState::new(hop)),
            config,
            name_server: Mutex::new(None),
            next_port_id: AtomicU64::new(1),
        });

        let ns = NameServer::start(&router)?;
        lock(&router.state).ns_addr = ns.address();
        *lock(&router.name_server) = Some(ns);

        info!(subnet_prefix_len = hop, "Router started");
        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, RouterState> {
        lock(&self.state)
    }

    // === Addressing ===

    /// Network address of this router.
    pub fn net_addr(&self) -> IfcAddr {
        self.state().net_addr
    }

    /// Prefix length of this router's network.
    pub fn prefix_len(&self) -> u8 {
        self.state().prefix_len
    }

    /// Host address of this router.
    pub fn own_host(&self) -> IfcAddr {
        self.state().own_host()
    }

    /// Globally routable form of `addr`.
    pub fn global_address(&self, addr: IfcAddr) -> IfcAddr {
        self.state().global(addr)
    }

    /// Local form of `addr` if it belongs to this host, else `addr`.
    pub fn localize(&self, addr: IfcAddr) -> IfcAddr {
        self.state().localize(addr)
    }

    /// The local name server.
    pub fn name_server(&self) -> Option<Arc<NameServer>> {
        lock(&self.name_server).clone()
    }

    /// Local address of the name server interface.
    pub fn name_server_address(&self) -> IfcAddr {
        self.state().ns_addr
    }

    // === Interfaces ===

    /// Allocate a fresh interface address bound to `mailbox`.
    pub fn allocate_ifc_addr(&self, mailbox: Weak<dyn Mailbox>) -> Result<IfcAddr, RouterError> {
        let mut state = self.state();
        let seq = state
            .interfaces
            .allocate()
            .map_err(|_| RouterError::AddressSpaceExhausted)?;
        let addr = IfcAddr::new(seq);
        state.local.insert(addr, mailbox);
        trace!(addr = %addr, "Interface address allocated");
        Ok(addr)
    }

    /// Release a local interface address and notify everyone attached to it.
    pub fn free_ifc_addr(&self, addr: IfcAddr) {
        let actions = {
            let mut state = self.state();
            let addr = state.localize(addr);
            if state.local.remove(&addr).is_none() {
                return;
            }
            let _ = state.interfaces.free(addr.as_u64());
            trace!(addr = %addr, "Interface address freed");
            // The address may be recycled; its group dies with it.
            state.group_died(addr, addr)
        };
        self.dispatch(actions);
    }

    // === Routing ===

    /// Route a packet. `ingress` is the port it arrived on, if any.
    ///
    /// Returns false if the packet could not be routed or delivered.
    pub fn route_packet(&self, packet: Packet, ingress: Option<PortId>) -> bool {
        if let Some(port) = ingress
            && packet.packet_type().is_hop_control()
        {
            return self.handle_hop_control(packet, port);
        }

        let actions = {
            let mut state = self.state();
            let actions = state.switch(packet);
            if actions.is_none() {
                state.stats.dropped += 1;
            }
            actions
        };
        match actions {
            Some(actions) => self.dispatch(actions),
            None => false,
        }
    }

    fn handle_hop_control(&self, packet: Packet, ingress: PortId) -> bool {
        trace!(packet_type = %packet.packet_type(), port = %ingress, "Hop control packet");
        match packet.packet_type() {
            PacketType::MulticastJoin => {
                let (publisher, joiner) = (packet.receiver(), packet.sender());
                if !self.join_group(publisher, joiner) {
                    let death = Packet::control(PacketType::DeathNotification, publisher, joiner);
                    self.route_packet(death, None);
                }
                true
            }
            PacketType::MulticastLeave => {
                self.leave_group(packet.receiver(), packet.sender());
                true
            }
            PacketType::DeathNotification => {
                let actions = {
                    let mut state = self.state();
                    let key = state.localize(packet.receiver());
                    state.death_arrived(key, packet.sender())
                };
                self.dispatch(actions);
                true
            }
            _ => false,
        }
    }

    /// Execute side effects computed under the lock.
    ///
    /// Returns true when every step succeeded.
    pub(crate) fn dispatch(&self, actions: Vec<Dispatch>) -> bool {
        let mut ok = true;
        for action in actions {
            ok &= match action {
                Dispatch::Send { port, packet } => port.send_packet(packet),
                // A filtered multicast copy is not a routing failure.
                Dispatch::Deliver {
                    to,
                    packet,
                    multicast,
                } => to.push_packet(packet, multicast) || multicast,
                Dispatch::Death { to, receiver, dead } => {
                    to.push_death(receiver, dead);
                    true
                }
            };
        }
        ok
    }

    // === Multicast ===

    /// Add `receiver` to the group of `publisher`.
    ///
    /// Returns whether the publisher was alive at join time. A joiner that
    /// gets false is not added and must treat the publisher as dead.
    pub fn join_group(&self, publisher: IfcAddr, receiver: IfcAddr) -> bool {
        let (alive, actions) = self.state().join(publisher, receiver);
        self.dispatch(actions);
        alive
    }

    /// Remove `receiver` from the group of `publisher`.
    pub fn leave_group(&self, publisher: IfcAddr, receiver: IfcAddr) {
        let actions = self.state().leave(publisher, receiver);
        self.dispatch(actions);
    }

    // === Status ===

    /// Traffic counters.
    pub fn stats(&self) -> RouterStats {
        self.state().stats
    }

    /// Number of attached ports.
    pub fn port_count(&self) -> usize {
        self.state().ports.len()
    }

    /// Upstream port, if attached.
    pub fn upstream_port(&self) -> Option<PortId> {
        self.state().upstream
    }

    /// Number of live local interfaces.
    pub fn interface_count(&self) -> usize {
        self.state().local.len()
    }

    /// Number of multicast groups, stubs included.
    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }

    /// Number of remote publishers represented by a local stub.
    pub fn stub_count(&self) -> usize {
        self.state().stubs.len()
    }

    /// Number of subnets delegated to downstream ports.
    pub fn subnet_count(&self) -> usize {
        self.state().subnets.count()
    }

    pub(crate) fn next_port_id(&self) -> PortId {
        PortId::new(self.next_port_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Detach all ports and stop the name server.
    pub fn shutdown(&self) {
        let ids: Vec<PortId> = self.state().ports.keys().copied().collect();
        for id in ids {
            self.del_port(id);
        }
        if let Some(ns) = lock(&self.name_server).take() {
            ns.stop();
        }
        info!("Router shut down");
    }
}

// ============================================================================
// Process-wide router
// ============================================================================

static LOCAL_ROUTER: Mutex<Option<Arc<Router>>> = Mutex::new(None);

/// The process-wide router, created with default settings on first use.
///
/// Must be called from within a tokio runtime.
pub fn local_router() -> Result<Arc<Router>, RouterError> {
    let mut slot = lock(&LOCAL_ROUTER);
    if let Some(router) = slot.as_ref() {
        return Ok(router.clone());
    }
    let router = Router::new(RouterConfig::default())?;
    *slot = Some(router.clone());
    Ok(router)
}

/// Shut down and forget the process-wide router.
pub fn shutdown_local_router() {
    let router = lock(&LOCAL_ROUTER).take();
    if let Some(router) = router {
        router.shutdown();
    }
}
