//! Port attachment, address delegation and port removal.

use super::{Dispatch, PortEntry, Route, Router, RouterError, RouterState, subnet_allocator};
use crate::address::{IfcAddr, HOST_ADDR_BITS, INTERFACE_BIT};
use crate::port::{Port, PortId};
use crate::protocol::DhcpOffer;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Network delegated to a downstream port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamLease {
    /// Network address handed to the peer.
    pub address: IfcAddr,
    /// Prefix length of the delegated network.
    pub prefix_len: u8,
    /// Global address of this router's name server.
    pub name_server: IfcAddr,
    pub(crate) seq: u64,
}

impl DownstreamLease {
    /// The DHCP offer announcing this lease.
    pub fn offer(&self) -> DhcpOffer {
        DhcpOffer::new(self.prefix_len, self.address, self.name_server)
    }
}

/// Addressing adopted from an upstream DHCP offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpstreamBinding {
    /// Network delegated to this router.
    pub net_addr: IfcAddr,
    pub prefix_len: u8,
    /// Our host address inside the delegated network.
    pub local_addr: IfcAddr,
    /// The delegated network address, as seen from the peer.
    pub peer_addr: IfcAddr,
    /// Global address of the upstream name server.
    pub name_server: IfcAddr,
}

impl UpstreamBinding {
    pub fn from_offer(offer: &DhcpOffer) -> Self {
        Self {
            net_addr: offer.address,
            prefix_len: offer.prefix_len,
            local_addr: IfcAddr::new(offer.address.as_u64() | INTERFACE_BIT),
            peer_addr: offer.address,
            name_server: offer.name_server,
        }
    }
}

/// Name server follow-up of a port removal.
enum NameServerAction {
    MakeLocal,
    PortVanished(IfcAddr, u8),
}

impl RouterState {
    fn routes_via(&self, addr: IfcAddr, id: PortId) -> bool {
        matches!(self.resolve(addr), Route::Port(p) if p == id)
    }

    /// Tear down routing state reached through port `id`.
    fn detach_port(&mut self, id: PortId) -> Option<(Vec<Dispatch>, NameServerAction)> {
        if !self.ports.contains_key(&id) {
            return None;
        }
        let mut out = Vec::new();

        // Receivers behind the port are gone.
        let mut emptied = Vec::new();
        let keys: Vec<IfcAddr> = self.groups.keys().copied().collect();
        for key in keys {
            let behind: Vec<IfcAddr> = self.groups[&key]
                .receivers
                .iter()
                .copied()
                .filter(|r| self.routes_via(*r, id))
                .collect();
            if behind.is_empty() {
                continue;
            }
            if let Some(group) = self.groups.get_mut(&key) {
                group.receivers.retain(|r| !behind.contains(r));
                if group.receivers.is_empty() {
                    emptied.push(key);
                }
            }
        }

        // Publishers behind the port are dead for everyone else.
        let lost: Vec<(IfcAddr, IfcAddr)> = self
            .stubs
            .iter()
            .filter(|(publisher, _)| self.routes_via(**publisher, id))
            .map(|(publisher, stub)| (*publisher, *stub))
            .collect();
        for (publisher, stub) in lost {
            if !emptied.contains(&stub) {
                out.extend(self.group_died(stub, publisher));
            } else if let Some(group) = self.groups.get_mut(&stub) {
                group.alive = false;
            }
        }

        let entry = self.ports.remove(&id)?;
        for key in emptied {
            out.extend(self.remove_group(key));
        }

        let action = match entry.lease {
            Some(lease) => {
                let _ = self.subnets.free(lease.seq);
                NameServerAction::PortVanished(lease.address, lease.prefix_len)
            }
            None => {
                if self.upstream == Some(id) {
                    self.upstream = None;
                    self.net_addr = IfcAddr::LOOPBACK;
                    self.prefix_len = 0;
                }
                NameServerAction::MakeLocal
            }
        };
        Some((out, action))
    }
}

impl Router {
    /// Change the number of host bits delegated per downstream port.
    pub fn set_subnet_prefix_len(&self, hop: u8) -> Result<(), RouterError> {
        if hop as u32 >= HOST_ADDR_BITS {
            return Err(RouterError::InvalidSubnetPrefix(hop));
        }
        let mut state = self.state();
        if !state.subnets.is_empty() {
            return Err(RouterError::SubnetsAllocated);
        }
        state.subnet_prefix_len = hop;
        state.subnets = subnet_allocator(hop);
        Ok(())
    }

    /// Allocate a sub-network for a new downstream peer.
    pub fn allocate_downstream_addr(&self) -> Result<DownstreamLease, RouterError> {
        let mut state = self.state();
        let hop = state.subnet_prefix_len;
        if hop == 0 {
            return Err(RouterError::DownstreamDisabled);
        }
        // The delegated host part must leave room for the interface bit.
        let prefix_len = match state.prefix_len.checked_add(hop) {
            Some(len) if (len as u32) < HOST_ADDR_BITS => len,
            _ => return Err(RouterError::SubnetSpaceExhausted),
        };
        let seq = state
            .subnets
            .allocate()
            .map_err(|_| RouterError::SubnetSpaceExhausted)?;
        let address = IfcAddr::new(state.net_addr.as_u64() | (seq << (64 - prefix_len as u32)));
        let name_server = state.global(state.ns_addr);

        debug!(address = %address, prefix_len, "Downstream subnet allocated");
        Ok(DownstreamLease {
            address,
            prefix_len,
            name_server,
            seq,
        })
    }

    /// Return a lease that never got attached to a port.
    pub fn free_downstream_addr(&self, lease: &DownstreamLease) {
        let _ = self.state().subnets.free(lease.seq);
    }

    /// Make `port` the route for the network in `lease`.
    pub fn add_downstream_port(&self, port: Arc<Port>, lease: &DownstreamLease) {
        let id = port.id();
        self.state().ports.insert(
            id,
            PortEntry {
                port,
                lease: Some(lease.clone()),
            },
        );
        info!(port = %id, address = %lease.address, prefix_len = lease.prefix_len, "Downstream port attached");
    }

    /// Attach `port` as the upstream route and adopt its addressing.
    ///
    /// With an empty `sub_domain` the name server becomes a stub resolver
    /// of the upstream one; otherwise it registers `sub_domain` upstream and
    /// becomes authoritative for it. On failure the port is detached again.
    pub async fn add_upstream_port(
        &self,
        port: Arc<Port>,
        binding: UpstreamBinding,
        sub_domain: &str,
    ) -> Result<(), RouterError> {
        let id = port.id();
        {
            let mut state = self.state();
            if state.upstream.is_some() {
                return Err(RouterError::UpstreamExists);
            }
            if !state.subnets.is_empty() {
                return Err(RouterError::SubnetsAllocated);
            }
            state.net_addr = binding.net_addr;
            state.prefix_len = binding.prefix_len;
            state.ports.insert(id, PortEntry { port, lease: None });
            state.upstream = Some(id);
        }
        info!(
            port = %id,
            net_addr = %binding.net_addr,
            prefix_len = binding.prefix_len,
            "Upstream port attached"
        );

        let result = match self.name_server() {
            None => Err(RouterError::NameServerUnavailable),
            Some(ns) if sub_domain.is_empty() => ns
                .make_stub_resolver(binding.name_server)
                .map_err(RouterError::from),
            Some(ns) => ns
                .make_authoritative(binding.name_server, sub_domain)
                .await
                .map_err(RouterError::from),
        };
        if let Err(e) = result {
            warn!(port = %id, error = %e, "Name server setup failed, detaching upstream");
            self.del_port(id);
            return Err(e);
        }
        Ok(())
    }

    /// Detach a port and clean up everything routed through it.
    ///
    /// Idempotent.
    pub fn del_port(&self, id: PortId) {
        let Some((actions, follow_up)) = self.state().detach_port(id) else {
            return;
        };
        info!(port = %id, "Port detached");
        self.dispatch(actions);

        if let Some(ns) = self.name_server() {
            match follow_up {
                NameServerAction::MakeLocal => ns.make_local(),
                NameServerAction::PortVanished(net, prefix_len) => ns.port_vanished(net, prefix_len),
            }
        }
    }
}
