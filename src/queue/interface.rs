//! Interface handles.
//!
//! Dropping a handle releases its address. For a remote handle this also
//! leaves the target's group; for a named local handle it withdraws the
//! name from the local name server.

use super::{InterfaceKind, Monitor, QueueInner};
use crate::address::IfcAddr;
use crate::packet::Packet;
use crate::protocol::{NsCodec, NsMessage};
use crate::queue::{Event, Message, MessageCodec};
use crate::router::{Mailbox, Router};
use crate::utils::lock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle for a pending or delivered death monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MonitorRef(u64);

fn encode<M: Message>(codec: &dyn MessageCodec<M>, message: &M) -> Option<Vec<u8>> {
    match codec.encode(message) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(event_id = message.event_id(), error = %e, "Failed to encode message");
            None
        }
    }
}

// ============================================================================
// Local interface
// ============================================================================

/// An endpoint owned by a queue.
pub struct LocalInterface<M: Message> {
    queue: Arc<QueueInner<M>>,
    address: IfcAddr,
    codec: Arc<dyn MessageCodec<M>>,
    name: Option<String>,
}

impl<M: Message> std::fmt::Debug for LocalInterface<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInterface")
            .field("address", &self.address)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<M: Message> LocalInterface<M> {
    pub(super) fn new(
        queue: Arc<QueueInner<M>>,
        address: IfcAddr,
        codec: Arc<dyn MessageCodec<M>>,
    ) -> Self {
        Self {
            queue,
            address,
            codec,
            name: None,
        }
    }

    pub(super) fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub(super) fn queue_id(&self) -> u64 {
        self.queue.id
    }

    pub(super) fn router(&self) -> &Arc<Router> {
        &self.queue.router
    }

    /// Local address (host part zero).
    pub fn address(&self) -> IfcAddr {
        self.address
    }

    /// Address as seen from other routers.
    pub fn global_address(&self) -> IfcAddr {
        self.queue.router.global_address(self.address)
    }

    /// Registered name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Send `message` to the interface at `dest`.
    pub fn send_to(&self, dest: IfcAddr, message: &M) -> bool {
        let Some(payload) = encode(self.codec.as_ref(), message) else {
            return false;
        };
        let packet = Packet::from_event(false, self.address, dest, message.event_id(), payload);
        self.queue.router.route_packet(packet, None)
    }

    /// Answer the sender of `event`.
    pub fn reply<N>(&self, event: &Event<N>, message: &M) -> bool {
        self.send_to(event.sender, message)
    }

    /// Broadcast `message` to every connected interface subscribed to its
    /// event id.
    pub fn publish(&self, message: &M) -> bool {
        let Some(payload) = encode(self.codec.as_ref(), message) else {
            return false;
        };
        let packet = Packet::from_event(true, self.address, self.address, message.event_id(), payload);
        self.queue.router.route_packet(packet, None)
    }

    /// Deliver `message` to this queue once `target` dies.
    ///
    /// Fires immediately if `target` is already gone.
    pub fn monitor(&self, target: IfcAddr, message: M) -> MonitorRef {
        let router = &self.queue.router;
        let target = router.localize(target);
        let (tag, first) = {
            let mut guard = lock(&self.queue.state);
            let state = &mut *guard;
            let tag = state.next_tag();
            let Some(entry) = state.interfaces.get_mut(&self.address) else {
                return MonitorRef(tag);
            };
            entry.monitors.push(Monitor {
                tag,
                target,
                message,
            });
            let count = entry.joined.entry(target).or_insert(0);
            *count += 1;
            (tag, *count == 1)
        };
        if first && !router.join_group(target, self.address) {
            self.queue.push_death(self.address, target);
        }
        MonitorRef(tag)
    }

    /// Cancel a monitor, or purge its event if it already fired.
    pub fn demonitor(&self, monitor: MonitorRef) -> bool {
        let (removed, leave) = self.queue.demonitor(self.address, monitor.0);
        if let Some(target) = leave {
            self.queue.router.leave_group(target, self.address);
        }
        removed
    }
}

impl<M: Message> Drop for LocalInterface<M> {
    fn drop(&mut self) {
        let router = self.queue.router.clone();
        let joined: Vec<IfcAddr> = lock(&self.queue.state)
            .interfaces
            .remove(&self.address)
            .map(|e| e.joined.into_keys().collect())
            .unwrap_or_default();
        for target in joined {
            router.leave_group(target, self.address);
        }

        if let Some(name) = self.name.take() {
            let request = NsMessage::DeregisterNameReq { name };
            if let Some(payload) = encode(&NsCodec, &request) {
                let packet = Packet::from_event(
                    false,
                    self.address,
                    router.name_server_address(),
                    request.event_id(),
                    payload,
                );
                router.route_packet(packet, None);
            }
        }

        router.free_ifc_addr(self.address);
        debug!(addr = %self.address, "Local interface released");
    }
}

// ============================================================================
// Remote interface
// ============================================================================

/// A connection from a queue to another interface.
pub struct RemoteInterface<M: Message> {
    queue: Arc<QueueInner<M>>,
    local: IfcAddr,
    remote: IfcAddr,
    codec: Arc<dyn MessageCodec<M>>,
}

impl<M: Message> RemoteInterface<M> {
    pub(super) fn new(
        queue: Arc<QueueInner<M>>,
        local: IfcAddr,
        remote: IfcAddr,
        codec: Arc<dyn MessageCodec<M>>,
    ) -> Self {
        Self {
            queue,
            local,
            remote,
            codec,
        }
    }

    /// Address of this connection on the local queue.
    pub fn local_address(&self) -> IfcAddr {
        self.local
    }

    /// Address of the connected interface.
    pub fn remote_address(&self) -> IfcAddr {
        self.remote
    }

    /// Whether the target was alive at connect time and has not died since.
    pub fn is_alive(&self) -> bool {
        match lock(&self.queue.state).interfaces.get(&self.local).map(|e| &e.kind) {
            Some(InterfaceKind::Remote { alive, .. }) => *alive,
            _ => false,
        }
    }

    /// Send `message` to the target.
    pub fn send(&self, message: &M) -> bool {
        let Some(payload) = encode(self.codec.as_ref(), message) else {
            return false;
        };
        let packet =
            Packet::from_event(false, self.local, self.remote, message.event_id(), payload);
        self.queue.router.route_packet(packet, None)
    }

    fn set_subscribed(&self, event_id: u32, on: bool) {
        let mut state = lock(&self.queue.state);
        if let Some(InterfaceKind::Remote { subscriptions, .. }) =
            state.interfaces.get_mut(&self.local).map(|e| &mut e.kind)
        {
            if on {
                subscriptions.insert(event_id);
            } else {
                subscriptions.remove(&event_id);
            }
        }
    }

    /// Accept broadcasts of `event_id` from the target.
    pub fn subscribe(&self, event_id: u32) {
        self.set_subscribed(event_id, true);
    }

    /// Stop accepting broadcasts of `event_id`.
    pub fn unsubscribe(&self, event_id: u32) {
        self.set_subscribed(event_id, false);
    }

    /// Deliver `message` to this queue once the target dies.
    ///
    /// Fires immediately if the target is already dead.
    pub fn monitor(&self, message: M) -> MonitorRef {
        let mut guard = lock(&self.queue.state);
        let state = &mut *guard;
        let tag = state.next_tag();
        let Some(entry) = state.interfaces.get_mut(&self.local) else {
            return MonitorRef(tag);
        };
        let alive = matches!(entry.kind, InterfaceKind::Remote { alive: true, .. });
        if alive {
            entry.monitors.push(Monitor {
                tag,
                target: self.remote,
                message,
            });
        } else {
            state.mailbox.push_back(super::Entry {
                event: Event {
                    id: message.event_id(),
                    sender: self.remote,
                    receiver: self.local,
                    body: message,
                },
                tag,
            });
            drop(guard);
            self.queue.notify.notify_one();
        }
        MonitorRef(tag)
    }

    /// Cancel a monitor, or purge its event if it already fired.
    pub fn demonitor(&self, monitor: MonitorRef) -> bool {
        self.queue.demonitor(self.local, monitor.0).0
    }
}

impl<M: Message> Drop for RemoteInterface<M> {
    fn drop(&mut self) {
        lock(&self.queue.state).interfaces.remove(&self.local);
        let router = &self.queue.router;
        router.leave_group(self.remote, self.local);
        router.free_ifc_addr(self.local);
    }
}
