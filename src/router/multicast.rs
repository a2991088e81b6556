//! Multicast groups and death propagation.
//!
//! A group is keyed by a local publisher address, or by a stub: a local
//! address standing in for a remote publisher. The first local joiner of a
//! remote publisher allocates the stub and sends a JOIN towards the
//! publisher with the stub as sender, so that the next router holds the
//! stub as a single receiver. Multicast traffic and death notifications
//! then fan out hop by hop along these groups.

use super::{Dispatch, Group, Route, RouterState};
use crate::address::IfcAddr;
use crate::packet::{Packet, PacketType};
use tracing::{debug, trace};

impl RouterState {
    /// Group key for a publisher: its stub if remote, its local form if ours.
    fn group_key(&self, publisher: IfcAddr) -> Option<IfcAddr> {
        if let Some(stub) = self.stubs.get(&publisher) {
            return Some(*stub);
        }
        match self.resolve(publisher) {
            Route::Local(addr) => Some(addr),
            _ => None,
        }
    }

    pub(crate) fn join(&mut self, publisher: IfcAddr, receiver: IfcAddr) -> (bool, Vec<Dispatch>) {
        if let Some(stub) = self.stubs.get(&publisher).copied() {
            return (self.add_receiver(stub, receiver), Vec::new());
        }

        match self.resolve(publisher) {
            Route::Local(addr) => {
                if !self.local.contains_key(&addr) {
                    return (false, Vec::new());
                }
                let group = self.groups.entry(addr).or_insert_with(|| Group {
                    receivers: Vec::new(),
                    alive: true,
                });
                if !group.receivers.contains(&receiver) {
                    group.receivers.push(receiver);
                }
                (true, Vec::new())
            }
            Route::Port(port) => {
                let Ok(seq) = self.interfaces.allocate() else {
                    debug!(publisher = %publisher, "No address for multicast stub");
                    return (false, Vec::new());
                };
                let stub = IfcAddr::new(seq);
                self.stubs.insert(publisher, stub);
                self.stub_publishers.insert(stub, publisher);
                self.groups.insert(
                    stub,
                    Group {
                        receivers: vec![receiver],
                        alive: true,
                    },
                );
                trace!(publisher = %publisher, stub = %stub, "Created multicast stub");

                let join = Packet::control(PacketType::MulticastJoin, stub, publisher);
                (true, self.egress(port, join).into_iter().collect())
            }
            Route::Unroutable => (false, Vec::new()),
        }
    }

    fn add_receiver(&mut self, key: IfcAddr, receiver: IfcAddr) -> bool {
        match self.groups.get_mut(&key) {
            Some(group) if group.alive => {
                if !group.receivers.contains(&receiver) {
                    group.receivers.push(receiver);
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn leave(&mut self, publisher: IfcAddr, receiver: IfcAddr) -> Vec<Dispatch> {
        let Some(key) = self.group_key(publisher) else {
            return Vec::new();
        };
        let Some(group) = self.groups.get_mut(&key) else {
            return Vec::new();
        };
        group.receivers.retain(|r| *r != receiver);
        if group.receivers.is_empty() {
            self.remove_group(key).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Drop an empty group, unwinding its stub.
    ///
    /// Returns the LEAVE to send upstream when the stub's publisher is
    /// still alive.
    pub(crate) fn remove_group(&mut self, key: IfcAddr) -> Option<Dispatch> {
        let group = self.groups.remove(&key)?;
        let publisher = self.stub_publishers.remove(&key)?;
        self.stubs.remove(&publisher);
        let _ = self.interfaces.free(key.as_u64());
        trace!(publisher = %publisher, stub = %key, "Released multicast stub");

        if !group.alive {
            return None;
        }
        match self.resolve(publisher) {
            Route::Port(port) => {
                let leave = Packet::control(PacketType::MulticastLeave, key, publisher);
                self.egress(port, leave)
            }
            _ => None,
        }
    }

    /// Copy a multicast packet to every receiver of the group `key`.
    pub(crate) fn fanout(&mut self, key: IfcAddr, packet: Packet) -> Vec<Dispatch> {
        let receivers = match self.groups.get(&key) {
            Some(group) => group.receivers.clone(),
            None => {
                trace!(publisher = %key, "Multicast with no receivers");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(receivers.len());
        let mut packet = Some(packet);
        let last = receivers.len().saturating_sub(1);
        for (i, receiver) in receivers.into_iter().enumerate() {
            let copy = if i == last {
                packet.take()
            } else {
                self.stats.multicast_copies += 1;
                packet.clone()
            };
            let Some(mut copy) = copy else { break };
            copy.set_receiver(receiver);

            match self.resolve(receiver) {
                Route::Local(addr) => {
                    if let Some(to) = self.mailbox(addr) {
                        copy.set_receiver(addr);
                        self.stats.delivered_local += 1;
                        out.push(Dispatch::Deliver {
                            to,
                            packet: copy,
                            multicast: true,
                        });
                    }
                }
                Route::Port(port) => out.extend(self.egress(port, copy)),
                Route::Unroutable => self.stats.dropped += 1,
            }
        }
        out
    }

    /// A DEATH notification arrived for `key`.
    pub(crate) fn death_arrived(&mut self, key: IfcAddr, dead: IfcAddr) -> Vec<Dispatch> {
        if let Some(publisher) = self.stub_publishers.get(&key).copied() {
            return self.group_died(key, publisher);
        }
        if let Some(to) = self.mailbox(key) {
            return vec![Dispatch::Death {
                to,
                receiver: key,
                dead,
            }];
        }
        debug!(receiver = %key, dead = %dead, "Death notification for unknown receiver");
        Vec::new()
    }

    /// Notify every receiver of the group `key` that `dead` is gone, then
    /// drop the group and release its stub.
    ///
    /// No LEAVE is sent for a dead publisher. Local receivers forget the
    /// membership on their death notification; remote receivers hold dead
    /// stubs of their own.
    pub(crate) fn group_died(&mut self, key: IfcAddr, dead: IfcAddr) -> Vec<Dispatch> {
        let receivers = match self.groups.get_mut(&key) {
            Some(group) => {
                group.alive = false;
                std::mem::take(&mut group.receivers)
            }
            None => return Vec::new(),
        };
        self.stats.deaths += 1;
        debug!(publisher = %dead, receivers = receivers.len(), "Publisher died");

        let mut out = Vec::new();
        for receiver in receivers {
            match self.resolve(receiver) {
                Route::Local(addr) => {
                    if let Some(to) = self.mailbox(addr) {
                        out.push(Dispatch::Death {
                            to,
                            receiver: addr,
                            dead,
                        });
                    }
                }
                Route::Port(port) => {
                    let death = Packet::control(PacketType::DeathNotification, dead, receiver);
                    out.extend(self.egress(port, death));
                }
                Route::Unroutable => {}
            }
        }
        out.extend(self.remove_group(key));
        out
    }
}
