//! Mailbox Queues
//!
//! A queue is the receiving end of one or more interfaces. It holds a FIFO
//! of decoded events, a timer table and the per-interface bookkeeping
//! (codec, multicast subscriptions, death monitors).
//!
//! Two kinds of interface live on a queue:
//!
//! - a [`LocalInterface`] is an endpoint that others send to;
//! - a [`RemoteInterface`] is a connection to someone else's endpoint. It
//!   has its own local address, joined to the target's multicast group so
//!   that broadcasts and the target's death reach it.
//!
//! Timers are converted into mailbox events when they are due, in deadline
//! order, before a reader waits and every time it wakes.

mod codec;
mod interface;

pub use codec::{CodecError, Event, Message, MessageCodec, RawCodec, RawMessage};
pub use interface::{LocalInterface, MonitorRef, RemoteInterface};

use crate::address::IfcAddr;
use crate::nameserver::{client, NameServerError};
use crate::packet::Packet;
use crate::router::{Mailbox, Router, RouterError};
use crate::utils::lock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Errors related to queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("name already registered: {0}")]
    AddressInUse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("name server error: {0}")]
    NameServer(#[from] NameServerError),
}

/// Handle for a running timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerRef(u64);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// A mailbox entry. `tag` links timer firings and monitor events to their
/// handle so they can be purged; plain messages carry 0.
struct Entry<M> {
    event: Event<M>,
    tag: u64,
}

struct Timer<M> {
    message: M,
    interval: Option<Duration>,
}

pub(crate) enum InterfaceKind {
    Local,
    Remote {
        peer: IfcAddr,
        subscriptions: HashSet<u32>,
        alive: bool,
    },
}

struct Monitor<M> {
    tag: u64,
    target: IfcAddr,
    message: M,
}

pub(crate) struct InterfaceEntry<M> {
    codec: Arc<dyn MessageCodec<M>>,
    kind: InterfaceKind,
    /// Monitors waiting for their target to die.
    monitors: Vec<Monitor<M>>,
    /// Groups joined on behalf of monitors, with the number of monitors
    /// using each.
    joined: HashMap<IfcAddr, usize>,
}

impl<M> InterfaceEntry<M> {
    fn new(codec: Arc<dyn MessageCodec<M>>, kind: InterfaceKind) -> Self {
        Self {
            codec,
            kind,
            monitors: Vec::new(),
            joined: HashMap::new(),
        }
    }
}

pub(crate) struct QueueState<M> {
    mailbox: VecDeque<Entry<M>>,
    timers: BTreeMap<(Instant, u64), Timer<M>>,
    timer_deadlines: HashMap<u64, Instant>,
    interfaces: HashMap<IfcAddr, InterfaceEntry<M>>,
    next_tag: u64,
}

impl<M: Message> QueueState<M> {
    fn next_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Move every timer due at `now` into the mailbox.
    fn fire_timers(&mut self, now: Instant) {
        while let Some(entry) = self.timers.first_entry() {
            let (deadline, tag) = *entry.key();
            if deadline > now {
                break;
            }
            let timer = entry.remove();
            self.mailbox.push_back(Entry {
                event: Event::local(timer.message.clone()),
                tag,
            });
            match timer.interval {
                Some(interval) => {
                    let next = deadline + interval;
                    self.timer_deadlines.insert(tag, next);
                    self.timers.insert((next, tag), timer);
                }
                None => {
                    self.timer_deadlines.remove(&tag);
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    fn purge(&mut self, tag: u64) -> bool {
        let before = self.mailbox.len();
        self.mailbox.retain(|e| e.tag != tag);
        before != self.mailbox.len()
    }
}

pub(crate) struct QueueInner<M: Message> {
    id: u64,
    router: Arc<Router>,
    state: Mutex<QueueState<M>>,
    notify: Notify,
}

impl<M: Message> QueueInner<M> {
    fn enqueue(&self, event: Event<M>, tag: u64) {
        lock(&self.state).mailbox.push_back(Entry { event, tag });
        self.notify.notify_one();
    }

    /// Enqueue a decoded message, applying the multicast subscription
    /// filter of the receiving interface.
    fn push_message(&self, event: Event<M>, multicast: bool) -> bool {
        let mut state = lock(&self.state);
        if multicast {
            let subscribed = matches!(
                state.interfaces.get(&event.receiver).map(|e| &e.kind),
                Some(InterfaceKind::Remote { subscriptions, .. }) if subscriptions.contains(&event.id)
            );
            if !subscribed {
                trace!(receiver = %event.receiver, event_id = event.id, "Unsubscribed multicast dropped");
                return false;
            }
        }
        state.mailbox.push_back(Entry { event, tag: 0 });
        drop(state);
        self.notify.notify_one();
        true
    }

    fn codec_for(&self, addr: IfcAddr) -> Option<Arc<dyn MessageCodec<M>>> {
        lock(&self.state).interfaces.get(&addr).map(|e| e.codec.clone())
    }

    /// Remove a pending monitor, or purge its already-delivered event.
    ///
    /// Returns whether something was removed, and the group to leave when
    /// the last monitor of a local interface on that target goes away.
    fn demonitor(&self, owner: IfcAddr, tag: u64) -> (bool, Option<IfcAddr>) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(entry) = state.interfaces.get_mut(&owner)
            && let Some(pos) = entry.monitors.iter().position(|m| m.tag == tag)
        {
            let monitor = entry.monitors.remove(pos);
            let mut leave = None;
            if let Some(count) = entry.joined.get_mut(&monitor.target) {
                *count -= 1;
                if *count == 0 {
                    entry.joined.remove(&monitor.target);
                    leave = Some(monitor.target);
                }
            }
            return (true, leave);
        }
        (state.purge(tag), None)
    }
}

impl<M: Message> Mailbox for QueueInner<M> {
    fn push_packet(&self, packet: Packet, multicast: bool) -> bool {
        let receiver = packet.receiver();
        let Some(codec) = self.codec_for(receiver) else {
            debug!(receiver = %receiver, "Packet for unknown interface dropped");
            return false;
        };
        let id = packet.event_id();
        let body = match codec.decode(id, packet.payload()) {
            Ok(body) => body,
            Err(e) => {
                warn!(receiver = %receiver, event_id = id, error = %e, "Failed to decode packet");
                return false;
            }
        };
        self.push_message(
            Event {
                id,
                sender: packet.sender(),
                receiver,
                body,
            },
            multicast,
        )
    }

    fn push_death(&self, receiver: IfcAddr, dead: IfcAddr) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let Some(entry) = state.interfaces.get_mut(&receiver) else {
            return;
        };
        if let InterfaceKind::Remote { peer, alive, .. } = &mut entry.kind
            && *peer == dead
        {
            *alive = false;
        }
        entry.joined.remove(&dead);

        let (fired, waiting): (Vec<_>, Vec<_>) =
            entry.monitors.drain(..).partition(|m| m.target == dead);
        entry.monitors = waiting;
        let any = !fired.is_empty();
        for monitor in fired {
            state.mailbox.push_back(Entry {
                event: Event {
                    id: monitor.message.event_id(),
                    sender: dead,
                    receiver,
                    body: monitor.message,
                },
                tag: monitor.tag,
            });
        }
        drop(guard);
        if any {
            self.notify.notify_one();
        }
        trace!(receiver = %receiver, dead = %dead, "Death delivered");
    }
}

/// A typed mailbox queue.
pub struct Queue<M: Message> {
    inner: Arc<QueueInner<M>>,
}

impl<M: Message> Clone for Queue<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Message> Queue<M> {
    /// Create an empty queue on `router`.
    pub fn new(router: &Arc<Router>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                router: router.clone(),
                state: Mutex::new(QueueState {
                    mailbox: VecDeque::new(),
                    timers: BTreeMap::new(),
                    timer_deadlines: HashMap::new(),
                    interfaces: HashMap::new(),
                    next_tag: 1,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Number of events waiting in the mailbox.
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).mailbox.len()
    }

    fn add_interface(
        &self,
        codec: Arc<dyn MessageCodec<M>>,
        kind: InterfaceKind,
    ) -> Result<IfcAddr, QueueError> {
        let mailbox: Weak<dyn Mailbox> = Arc::downgrade(&self.inner) as Weak<dyn Mailbox>;
        let addr = self.inner.router.allocate_ifc_addr(mailbox)?;
        lock(&self.inner.state)
            .interfaces
            .insert(addr, InterfaceEntry::new(codec, kind));
        Ok(addr)
    }

    // === Interfaces ===

    /// Register an anonymous local interface.
    pub fn register_interface<C: MessageCodec<M>>(
        &self,
        codec: C,
    ) -> Result<LocalInterface<M>, QueueError> {
        let codec: Arc<dyn MessageCodec<M>> = Arc::new(codec);
        let addr = self.add_interface(codec.clone(), InterfaceKind::Local)?;
        Ok(LocalInterface::new(self.inner.clone(), addr, codec))
    }

    /// Register a local interface under `name` with the local name server.
    ///
    /// Fails with [`QueueError::AddressInUse`] if the name is taken; the
    /// address allocated for the interface is released again.
    pub async fn register_named_interface<C: MessageCodec<M>>(
        &self,
        codec: C,
        name: &str,
    ) -> Result<LocalInterface<M>, QueueError> {
        let mut iface = self.register_interface(codec)?;
        let router = self.inner.router.clone();
        let ns = router.name_server_address();
        match client::register(&router, ns, name, iface.address(), false, None).await {
            Ok(_) => {
                iface.set_name(name);
                debug!(name, addr = %iface.address(), "Registered named interface");
                Ok(iface)
            }
            Err(NameServerError::NameInUse(_)) => Err(QueueError::AddressInUse(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Connect to the interface at `addr`.
    ///
    /// The returned handle is already dead if nothing lives at `addr`.
    pub fn connect_interface<C: MessageCodec<M>>(
        &self,
        addr: IfcAddr,
        codec: C,
    ) -> Result<RemoteInterface<M>, QueueError> {
        let router = &self.inner.router;
        let peer = router.localize(addr);
        let codec: Arc<dyn MessageCodec<M>> = Arc::new(codec);
        let local = self.add_interface(
            codec.clone(),
            InterfaceKind::Remote {
                peer,
                subscriptions: HashSet::new(),
                alive: true,
            },
        )?;

        if !router.join_group(peer, local) {
            debug!(peer = %peer, "Connected to a dead interface");
            self.inner.push_death(local, peer);
        }
        Ok(RemoteInterface::new(self.inner.clone(), local, peer, codec))
    }

    /// Resolve `name` through the name server and connect to it.
    ///
    /// Returns `None` if the name does not resolve within `timeout`
    /// (`None` waits indefinitely for it to be registered).
    pub async fn connect_named_interface<C: MessageCodec<M>>(
        &self,
        name: &str,
        codec: C,
        timeout: Option<Duration>,
    ) -> Result<Option<RemoteInterface<M>>, QueueError> {
        let router = self.inner.router.clone();
        let ns = router.name_server_address();
        let max_redirects = router.config().name_server.max_redirects();
        match client::lookup(&router, ns, name, timeout, max_redirects).await {
            Some((addr, _)) => Ok(Some(self.connect_interface(addr, codec)?)),
            None => Ok(None),
        }
    }

    /// Connect to a local interface living on another queue of the same
    /// router.
    pub fn connect_local<N: Message, C: MessageCodec<M>>(
        &self,
        target: &LocalInterface<N>,
        codec: C,
    ) -> Result<RemoteInterface<M>, QueueError> {
        if !Arc::ptr_eq(target.router(), &self.inner.router) {
            return Err(QueueError::InvalidArgument("interface belongs to another router"));
        }
        if target.queue_id() == self.inner.id {
            return Err(QueueError::InvalidArgument("interface belongs to this queue"));
        }
        self.connect_interface(target.address(), codec)
    }

    // === Reading ===

    /// Wait for the next event.
    ///
    /// `None` timeout waits indefinitely; a zero timeout only polls.
    pub async fn read_message(&self, timeout: Option<Duration>) -> Option<Event<M>> {
        self.read_message_where(timeout, |_| true).await
    }

    /// Wait for the first event accepted by `selector`.
    ///
    /// Events rejected by the selector stay queued in order.
    pub async fn read_message_where<F>(&self, timeout: Option<Duration>, selector: F) -> Option<Event<M>>
    where
        F: Fn(&Event<M>) -> bool + Send,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let next_timer = {
                let mut state = lock(&self.inner.state);
                state.fire_timers(Instant::now());
                if let Some(pos) = state.mailbox.iter().position(|e| selector(&e.event)) {
                    return state.mailbox.remove(pos).map(|e| e.event);
                }
                state.next_deadline()
            };

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return None;
            }

            let wake_at = match (deadline, next_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake_at {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, self.inner.notify.notified()).await;
                }
                None => self.inner.notify.notified().await,
            }
        }
    }

    /// Enqueue a message addressed to the loopback address.
    pub fn send_self_message(&self, message: M) {
        self.inner.enqueue(Event::local(message), 0);
    }

    // === Timers ===

    /// Start a timer delivering `message` after `after`.
    ///
    /// A cyclic timer re-arms from its previous deadline. A cyclic timer
    /// with a zero period fires once.
    pub fn start_timer(&self, message: M, after: Duration, cyclic: bool) -> TimerRef {
        let deadline = Instant::now() + after;
        let interval = (cyclic && !after.is_zero()).then_some(after);
        let tag = {
            let mut state = lock(&self.inner.state);
            let tag = state.next_tag();
            state.timers.insert((deadline, tag), Timer { message, interval });
            state.timer_deadlines.insert(tag, deadline);
            tag
        };
        // Wake a reader so it re-computes its sleep.
        self.inner.notify.notify_one();
        TimerRef(tag)
    }

    /// Stop a timer and purge its queued firings.
    ///
    /// Returns whether the timer was still armed.
    pub fn stop_timer(&self, timer: TimerRef) -> bool {
        let mut state = lock(&self.inner.state);
        let armed = match state.timer_deadlines.remove(&timer.0) {
            Some(deadline) => state.timers.remove(&(deadline, timer.0)).is_some(),
            None => false,
        };
        state.purge(timer.0);
        armed
    }
}
