//! Name Server
//!
//! Every router runs one name server: an actor on its own queue that maps
//! symbolic names to interface addresses. Name servers of a tree cooperate
//! to form one namespace.
//!
//! ## Roles
//!
//! - **Local**: no upstream. Answers from its own table.
//! - **Stub resolver**: forwards registrations upstream (keeping a local
//!   copy) and redirects plain-name queries to the upstream server.
//! - **Authoritative**: owns the domain path registered upstream, e.g.
//!   `/left`, and answers hierarchical queries under it.
//!
//! Hierarchical names start with `/`. A server whose domain is a proper
//! prefix of the query resolves the next segment: a name server entry
//! when more segments follow (the client is redirected there), or a plain
//! interface when it is the last segment.

pub(crate) mod client;
#[cfg(test)]
mod tests;

use crate::address::{network_mask, IfcAddr};
use crate::protocol::{NsCodec, NsMessage};
use crate::queue::{LocalInterface, Message, Queue, QueueError};
use crate::router::{Router, RouterError};
use crate::utils::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Separator of hierarchical names.
pub const NAME_SEPARATOR: char = '/';

/// Errors related to name server operations.
#[derive(Debug, Error)]
pub enum NameServerError {
    #[error("name server already has an upstream")]
    AlreadyConfigured,

    #[error("name already registered: {0}")]
    NameInUse(String),

    #[error("name server unreachable")]
    Unavailable,

    #[error("name server request timed out")]
    Timeout,
}

/// Name server role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameServerRole {
    Local,
    StubResolver {
        upstream: IfcAddr,
    },
    Authoritative {
        upstream: IfcAddr,
        /// Domain path, e.g. `/left`.
        domain: String,
    },
}

impl NameServerRole {
    fn upstream(&self) -> Option<IfcAddr> {
        match self {
            NameServerRole::Local => None,
            NameServerRole::StubResolver { upstream }
            | NameServerRole::Authoritative { upstream, .. } => Some(*upstream),
        }
    }
}

/// Registered name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameEntry {
    pub address: IfcAddr,
    pub is_name_server: bool,
}

/// Outcome of resolving a query against one server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Found(NameEntry),
    Redirect(IfcAddr),
    NotFound,
}

struct NameTable {
    entries: HashMap<String, NameEntry>,
    role: NameServerRole,
    /// Segments of the authoritative domain.
    segments: Vec<String>,
}

fn split_path(name: &str) -> Vec<&str> {
    name.split(NAME_SEPARATOR).filter(|s| !s.is_empty()).collect()
}

impl NameTable {
    fn resolve(&self, name: &str) -> Resolution {
        if !name.starts_with(NAME_SEPARATOR) {
            if let NameServerRole::StubResolver { upstream } = self.role {
                return Resolution::Redirect(upstream);
            }
            return match self.entries.get(name) {
                Some(entry) if !entry.is_name_server => Resolution::Found(*entry),
                _ => Resolution::NotFound,
            };
        }

        if let NameServerRole::StubResolver { upstream } = self.role {
            return Resolution::Redirect(upstream);
        }
        let path = split_path(name);
        let depth = self.segments.len();
        let under_domain = path.len() > depth
            && path.iter().zip(&self.segments).all(|(a, b)| *a == b.as_str());
        if !under_domain {
            return match self.role.upstream() {
                Some(upstream) => Resolution::Redirect(upstream),
                None => Resolution::NotFound,
            };
        }

        let last = path.len() == depth + 1;
        match self.entries.get(path[depth]) {
            Some(entry) if last && !entry.is_name_server => Resolution::Found(*entry),
            Some(entry) if !last && entry.is_name_server => Resolution::Redirect(entry.address),
            _ => Resolution::NotFound,
        }
    }
}

/// A router's name server actor.
pub struct NameServer {
    router: Weak<Router>,
    queue: Queue<NsMessage>,
    iface: LocalInterface<NsMessage>,
    table: Mutex<NameTable>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NameServer {
    /// Create the name server of `router` and spawn its actor.
    pub(crate) fn start(router: &Arc<Router>) -> Result<Arc<Self>, RouterError> {
        let queue = Queue::new(router);
        let iface = queue.register_interface(NsCodec).map_err(|e| match e {
            QueueError::Router(e) => e,
            _ => RouterError::NameServerUnavailable,
        })?;

        let ns = Arc::new(Self {
            router: Arc::downgrade(router),
            queue,
            iface,
            table: Mutex::new(NameTable {
                entries: HashMap::new(),
                role: NameServerRole::Local,
                segments: Vec::new(),
            }),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(ns.clone().run());
        *lock(&ns.task) = Some(task);

        debug!(addr = %ns.address(), "Name server started");
        Ok(ns)
    }

    /// Local address of the name server interface.
    pub fn address(&self) -> IfcAddr {
        self.iface.address()
    }

    pub fn role(&self) -> NameServerRole {
        lock(&self.table).role.clone()
    }

    /// Authoritative domain path; empty unless authoritative.
    pub fn domain(&self) -> String {
        match &lock(&self.table).role {
            NameServerRole::Authoritative { domain, .. } => domain.clone(),
            _ => String::new(),
        }
    }

    /// Look a name up in this server's own table.
    pub fn local_entry(&self, name: &str) -> Option<NameEntry> {
        lock(&self.table).entries.get(name).copied()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the actor to stop.
    pub fn stop(&self) {
        self.queue.send_self_message(NsMessage::Quit);
    }

    fn announce(&self) {
        self.iface.publish(&NsMessage::NameRegisteredInd);
    }

    fn reply(&self, to: IfcAddr, message: NsMessage) {
        if !self.iface.send_to(to, &message) {
            debug!(to = %to, "Name server reply not delivered");
        }
    }

    fn request_timeout(router: &Router) -> Duration {
        Duration::from_millis(router.config().name_server.request_timeout_ms())
    }

    // === Role transitions ===

    /// Drop any upstream and answer from the local table only.
    pub fn make_local(&self) {
        {
            let mut table = lock(&self.table);
            if table.role == NameServerRole::Local {
                return;
            }
            table.role = NameServerRole::Local;
            table.segments.clear();
        }
        info!("Name server is now local");
        self.announce();
    }

    /// Forward to the name server at `upstream`.
    pub fn make_stub_resolver(&self, upstream: IfcAddr) -> Result<(), NameServerError> {
        {
            let mut table = lock(&self.table);
            if table.role != NameServerRole::Local {
                return Err(NameServerError::AlreadyConfigured);
            }
            table.role = NameServerRole::StubResolver { upstream };
        }
        info!(upstream = %upstream, "Name server is now a stub resolver");
        self.announce();
        Ok(())
    }

    /// Register `host_name` with the server at `upstream` and become
    /// authoritative for the resulting domain.
    pub async fn make_authoritative(
        &self,
        upstream: IfcAddr,
        host_name: &str,
    ) -> Result<(), NameServerError> {
        if self.role() != NameServerRole::Local {
            return Err(NameServerError::AlreadyConfigured);
        }
        let router = self.router.upgrade().ok_or(NameServerError::Unavailable)?;
        let own = router.global_address(self.address());
        let parent = client::register(
            &router,
            upstream,
            host_name,
            own,
            true,
            Some(Self::request_timeout(&router)),
        )
        .await?;

        let domain = format!("{}{}{}", parent, NAME_SEPARATOR, host_name);
        {
            let mut table = lock(&self.table);
            if table.role != NameServerRole::Local {
                return Err(NameServerError::AlreadyConfigured);
            }
            table.segments = split_path(&domain).into_iter().map(String::from).collect();
            table.role = NameServerRole::Authoritative {
                upstream,
                domain: domain.clone(),
            };
        }
        info!(domain = %domain, upstream = %upstream, "Name server is now authoritative");
        self.announce();
        Ok(())
    }

    /// Forget every name living in a network that went away.
    pub fn port_vanished(&self, net: IfcAddr, prefix_len: u8) {
        let mask = network_mask(prefix_len);
        let removed = {
            let mut table = lock(&self.table);
            let before = table.entries.len();
            table
                .entries
                .retain(|_, e| e.address.is_local() || !e.address.is_on_network(net, mask));
            before - table.entries.len()
        };
        if removed > 0 {
            debug!(net = %net, prefix_len, removed, "Purged names of vanished network");
        }
    }

    // === Actor ===

    async fn run(self: Arc<Self>) {
        loop {
            let Some(event) = self.queue.read_message(None).await else {
                continue;
            };
            match event.body {
                NsMessage::Quit if event.sender.is_loopback() => break,
                NsMessage::RegisterNameReq {
                    name,
                    address,
                    is_name_server,
                } => self.handle_register(event.sender, name, address, is_name_server),
                NsMessage::DeregisterNameReq { name } => self.handle_deregister(&name),
                NsMessage::QueryNameReq { name } => self.handle_query(event.sender, &name),
                other => {
                    debug!(event_id = other.event_id(), sender = %event.sender, "Ignoring name server message");
                }
            }
        }
        debug!("Name server stopped");
    }

    fn handle_register(self: &Arc<Self>, from: IfcAddr, name: String, address: IfcAddr, is_ns: bool) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let address = router.localize(address);
        let role = {
            let mut table = lock(&self.table);
            if table.entries.contains_key(&name) {
                None
            } else {
                table.entries.insert(
                    name.clone(),
                    NameEntry {
                        address,
                        is_name_server: is_ns,
                    },
                );
                Some(table.role.clone())
            }
        };

        let upstream = match role {
            None => {
                debug!(name = %name, "Name already registered");
                self.reply(
                    from,
                    NsMessage::RegisterNameReply {
                        ok: false,
                        domain: String::new(),
                    },
                );
                return;
            }
            Some(NameServerRole::StubResolver { upstream }) => upstream,
            Some(_) => {
                debug!(name = %name, addr = %address, "Name registered");
                self.reply(
                    from,
                    NsMessage::RegisterNameReply {
                        ok: true,
                        domain: self.domain(),
                    },
                );
                self.announce();
                return;
            }
        };

        let ns = self.clone();
        tokio::spawn(async move {
            let global = router.global_address(address);
            let timeout = Self::request_timeout(&router);
            let result =
                client::register(&router, upstream, &name, global, is_ns, Some(timeout)).await;
            match result {
                Ok(domain) => {
                    debug!(name = %name, addr = %global, "Name registered upstream");
                    ns.reply(from, NsMessage::RegisterNameReply { ok: true, domain });
                    ns.announce();
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "Upstream registration failed, rolling back");
                    {
                        let mut table = lock(&ns.table);
                        if table.entries.get(&name).is_some_and(|e| e.address == address) {
                            table.entries.remove(&name);
                        }
                    }
                    ns.reply(
                        from,
                        NsMessage::RegisterNameReply {
                            ok: false,
                            domain: String::new(),
                        },
                    );
                }
            }
        });
    }

    fn handle_deregister(&self, name: &str) {
        let (removed, role) = {
            let mut table = lock(&self.table);
            (table.entries.remove(name), table.role.clone())
        };
        if removed.is_none() {
            return;
        }
        debug!(name, "Name deregistered");
        if let NameServerRole::StubResolver { upstream } = role
            && let Some(router) = self.router.upgrade()
        {
            client::deregister(&router, upstream, name);
        }
    }

    fn handle_query(&self, from: IfcAddr, name: &str) {
        let resolution = lock(&self.table).resolve(name);
        let reply = match resolution {
            Resolution::Found(entry) => {
                let address = match self.router.upgrade() {
                    Some(router) => router.global_address(entry.address),
                    None => entry.address,
                };
                NsMessage::QueryNameReply {
                    result: Some((address, entry.is_name_server)),
                }
            }
            Resolution::Redirect(name_server) => NsMessage::RedirectReply { name_server },
            Resolution::NotFound => NsMessage::QueryNameReply { result: None },
        };
        self.reply(from, reply);
    }
}
