//! Name server client.
//!
//! Each exchange runs on a temporary queue connected to the server. The
//! connection subscribes to the server's registration broadcasts and
//! monitors the server, so that a vanished server ends the exchange.

use super::NameServerError;
use crate::address::IfcAddr;
use crate::protocol::{NsCodec, NsMessage, NAME_REGISTERED_IND};
use crate::queue::{Queue, RemoteInterface};
use crate::router::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

struct Session {
    queue: Queue<NsMessage>,
    server: RemoteInterface<NsMessage>,
}

impl Session {
    fn open(router: &Arc<Router>, name_server: IfcAddr) -> Result<Self, NameServerError> {
        let queue = Queue::new(router);
        let server = queue
            .connect_interface(name_server, NsCodec)
            .map_err(|_| NameServerError::Unavailable)?;
        server.subscribe(NAME_REGISTERED_IND);
        server.monitor(NsMessage::Quit);
        Ok(Self { queue, server })
    }

    fn send(&self, request: &NsMessage) -> Result<(), NameServerError> {
        if self.server.send(request) {
            Ok(())
        } else {
            Err(NameServerError::Unavailable)
        }
    }

    /// Next message from the server, or `None` once `deadline` passed.
    async fn next(&self, deadline: Option<Instant>) -> Option<NsMessage> {
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.queue.read_message(timeout).await.map(|e| e.body)
    }
}

/// Register `name` for `address` with the server at `name_server`.
///
/// Returns the domain path of the server that accepted the name.
pub(crate) async fn register(
    router: &Arc<Router>,
    name_server: IfcAddr,
    name: &str,
    address: IfcAddr,
    is_name_server: bool,
    timeout: Option<Duration>,
) -> Result<String, NameServerError> {
    let session = Session::open(router, name_server)?;
    session.send(&NsMessage::RegisterNameReq {
        name: name.to_string(),
        address,
        is_name_server,
    })?;

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        match session.next(deadline).await {
            None => return Err(NameServerError::Timeout),
            Some(NsMessage::RegisterNameReply { ok: true, domain }) => return Ok(domain),
            Some(NsMessage::RegisterNameReply { ok: false, .. }) => {
                return Err(NameServerError::NameInUse(name.to_string()));
            }
            Some(NsMessage::Quit) => return Err(NameServerError::Unavailable),
            Some(other) => trace!(message = ?other, "Ignoring while registering"),
        }
    }
}

/// Withdraw `name` from the server at `name_server`. Fire-and-forget.
pub(crate) fn deregister(router: &Arc<Router>, name_server: IfcAddr, name: &str) {
    let queue: Queue<NsMessage> = Queue::new(router);
    if let Ok(server) = queue.connect_interface(name_server, NsCodec) {
        server.send(&NsMessage::DeregisterNameReq {
            name: name.to_string(),
        });
    }
}

/// Resolve `name`, starting at the server at `name_server`.
///
/// Follows at most `max_redirects` redirects. A name that is not (yet)
/// registered is retried whenever the server announces a registration,
/// until `timeout` expires (`None` waits forever).
pub(crate) async fn lookup(
    router: &Arc<Router>,
    name_server: IfcAddr,
    name: &str,
    timeout: Option<Duration>,
    max_redirects: u32,
) -> Option<(IfcAddr, bool)> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let query = NsMessage::QueryNameReq {
        name: name.to_string(),
    };

    let mut session = Session::open(router, name_server).ok()?;
    session.send(&query).ok()?;
    let mut redirects = 0;

    loop {
        match session.next(deadline).await? {
            NsMessage::QueryNameReply { result: Some(found) } => return Some(found),
            NsMessage::QueryNameReply { result: None } => {
                trace!(name, "Name not registered yet, waiting");
            }
            NsMessage::NameRegisteredInd => session.send(&query).ok()?,
            NsMessage::RedirectReply { name_server } => {
                redirects += 1;
                if redirects > max_redirects {
                    debug!(name, redirects, "Too many redirects");
                    return None;
                }
                trace!(name, name_server = %name_server, "Redirected");
                session = Session::open(router, name_server).ok()?;
                session.send(&query).ok()?;
            }
            NsMessage::Quit => return None,
            other => trace!(message = ?other, "Ignoring while resolving"),
        }
    }
}
