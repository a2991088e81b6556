//! ifcbus: an embedded inter-process message bus
//!
//! Processes host one [`Router`] each. Routers link into a tree over
//! [`Port`]s and delegate address space downwards, so every interface in
//! the tree has a unique 64-bit [`IfcAddr`]. Applications own typed
//! [`Queue`]s, register interfaces on them, and exchange events by address
//! or by name through the cooperating [`NameServer`]s.

pub mod address;
pub mod config;
pub mod nameserver;
pub mod packet;
pub mod port;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod transport;
pub mod utils;

// Re-export address types
pub use address::{IfcAddr, INTERFACE_ADDR_SIZE, INTERFACE_BIT};

// Re-export config types
pub use config::{Config, ConfigError, NameServerConfig, RouterConfig, TransportsConfig, UpstreamConfig};

// Re-export packet types
pub use packet::{Packet, PacketType};

// Re-export router types
pub use router::{
    local_router, shutdown_local_router, DownstreamLease, Mailbox, Router, RouterError,
    RouterStats, UpstreamBinding,
};

// Re-export port types
pub use port::{Port, PortError, PortId, PortLink, PortState, PortStats};

// Re-export queue types
pub use queue::{
    CodecError, Event, LocalInterface, Message, MessageCodec, MonitorRef, Queue, QueueError,
    RawCodec, RawMessage, RemoteInterface, TimerRef,
};

// Re-export name server types
pub use nameserver::{NameEntry, NameServer, NameServerError, NameServerRole};

// Re-export transport types
pub use transport::pipe::PipeTransport;
pub use transport::tcp::{TcpListenerService, TcpTransport};
pub use transport::{PortTransport, TransportError, TransportState};

// Re-export protocol types
pub use protocol::{DhcpOffer, ProtocolError};
