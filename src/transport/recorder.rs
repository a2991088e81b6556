//! Recording transport for unit tests.
//!
//! Keeps every transmitted packet and exposes the port link so tests can
//! inject inbound packets and link events by hand.

use super::{PortTransport, TransportError};
use crate::packet::Packet;
use crate::port::PortLink;
use crate::utils::lock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    sent: Arc<Mutex<Vec<Packet>>>,
    link: Arc<Mutex<Option<PortLink>>>,
    /// Delivered right after the link comes up.
    greeting: Option<Packet>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Transport that hands `packet` to the port as soon as it starts.
    pub(crate) fn greeting(packet: Packet) -> Self {
        Self {
            greeting: Some(packet),
            ..Self::default()
        }
    }

    /// Take all packets transmitted so far.
    pub(crate) fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub(crate) fn link(&self) -> PortLink {
        lock(&self.link).clone().expect("transport not started")
    }

    /// Inject an inbound packet.
    pub(crate) fn inject(&self, packet: Packet) {
        self.link().received_packet(packet);
    }
}

#[async_trait]
impl PortTransport for RecordingTransport {
    fn describe(&self) -> String {
        "recorder".into()
    }

    async fn start(&self, link: PortLink) -> Result<(), TransportError> {
        *lock(&self.link) = Some(link.clone());
        if !link.connected() {
            return Err(TransportError::StartFailed("link refused".into()));
        }
        if let Some(packet) = &self.greeting {
            link.received_packet(packet.clone());
        }
        Ok(())
    }

    async fn stop(&self) {}

    fn transmit(&self, packet: Packet) -> Result<(), TransportError> {
        lock(&self.sent).push(packet);
        Ok(())
    }
}
