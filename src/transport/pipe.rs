//! In-Process Pipe Transport
//!
//! Two connected ends backed by unbounded channels. Packets sent before the
//! peer end starts are buffered. Stopping one end hangs up the other.
//! A pipe end cannot be restarted once stopped.

use super::{PortTransport, TransportError, TransportState};
use crate::packet::Packet;
use crate::port::PortLink;
use crate::utils::lock;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

enum Signal {
    Packet(Packet),
    Hangup,
}

struct PipeState {
    state: TransportState,
    inbound: Option<mpsc::UnboundedReceiver<Signal>>,
    task: Option<JoinHandle<()>>,
}

/// One end of an in-process pipe.
pub struct PipeTransport {
    name: String,
    outbound: mpsc::UnboundedSender<Signal>,
    inner: Mutex<PipeState>,
}

impl PipeTransport {
    /// Create a connected pair of pipe ends.
    pub fn pair() -> (PipeTransport, PipeTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::end("pipe/a", b_tx, a_rx), Self::end("pipe/b", a_tx, b_rx))
    }

    fn end(
        name: &str,
        outbound: mpsc::UnboundedSender<Signal>,
        inbound: mpsc::UnboundedReceiver<Signal>,
    ) -> Self {
        Self {
            name: name.to_string(),
            outbound,
            inner: Mutex::new(PipeState {
                state: TransportState::Configured,
                inbound: Some(inbound),
                task: None,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        lock(&self.inner).state
    }
}

#[async_trait]
impl PortTransport for PipeTransport {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn start(&self, link: PortLink) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if !inner.state.can_start() {
            return Err(TransportError::AlreadyStarted);
        }
        let mut inbound = inner.inbound.take().ok_or(TransportError::AlreadyStarted)?;
        inner.state = TransportState::Up;

        let name = self.name.clone();
        inner.task = Some(tokio::spawn(async move {
            if !link.connected() {
                debug!(pipe = %name, "Port refused the link");
                return;
            }
            while let Some(signal) = inbound.recv().await {
                match signal {
                    Signal::Packet(packet) => link.received_packet(packet),
                    Signal::Hangup => break,
                }
            }
            debug!(pipe = %name, "Pipe peer hung up");
            link.disconnected();
        }));
        Ok(())
    }

    async fn stop(&self) {
        let task = {
            let mut inner = lock(&self.inner);
            if !inner.state.is_operational() {
                return;
            }
            inner.state = TransportState::Down;
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        let _ = self.outbound.send(Signal::Hangup);
        debug!(pipe = %self.name, "Pipe stopped");
    }

    fn transmit(&self, packet: Packet) -> Result<(), TransportError> {
        if !lock(&self.inner).state.is_operational() {
            return Err(TransportError::NotStarted);
        }
        self.outbound
            .send(Signal::Packet(packet))
            .map_err(|_| TransportError::SendFailed("pipe closed".into()))
    }
}
