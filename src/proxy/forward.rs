use crate::prelude::*;

use super::remote::{RemoteConnection, RemoteHandle};
use super::Registry;

use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    Pairing,
    Paired,
    Closed,
}

/// Couples a device leg to its cloud leg.
///
/// The cloud leg is dialed lazily on the first forwardable frame. Frames
/// pushed while the dial is in flight wait in the handle's queue. When the
/// cloud leg goes away only the handle is dropped; the next frame re-dials.
pub struct ForwardingEngine {
    family: Family,
    ctx: Context,
    registry: Registry,
    local: WeakUnboundedSender<SessionEvent>,
    remote: Option<RemoteHandle>,
    state: PairState,
    dials: u64,
}

impl ForwardingEngine {
    pub fn new(
        family: Family,
        ctx: Context,
        registry: Registry,
        local: &UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            family,
            ctx,
            registry,
            local: local.downgrade(),
            remote: None,
            state: PairState::Unpaired,
            dials: 0,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn dials(&self) -> u64 {
        self.dials
    }

    /// Sends device frames toward the cloud, dialing first if needed.
    pub fn push(&mut self, data: Bytes, serial: Option<&str>) {
        if data.is_empty() || self.state == PairState::Closed {
            return;
        }

        let target = self.family.forward_target(&self.ctx.config);
        if !target.enabled() {
            trace!("{} forwarding off, dropping {} bytes", self.family.name(), data.len());
            return;
        }
        if self.registry.is_disabled(target.host()) {
            trace!("forwarding to {} disabled, dropping {} bytes", target.host(), data.len());
            return;
        }

        if self.remote.as_ref().map_or(true, RemoteHandle::is_closed) {
            self.dial(target, serial);
        }
        if let Some(remote) = &self.remote {
            if !remote.forward(data) {
                debug!("{} cloud leg gone, frame dropped", self.family.name());
            }
        }
    }

    fn dial(&mut self, target: config::Forward, serial: Option<&str>) {
        self.dials += 1;
        debug!(
            "{}: dialing {}:{} (attempt {})",
            self.family.name(),
            target.host(),
            target.port(),
            self.dials
        );
        let remote = RemoteConnection::new(
            self.dials,
            self.family,
            target,
            self.ctx.clone(),
            self.registry.clone(),
            Some(self.local.clone()),
            serial.map(str::to_owned),
        );
        self.remote = Some(remote.spawn());
        self.state = PairState::Pairing;
    }

    /// Consumes pairing events. Returns false for events meant for the
    /// session itself.
    pub fn on_event(&mut self, event: &SessionEvent) -> bool {
        match *event {
            SessionEvent::RemoteConnected(id) => {
                if self.is_current(id) && self.state == PairState::Pairing {
                    self.state = PairState::Paired;
                }
                true
            }
            SessionEvent::RemoteClosed(id) | SessionEvent::RemoteFailed(id) => {
                if self.is_current(id) {
                    self.remote = None;
                    if self.state != PairState::Closed {
                        self.state = PairState::Unpaired;
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, id: u64) -> bool {
        self.remote.as_ref().map_or(false, |r| r.id() == id)
    }

    /// Closes the cloud leg along with the local one.
    pub fn close(&mut self) {
        self.remote = None;
        self.state = PairState::Closed;
    }
}
