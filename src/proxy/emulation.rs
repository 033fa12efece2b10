use crate::prelude::*;

use super::remote::{RemoteConnection, RemoteHandle};
use super::Registry;

use tokio::sync::mpsc;

/// Keeps the cloud fed for a device that is currently offline.
///
/// While no live device session exists for `serial` and a telemetry
/// snapshot is cached, heartbeats and data frames are synthesised from the
/// snapshot on two independent timers.
pub struct Emulator {
    serial: String,
    ctx: Context,
    registry: Registry,
    remote: Option<RemoteHandle>,
    dials: u64,
}

impl Emulator {
    pub fn new(serial: String, ctx: Context, registry: Registry) -> Self {
        Self {
            serial,
            ctx,
            registry,
            remote: None,
            dials: 0,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let intervals = self.ctx.config.emulation();
        info!(
            "emulation for {}: heartbeat every {:?}, data every {:?}",
            self.serial, intervals.heartbeat_interval, intervals.data_interval
        );

        let (tx, mut events) = mpsc::unbounded_channel();
        let t = tx.clone();
        let mut heartbeat = Timer::new("heartbeat", move |g| {
            let _ = t.send(SessionEvent::HeartbeatTick(g));
        });
        let mut data = Timer::new("data", move |g| {
            let _ = tx.send(SessionEvent::DataTick(g));
        });
        heartbeat.start(intervals.heartbeat_interval);
        data.start(intervals.data_interval);

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::HeartbeatTick(g) if heartbeat.is_current(g) => {
                    heartbeat.start(intervals.heartbeat_interval);
                    self.heartbeat();
                }
                SessionEvent::DataTick(g) if data.is_current(g) => {
                    data.start(intervals.data_interval);
                    self.data();
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn heartbeat(&mut self) {
        if self.connect().is_some() {
            if let Some(remote) = &self.remote {
                remote.heartbeat();
            }
        }
    }

    pub fn data(&mut self) {
        if let Some((record, fresh)) = self.connect() {
            if let Some(remote) = &self.remote {
                // the cloud expects a handshake before data
                if fresh {
                    remote.heartbeat();
                }
                remote.data(record);
            }
        }
    }

    /// Ensures a cloud leg exists when emulation applies. Returns the cached
    /// snapshot and whether the leg was just dialed.
    fn connect(&mut self) -> Option<(DeviceRecord, bool)> {
        if self.registry.has_live_device(&self.serial) {
            if self.remote.take().is_some() {
                info!("emulation for {}: device is back, stopping", self.serial);
            }
            return None;
        }

        let Some((family, record)) = self.registry.snapshot(&self.serial) else {
            trace!("emulation for {}: nothing cached yet", self.serial);
            return None;
        };

        let target = family.forward_target(&self.ctx.config);
        if !target.enabled() || self.registry.is_disabled(target.host()) {
            return None;
        }

        let fresh = self.remote.as_ref().map_or(true, RemoteHandle::is_closed);
        if fresh {
            self.dials += 1;
            info!("emulation for {}: dialing {}:{}", self.serial, target.host(), target.port());
            let remote = RemoteConnection::new(
                self.dials,
                family,
                target,
                self.ctx.clone(),
                self.registry.clone(),
                None,
                Some(self.serial.clone()),
            )
            .spawn();
            self.remote = Some(remote);
        }

        Some((record, fresh))
    }
}
