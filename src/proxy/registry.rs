use crate::prelude::*;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

pub type ConnId = u64;

struct Entry {
    family: Family,
    role: Role,
    unique_id: Option<String>,
    last_rx: Instant,
    idle_limit: Duration,
    events: UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnId,
    entries: HashMap<ConnId, Entry>,
    snapshots: HashMap<String, (Family, DeviceRecord)>,
    disabled: HashSet<String>,
}

/// Table of live connections shared by every session task.
///
/// The lock is only ever held for short sections without await points.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    pub fn register(
        &self,
        family: Family,
        role: Role,
        events: UnboundedSender<SessionEvent>,
        idle_limit: Duration,
    ) -> ConnId {
        self.with(|inner| {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.entries.insert(
                id,
                Entry {
                    family,
                    role,
                    unique_id: None,
                    last_rx: Instant::now(),
                    idle_limit,
                    events,
                },
            );
            debug!("registry: +{} {} {:?} ({} live)", id, family.name(), role, inner.entries.len());
            id
        })
    }

    pub fn unregister(&self, id: ConnId) {
        self.with(|inner| {
            if inner.entries.remove(&id).is_some() {
                debug!("registry: -{} ({} live)", id, inner.entries.len());
            }
        })
    }

    pub fn touch(&self, id: ConnId, idle_limit: Duration) {
        self.with(|inner| {
            if let Some(e) = inner.entries.get_mut(&id) {
                e.last_rx = Instant::now();
                e.idle_limit = idle_limit;
            }
        })
    }

    pub fn set_unique_id(&self, id: ConnId, unique_id: Option<&str>) {
        self.with(|inner| {
            if let Some(e) = inner.entries.get_mut(&id) {
                if e.unique_id.as_deref() != unique_id {
                    e.unique_id = unique_id.map(str::to_owned);
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.with(|inner| inner.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every live connection has seen traffic within its idle limit.
    pub fn healthy(&self) -> bool {
        self.with(|inner| {
            inner.entries.iter().all(|(id, e)| {
                let ok = e.last_rx.elapsed() <= e.idle_limit;
                if !ok {
                    warn!(
                        "registry: {} {} {:?} {} unhealthy",
                        id,
                        e.family.name(),
                        e.role,
                        e.unique_id.as_deref().unwrap_or("-")
                    );
                }
                ok
            })
        })
    }

    /// Asks every live connection to close. Returns how many were asked.
    pub fn disconnect_all(&self, graceful: bool) -> usize {
        self.broadcast(|| SessionEvent::Close { graceful })
    }

    pub fn broadcast(&self, event: impl Fn() -> SessionEvent) -> usize {
        self.with(|inner| {
            inner
                .entries
                .values()
                .filter(|e| e.events.send(event()).is_ok())
                .count()
        })
    }

    /// Routes a command to the device-facing session for its serial.
    pub fn send_command(&self, serials: &[String], command: Command) -> bool {
        self.with(|inner| {
            let target = inner.entries.values().find(|e| {
                e.role == Role::Server
                    && e.unique_id.as_ref().map_or(false, |uid| serials.contains(uid))
            });
            match target {
                Some(e) => e.events.send(SessionEvent::Command(command)).is_ok(),
                None => false,
            }
        })
    }

    pub fn has_live_device(&self, unique_id: &str) -> bool {
        self.with(|inner| {
            inner
                .entries
                .values()
                .any(|e| e.role == Role::Server && e.unique_id.as_deref() == Some(unique_id))
        })
    }

    pub fn store_snapshot(&self, unique_id: &str, family: Family, record: &DeviceRecord) {
        if record.is_empty() {
            return;
        }
        self.with(|inner| {
            inner
                .snapshots
                .insert(unique_id.to_owned(), (family, record.clone()));
        })
    }

    pub fn snapshot(&self, unique_id: &str) -> Option<(Family, DeviceRecord)> {
        self.with(|inner| inner.snapshots.get(unique_id).cloned())
    }

    /// Cached snapshots see midnight too, or emulation would replay
    /// yesterday's daily yield.
    pub fn reset_daily_snapshots(&self) {
        self.with(|inner| {
            for (_, record) in inner.snapshots.values_mut() {
                record.reset_daily();
                record.take_changed();
            }
        })
    }

    /// Forwarding to `host` stays off for the rest of the process.
    pub fn disable_target(&self, host: &str) {
        self.with(|inner| {
            if inner.disabled.insert(host.to_owned()) {
                warn!("forwarding to {} disabled", host);
            }
        })
    }

    pub fn is_disabled(&self, host: &str) -> bool {
        self.with(|inner| inner.disabled.contains(host))
    }
}
