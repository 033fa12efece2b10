pub mod solarman;
pub mod talent;

use crate::infos::register_map::{MODBUS_POLL_COUNT, MODBUS_POLL_START};
use crate::prelude::*;

pub use self::solarman::SolarmanConnection;
pub use self::talent::TalentConnection;

use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    Talent,
    Solarman,
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Family::Talent => "talent",
            Family::Solarman => "solarman",
        }
    }

    pub fn forward_target(&self, config: &ConfigWrapper) -> config::Forward {
        match self {
            Family::Talent => config.tsun(),
            Family::Solarman => config.solarman(),
        }
    }
}

/// Server role accepts the device; client role dials the cloud.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Received,
    Pend,
    Up,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Unchecked,
    Accepted,
    Rejected,
}

/// Everything that can wake a connection task besides socket I/O.
#[derive(Debug)]
pub enum SessionEvent {
    IdleTimeout(u64),
    ModbusTimeout(u64),
    ModbusPoll(u64),
    HeartbeatTick(u64),
    DataTick(u64),
    /// frames from the paired leg, to be rewritten and sent on this one
    FromRemote(Bytes),
    RemoteConnected(u64),
    RemoteClosed(u64),
    RemoteFailed(u64),
    Command(Command),
    ResetDaily,
    Close { graceful: bool },
}

/// Process-wide collaborators every connection needs.
#[derive(Clone)]
pub struct Context {
    pub config: ConfigWrapper,
    pub stats: Arc<ProtocolStats>,
}

impl Context {
    pub fn new(config: ConfigWrapper, stats: Arc<ProtocolStats>) -> Self {
        Self { config, stats }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// {{{ ConnectionCore
/// Protocol-independent connection state: buffers, admission, telemetry,
/// the Modbus tunnel and the timers driving it.
pub struct ConnectionCore {
    pub family: Family,
    pub role: Role,
    pub state: State,
    pub unique_id: Option<String>,
    pub admission: Admission,
    pub device: Option<config::Device>,
    pub node_id: String,
    pub rx: ByteFifo,
    pub tx: ByteFifo,
    pub fwd: ByteFifo,
    pub db: DeviceRecord,
    pub tunnel: ModbusTunnel,
    ctx: Context,
    idle_timer: Timer,
    modbus_timer: Timer,
    poll_timer: Timer,
    outbox: Vec<mqtt::ChannelData>,
    counted: bool,
}

impl ConnectionCore {
    pub fn new(family: Family, role: Role, ctx: Context, events: &UnboundedSender<SessionEvent>) -> Self {
        let retries = ctx.config.modbus().retries;

        let tx = events.clone();
        let idle_timer = Timer::new("idle", move |g| {
            let _ = tx.send(SessionEvent::IdleTimeout(g));
        });
        let tx = events.clone();
        let modbus_timer = Timer::new("modbus", move |g| {
            let _ = tx.send(SessionEvent::ModbusTimeout(g));
        });
        let tx = events.clone();
        let poll_timer = Timer::new("poll", move |g| {
            let _ = tx.send(SessionEvent::ModbusPoll(g));
        });

        Self {
            family,
            role,
            state: State::Init,
            unique_id: None,
            admission: Admission::Unchecked,
            device: None,
            node_id: String::new(),
            rx: ByteFifo::new(),
            tx: ByteFifo::new(),
            fwd: ByteFifo::new(),
            db: DeviceRecord::new(),
            tunnel: ModbusTunnel::new(retries),
            ctx,
            idle_timer,
            modbus_timer,
            poll_timer,
            outbox: Vec::new(),
            counted: false,
        }
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.ctx.stats
    }

    pub fn config(&self) -> &ConfigWrapper {
        &self.ctx.config
    }

    pub fn name(&self) -> String {
        format!(
            "{}/{:?}/{}",
            self.family.name(),
            self.role,
            self.unique_id.as_deref().unwrap_or("-")
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn admitted(&self) -> bool {
        self.admission == Admission::Accepted
    }

    pub fn idle_limit(&self) -> Duration {
        let t = self.ctx.config.timeouts();
        match (self.state, self.role) {
            (State::Init, _) => t.start,
            (_, Role::Server) => t.device_idle,
            (_, Role::Client) => t.cloud_idle,
        }
    }

    /// Re-arms the idle timer; called for every received chunk.
    pub fn on_rx(&mut self) {
        if self.is_closed() {
            return;
        }
        let limit = self.idle_limit();
        self.idle_timer.start(limit);
    }

    pub fn on_idle_timeout(&mut self, generation: u64) -> bool {
        if !self.idle_timer.is_current(generation) {
            return false;
        }
        info!("{}: no data for {:?}, closing", self.name(), self.idle_limit());
        self.close();
        true
    }

    /// Admission check for the serial carried by a frame.
    ///
    /// Returns false when the frame must be dropped.
    pub fn check_serial(&mut self, serial: &str) -> bool {
        if self.is_closed() {
            return false;
        }

        if self.role == Role::Client {
            if self.unique_id.is_none() && !serial.is_empty() {
                self.unique_id = Some(serial.to_owned());
            }
        } else if self.unique_id.as_deref() != Some(serial) {
            self.admit(serial);
        }

        if self.admission == Admission::Rejected {
            self.ctx.stats.count(Counter::UnknownSnr, serial);
            return false;
        }

        if self.state == State::Init {
            self.set_state(State::Received);
        }
        true
    }

    fn admit(&mut self, serial: &str) {
        if let Some(old) = &self.unique_id {
            warn!("{}: serial changed from {} to {}", self.name(), old, serial);
        }
        self.unique_id = Some(serial.to_owned());

        match self.ctx.config.device_config(serial) {
            Some((key, device)) => {
                self.node_id = device.node_id(&key);
                info!(
                    "{}: accepted, node {} area '{}' polling {}",
                    self.name(),
                    self.node_id,
                    device.suggested_area(),
                    device.modbus_polling()
                );
                self.device = Some(device);
                self.admission = Admission::Accepted;
            }
            None if self.ctx.config.allow_unknown() => {
                self.node_id = format!("{}/", serial);
                info!("{}: unknown serial accepted (allow_unknown)", self.name());
                self.device = None;
                self.admission = Admission::Accepted;
            }
            None => {
                warn!("{}: serial {} not configured, dropping its frames", self.name(), serial);
                self.device = None;
                self.admission = Admission::Rejected;
                return;
            }
        }

        if !self.counted {
            self.counted = true;
            self.ctx.stats.inc(Counter::InverterCnt);
        }
        self.outbox.push(mqtt::ChannelData::Discovery {
            unique_id: serial.to_owned(),
            node_id: self.node_id.clone(),
            suggested_area: self
                .device
                .as_ref()
                .map(|d| d.suggested_area().to_owned())
                .unwrap_or_default(),
        });
    }

    pub fn set_state(&mut self, state: State) {
        if self.state == state || self.is_closed() {
            return;
        }
        debug!("{}: {:?} -> {:?}", self.name(), self.state, state);
        self.state = state;

        if state == State::Up && self.role == Role::Server && self.polling_enabled() {
            let first = self.ctx.config.modbus().first_poll;
            self.poll_timer.start(first);
        }
    }

    fn polling_enabled(&self) -> bool {
        self.device.as_ref().map_or(false, |d| d.modbus_polling())
    }

    /// Queues bytes for this leg's peer and wakes the writer.
    pub fn send(&mut self, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.tx.append(data);
        self.tx.trigger();
    }

    /// Queues a received frame for the paired leg.
    pub fn forward(&mut self, raw: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.fwd.append(raw);
    }

    pub fn frame_error(&mut self, e: &FrameError) {
        let counter = if e.is_data_type() {
            Counter::InvalidDataType
        } else {
            Counter::InvalidMsgFormat
        };
        warn!("{}: {}", self.name(), e);
        self.ctx.stats.count(counter, format!("{}: {}", self.name(), e));
    }

    /// Unexpected failure while dispatching: fatal for this connection only.
    pub fn internal_error(&mut self, e: anyhow::Error) {
        error!("{}: {:#}", self.name(), e);
        self.ctx.stats.count(Counter::SwException, format!("{}: {}", self.name(), e));
        self.close();
    }

    // {{{ modbus
    /// Issues a command. Returns the PDU to transmit now, if any.
    pub fn modbus_request(&mut self, func: u8, reg: u16, value: u16) -> Option<Vec<u8>> {
        if self.state != State::Up {
            debug!("{}: not up, modbus command suppressed", self.name());
            return None;
        }
        self.ctx.stats.inc(Counter::ModbusCmds);
        let pdu = self.tunnel.build_msg(func, reg, value)?;
        self.start_modbus_timer();
        Some(pdu)
    }

    pub fn on_modbus_resp(&mut self, pdu: &[u8]) -> Option<Vec<u8>> {
        match self.tunnel.recv_resp(pdu) {
            Ok(resp) => {
                self.modbus_timer.stop();
                if let Some(code) = resp.exception {
                    self.ctx
                        .stats
                        .count(Counter::ModbusException, format!("{}: code {}", self.name(), code));
                }
                let n = self.db.apply(resp.values);
                trace!("{}: modbus response, {} values changed", self.name(), n);
                if resp.next.is_some() {
                    self.start_modbus_timer();
                }
                resp.next
            }
            Err(e) => {
                warn!("{}: modbus {}", self.name(), e);
                self.ctx.stats.count(e.counter(), format!("{}: {}", self.name(), e));
                None
            }
        }
    }

    /// A Modbus request passed through from the cloud. Returns true when
    /// `frame` may go to the device now.
    pub fn cloud_modbus(&mut self, pdu: &[u8], frame: &[u8]) -> bool {
        match self.tunnel.cloud_req(pdu, frame) {
            Ok(true) => {
                self.start_modbus_timer();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("{}: cloud modbus request: {}", self.name(), e);
                self.ctx.stats.count(e.counter(), format!("{}: {}", self.name(), e));
                true
            }
        }
    }

    /// The device answered the cloud's request; returns our next PDU, if any.
    pub fn on_cloud_resp(&mut self) -> Option<Vec<u8>> {
        self.modbus_timer.stop();
        let next = self.tunnel.cloud_done();
        if next.is_some() {
            self.start_modbus_timer();
        }
        next
    }

    /// Next held cloud frame, once the device link is free.
    pub fn release_held(&mut self) -> Option<Vec<u8>> {
        let frame = self.tunnel.release_held()?;
        self.start_modbus_timer();
        Some(frame)
    }

    pub fn on_modbus_timeout(&mut self, generation: u64) -> Option<Vec<u8>> {
        if !self.modbus_timer.is_current(generation) {
            return None;
        }
        self.ctx.stats.inc(Counter::ModbusTimeout);
        match self.tunnel.on_timeout() {
            modbus::Timeout::Retransmit(pdu) | modbus::Timeout::Abandoned(Some(pdu)) => {
                self.start_modbus_timer();
                Some(pdu)
            }
            modbus::Timeout::Abandoned(None) | modbus::Timeout::Idle => None,
        }
    }

    pub fn on_poll(&mut self, generation: u64) -> Option<Vec<u8>> {
        if !self.poll_timer.is_current(generation) {
            return None;
        }
        let interval = self.ctx.config.modbus().poll_interval;
        self.poll_timer.start(interval);
        self.modbus_request(modbus::READ_INPUT_REGS, MODBUS_POLL_START, MODBUS_POLL_COUNT)
    }

    fn start_modbus_timer(&mut self) {
        let timeout = self.ctx.config.modbus().timeout;
        self.modbus_timer.start(timeout);
    }
    // }}}

    /// Moves changed telemetry to the outbox once the device is up.
    pub fn publish_changes(&mut self) {
        if self.role != Role::Server || self.state != State::Up || !self.admitted() {
            return;
        }
        if !self.db.has_changes() {
            return;
        }
        let changes = self.db.take_changed();
        self.outbox.extend(
            mqtt::Message::for_changes(&self.node_id, changes)
                .into_iter()
                .map(mqtt::ChannelData::Message),
        );
    }

    pub fn take_outbox(&mut self) -> Vec<mqtt::ChannelData> {
        std::mem::take(&mut self.outbox)
    }

    pub fn reset_daily(&mut self) {
        let n = self.db.reset_daily();
        if n > 0 {
            info!("{}: {} daily registers reset", self.name(), n);
            self.publish_changes();
        }
    }

    /// Idempotent; stops every timer and drops buffered data.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        debug!("{}: closing", self.name());
        self.state = State::Closed;
        self.idle_timer.close();
        self.modbus_timer.close();
        self.poll_timer.close();
        self.tunnel.clear();
        self.rx.clear();
        self.fwd.clear();
        if self.counted {
            self.counted = false;
            self.ctx.stats.dec(Counter::InverterCnt);
        }
    }
} // }}}

// {{{ Protocol
/// Per-family framing and dispatch on top of [`ConnectionCore`].
#[enum_dispatch]
pub trait Protocol {
    fn core(&self) -> &ConnectionCore;

    fn core_mut(&mut self) -> &mut ConnectionCore;

    /// Decodes and dispatches every complete frame buffered in `rx`.
    fn read(&mut self);

    /// Sends frames that arrived on the paired leg, rewriting headers for
    /// this leg.
    fn forward_in(&mut self, raw: &[u8]);

    fn send_modbus(&mut self, pdu: &[u8]);

    /// Sends the next held cloud Modbus request once the device link is free.
    fn release_held(&mut self);

    /// Emulation: keep-alive toward the cloud.
    fn send_heartbeat(&mut self);

    /// Emulation: a data frame synthesised from cached telemetry.
    fn send_data(&mut self, record: &DeviceRecord);
}

#[enum_dispatch(Protocol)]
pub enum Session {
    Talent(TalentConnection),
    Solarman(SolarmanConnection),
}

impl Session {
    pub fn new(family: Family, role: Role, ctx: Context, events: &UnboundedSender<SessionEvent>) -> Self {
        match family {
            Family::Talent => Session::Talent(TalentConnection::new(role, ctx, events)),
            Family::Solarman => Session::Solarman(SolarmanConnection::new(role, ctx, events)),
        }
    }

    /// Client leg that speaks for `serial` (emulation needs the identity
    /// before any frame was seen).
    pub fn new_client(
        family: Family,
        ctx: Context,
        events: &UnboundedSender<SessionEvent>,
        serial: Option<&str>,
    ) -> Self {
        let mut session = Self::new(family, Role::Client, ctx, events);
        if let Some(serial) = serial {
            session.set_identity(serial);
        }
        session
    }

    fn set_identity(&mut self, serial: &str) {
        match self {
            Session::Talent(c) => c.core_mut().unique_id = Some(serial.to_owned()),
            Session::Solarman(c) => c.set_serial(serial),
        }
    }

    pub fn family(&self) -> Family {
        self.core().family
    }

    /// Appends received bytes and runs the dispatch loop.
    pub fn feed(&mut self, data: &[u8]) {
        if self.core().is_closed() {
            return;
        }
        let core = self.core_mut();
        core.rx.append(data);
        core.on_rx();
        self.read();
        self.core_mut().publish_changes();
    }

    /// Handles session-local events. Pairing events belong to the
    /// forwarding engine and are ignored here.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IdleTimeout(g) => {
                self.core_mut().on_idle_timeout(g);
            }
            SessionEvent::ModbusTimeout(g) => {
                if let Some(pdu) = self.core_mut().on_modbus_timeout(g) {
                    self.send_modbus(&pdu);
                }
                self.release_held();
            }
            SessionEvent::ModbusPoll(g) => {
                if let Some(pdu) = self.core_mut().on_poll(g) {
                    self.send_modbus(&pdu);
                }
            }
            SessionEvent::Command(cmd) => {
                info!("{}: command {:?}", self.core().name(), cmd);
                if let Some(pdu) = self.core_mut().modbus_request(cmd.func(), cmd.register(), cmd.value()) {
                    self.send_modbus(&pdu);
                }
            }
            SessionEvent::FromRemote(raw) => self.forward_in(&raw),
            SessionEvent::ResetDaily => self.core_mut().reset_daily(),
            SessionEvent::Close { graceful } => {
                if !graceful {
                    self.core_mut().tx.clear();
                }
                self.core_mut().close();
            }
            other => trace!("{}: ignoring {:?}", self.core().name(), other),
        }
        self.core_mut().publish_changes();
    }
}
// }}}
