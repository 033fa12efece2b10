use crate::prelude::*;

use super::{flush, tx_notify, with_keepalive, ConnId, Registry, READ_BUF_LEN};

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};

#[derive(Debug)]
pub enum RemoteCommand {
    /// frames from the local leg, rewritten before transmission
    Forward(Bytes),
    Heartbeat,
    Data(DeviceRecord),
    Close,
}

/// Owning handle on a cloud leg. Dropping it closes the leg.
#[derive(Debug)]
pub struct RemoteHandle {
    id: u64,
    tx: UnboundedSender<RemoteCommand>,
}

impl RemoteHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn forward(&self, data: Bytes) -> bool {
        self.tx.send(RemoteCommand::Forward(data)).is_ok()
    }

    pub fn heartbeat(&self) -> bool {
        self.tx.send(RemoteCommand::Heartbeat).is_ok()
    }

    pub fn data(&self, record: DeviceRecord) -> bool {
        self.tx.send(RemoteCommand::Data(record)).is_ok()
    }

    /// The connection task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(RemoteCommand::Close);
    }
}

/// Addresses that would make the proxy talk to itself or its LAN.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || first & 0xfe00 == 0xfc00 // unique local
                || first & 0xffc0 == 0xfe80 // link local
                || v6.to_ipv4_mapped().map_or(false, |v4| is_local_address(IpAddr::V4(v4)))
        }
    }
}

/// The cloud-facing client leg of a forwarded (or emulated) session.
pub struct RemoteConnection {
    id: u64,
    family: Family,
    target: config::Forward,
    ctx: Context,
    registry: Registry,
    local: Option<WeakUnboundedSender<SessionEvent>>,
    serial: Option<String>,
}

impl RemoteConnection {
    pub fn new(
        id: u64,
        family: Family,
        target: config::Forward,
        ctx: Context,
        registry: Registry,
        local: Option<WeakUnboundedSender<SessionEvent>>,
        serial: Option<String>,
    ) -> Self {
        Self {
            id,
            family,
            target,
            ctx,
            registry,
            local,
            serial,
        }
    }

    pub fn spawn(self) -> RemoteHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.id;
        tokio::spawn(self.run(rx));
        RemoteHandle { id, tx }
    }

    fn name(&self) -> String {
        format!(
            "{} cloud {}:{}",
            self.family.name(),
            self.target.host(),
            self.target.port()
        )
    }

    async fn run(self, commands: UnboundedReceiver<RemoteCommand>) {
        let event = match self.connect().await {
            Ok(stream) => {
                self.notify(SessionEvent::RemoteConnected(self.id));
                if let Err(e) = self.serve(stream, commands).await {
                    warn!("{}: {:#}", self.name(), e);
                }
                info!("{}: connection closed", self.name());
                SessionEvent::RemoteClosed(self.id)
            }
            Err(e) => {
                warn!("{}: {:#}", self.name(), e);
                SessionEvent::RemoteFailed(self.id)
            }
        };
        self.notify(event);
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(tx) = self.local.as_ref().and_then(WeakUnboundedSender::upgrade) {
            let _ = tx.send(event);
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let host = self.target.host();
        let dial = self.ctx.config.timeouts().dial;
        let stats = &self.ctx.stats;

        let addrs: Vec<SocketAddr> =
            match tokio::time::timeout(dial, tokio::net::lookup_host((host, self.target.port()))).await {
                Ok(Ok(addrs)) => addrs.collect(),
                Ok(Err(e)) => {
                    stats.count(Counter::DialFailed, format!("{}: {}", self.name(), e));
                    bail!("resolving {}: {}", host, e);
                }
                Err(_) => {
                    stats.count(Counter::DialFailed, format!("{}: resolve timeout", self.name()));
                    bail!("resolving {}: timeout after {:?}", host, dial);
                }
            };
        if addrs.is_empty() {
            stats.count(Counter::DialFailed, format!("{}: no addresses", self.name()));
            bail!("{} resolved to nothing", host);
        }
        let local = addrs.iter().find(|a| is_local_address(a.ip()));
        if let Some(addr) = local.filter(|_| !self.target.allow_local()) {
            self.registry.disable_target(host);
            stats.count(
                Counter::ForwardDisabled,
                format!("{} resolves to {}", host, addr.ip()),
            );
            bail!("{} resolves to local address {}, not forwarding", host, addr.ip());
        }

        info!("{}: connecting", self.name());
        let stream = match tokio::time::timeout(dial, TcpStream::connect(&addrs[..])).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                stats.count(Counter::DialFailed, format!("{}: {}", self.name(), e));
                bail!("connect failed: {}", e);
            }
            Err(_) => {
                stats.count(Counter::DialFailed, format!("{}: connect timeout", self.name()));
                bail!("connect timeout after {:?}", dial);
            }
        };

        let stream = with_keepalive(stream, &self.name())?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("{}: failed to set TCP_NODELAY: {}", self.name(), e);
        }

        info!("{}: connected", self.name());
        Ok(stream)
    }

    async fn serve(&self, stream: TcpStream, commands: UnboundedReceiver<RemoteCommand>) -> Result<()> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut session = Session::new_client(
            self.family,
            self.ctx.clone(),
            &events_tx,
            self.serial.as_deref(),
        );
        let conn = self.registry.register(
            self.family,
            Role::Client,
            events_tx.clone(),
            session.core().idle_limit(),
        );
        self.ctx.stats.inc(Counter::CloudConnCnt);
        session.core_mut().on_rx();

        let result = self.io_loop(stream, &mut session, events, commands, conn).await;

        session.core_mut().close();
        self.registry.unregister(conn);
        self.ctx.stats.dec(Counter::CloudConnCnt);
        result
    }

    async fn io_loop(
        &self,
        stream: TcpStream,
        session: &mut Session,
        mut events: UnboundedReceiver<SessionEvent>,
        mut commands: UnboundedReceiver<RemoteCommand>,
        conn: ConnId,
    ) -> Result<()> {
        let notify = tx_notify(session);
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUF_LEN];

        loop {
            tokio::select! {
                r = reader.read(&mut buf) => {
                    let n = r?;
                    if n == 0 {
                        debug!("{}: closed by peer", self.name());
                        return Ok(());
                    }
                    session.feed(&buf[..n]);
                    self.registry.touch(conn, session.core().idle_limit());
                }
                Some(event) = events.recv() => session.handle_event(event),
                command = commands.recv() => match command {
                    Some(RemoteCommand::Forward(data)) => session.forward_in(&data),
                    Some(RemoteCommand::Heartbeat) => session.send_heartbeat(),
                    Some(RemoteCommand::Data(record)) => session.send_data(&record),
                    Some(RemoteCommand::Close) | None => {
                        debug!("{}: local leg closed", self.name());
                        session.core_mut().close();
                    }
                },
                _ = notify.notified() => {}
            }

            self.publish(session);
            flush(session, &mut writer).await?;
            if session.core().is_closed() {
                return Ok(());
            }
        }
    }

    /// Hands frames for the device to the local leg.
    fn publish(&self, session: &mut Session) {
        let fwd = &mut session.core_mut().fwd;
        if fwd.is_empty() {
            return;
        }
        let data = fwd.get_all();
        match self.local.as_ref().and_then(WeakUnboundedSender::upgrade) {
            Some(tx) => {
                let _ = tx.send(SessionEvent::FromRemote(data));
            }
            None => trace!("{}: no local leg, dropping {} bytes", self.name(), data.len()),
        }
    }
}
