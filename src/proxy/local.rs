use crate::prelude::*;

use super::forward::ForwardingEngine;
use super::{flush, tx_notify, ConnId, Registry, READ_BUF_LEN};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// One accepted device connection, driven by its own task.
pub struct LocalSession<S> {
    stream: S,
    peer: String,
    family: Family,
    ctx: Context,
    channels: Channels,
    registry: Registry,
}

impl<S> LocalSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: String,
        family: Family,
        ctx: Context,
        channels: Channels,
        registry: Registry,
    ) -> Self {
        Self {
            stream,
            peer,
            family,
            ctx,
            channels,
            registry,
        }
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            stream,
            peer,
            family,
            ctx,
            channels,
            registry,
        } = self;

        info!("{}: {} device connected", peer, family.name());

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut session = Session::new(family, Role::Server, ctx.clone(), &events_tx);
        let mut engine = ForwardingEngine::new(family, ctx, registry.clone(), &events_tx);
        let conn = registry.register(family, Role::Server, events_tx.clone(), session.core().idle_limit());
        drop(events_tx);
        session.core_mut().on_rx();

        let mut io = Io {
            peer: &peer,
            channels: &channels,
            registry: &registry,
            conn,
            stored: None,
        };
        let result = io.run(stream, &mut session, &mut engine, events).await;

        engine.close();
        session.core_mut().close();
        io.after_dispatch(&mut session, &mut engine);
        registry.unregister(conn);
        info!("{}: {} disconnected", peer, session.core().name());

        result
    }
}

struct Io<'a> {
    peer: &'a str,
    channels: &'a Channels,
    registry: &'a Registry,
    conn: ConnId,
    /// Record revision last copied into the registry.
    stored: Option<u64>,
}

impl Io<'_> {
    async fn run<S>(
        &mut self,
        stream: S,
        session: &mut Session,
        engine: &mut ForwardingEngine,
        mut events: UnboundedReceiver<SessionEvent>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let notify = tx_notify(session);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; READ_BUF_LEN];

        loop {
            tokio::select! {
                r = reader.read(&mut buf) => {
                    let n = r?;
                    if n == 0 {
                        debug!("{}: closed by peer", self.peer);
                        return Ok(());
                    }
                    trace!("{}: RX {} bytes\n{}", self.peer, n, crate::byte_fifo::to_hex(&buf[..n]));
                    session.feed(&buf[..n]);
                    self.registry.touch(self.conn, session.core().idle_limit());
                }
                Some(event) = events.recv() => {
                    if !engine.on_event(&event) {
                        if let SessionEvent::Close { graceful } = event {
                            debug!("{}: close requested (graceful {})", self.peer, graceful);
                        }
                        session.handle_event(event);
                    }
                }
                _ = notify.notified() => {}
            }

            self.after_dispatch(session, engine);
            flush(session, &mut writer).await?;
            if session.core().is_closed() {
                return Ok(());
            }
        }
    }

    /// Moves everything a dispatch produced out of the session: frames for
    /// the cloud, bus messages, the telemetry snapshot.
    fn after_dispatch(&mut self, session: &mut Session, engine: &mut ForwardingEngine) {
        let family = session.family();
        let core = session.core_mut();

        if !core.fwd.is_empty() {
            let data = core.fwd.get_all();
            engine.push(data, core.unique_id.as_deref());
        }

        for data in core.take_outbox() {
            if self.channels.to_mqtt.send(data).is_err() {
                trace!("{}: to_mqtt has no receivers", self.peer);
            }
        }

        if let Some(unique_id) = core.unique_id.as_deref() {
            self.registry.set_unique_id(self.conn, Some(unique_id));
            let revision = core.db.revision();
            if core.admitted() && self.stored != Some(revision) {
                self.registry.store_snapshot(unique_id, family, &core.db);
                self.stored = Some(revision);
            }
        }
    }
}
