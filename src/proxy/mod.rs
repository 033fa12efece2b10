pub mod emulation;
pub mod forward;
pub mod local;
pub mod registry;
pub mod remote;

pub use registry::{ConnId, Registry};

use crate::prelude::*;

use self::emulation::Emulator;
use self::local::LocalSession;

use chrono::{DateTime, Local, TimeZone};
use net2::TcpStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

pub(crate) const READ_BUF_LEN: usize = 4096;

const WRITE_TIMEOUT_SECS: u64 = 5;
const TCP_KEEPALIVE_SECS: u64 = 60;
const STATS_INTERVAL_SECS: u64 = 60;

/// Accepts device connections for both protocol families and runs the
/// process-wide background jobs.
#[derive(Clone)]
pub struct Proxy {
    ctx: Context,
    channels: Channels,
    registry: Registry,
}

impl Proxy {
    pub fn new(ctx: Context, channels: Channels, registry: Registry) -> Self {
        Self {
            ctx,
            channels,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn start(&self) -> Result<()> {
        let proxy = self.ctx.config.proxy();

        let emulators = self
            .ctx
            .config
            .inverters()
            .into_iter()
            .filter(|(_, d)| d.emulation())
            .map(|(key, d)| {
                let serial = d.monitor_sn().map(|sn| sn.to_string()).unwrap_or(key);
                Emulator::new(serial, self.ctx.clone(), self.registry.clone()).run()
            });

        futures::try_join!(
            self.listen(Family::Talent, &proxy.bind, proxy.talent_port),
            self.listen(Family::Solarman, &proxy.bind, proxy.solarman_port),
            self.command_router(),
            self.midnight_reset(),
            self.stats_publisher(),
            futures::future::try_join_all(emulators),
        )?;

        Ok(())
    }

    async fn listen(&self, family: Family, bind: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", bind, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| anyhow!("binding {} listener to {}: {}", family.name(), addr, err))?;
        info!("{} listening on {}", family.name(), addr);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("{} accept failed: {}", family.name(), e);
                    continue;
                }
            };

            // a socket that cannot be set up only costs that connection
            let stream = match with_keepalive(stream, &peer.to_string()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: dropping {} connection: {}", peer, family.name(), e);
                    continue;
                }
            };

            let session = LocalSession::new(
                stream,
                peer.to_string(),
                family,
                self.ctx.clone(),
                self.channels.clone(),
                self.registry.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    warn!("{}: {:#}", peer, e);
                }
            });
        }
    }

    // mqtt -> device sessions
    async fn command_router(&self) -> Result<()> {
        let mut receiver = self.channels.from_mqtt.subscribe();

        loop {
            match receiver.recv().await {
                Ok(mqtt::ChannelData::Message(message)) => {
                    self.route_command(&message);
                }
                Ok(mqtt::ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("command router lagged, {} messages dropped", n);
                }
            }
        }

        Ok(())
    }

    /// Hands a `cmd/...` message to the session of its device. When no
    /// session exists a `FAIL` result is published.
    pub fn route_command(&self, message: &mqtt::Message) -> bool {
        let command = match message.to_command() {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };

        let mut serials = vec![command.serial().to_owned()];
        if let Some(sn) = self
            .ctx
            .config
            .device_config(command.serial())
            .and_then(|(_, d)| d.monitor_sn())
        {
            serials.push(sn.to_string());
        }

        if self.registry.send_command(&serials, command.clone()) {
            return true;
        }

        warn!("no live session for {}, dropping {:?}", command.serial(), command);
        self.channels.publish(mqtt::Message {
            topic: command.to_result_topic(),
            retain: false,
            payload: "FAIL".to_string(),
        });
        false
    }

    async fn midnight_reset(&self) -> Result<()> {
        loop {
            let wait = until_midnight(Local::now());
            debug!("next daily reset in {:?}", wait);
            tokio::time::sleep(wait).await;

            let n = self.registry.broadcast(|| SessionEvent::ResetDaily);
            self.registry.reset_daily_snapshots();
            info!("daily counters reset on {} connections", n);
        }
    }

    async fn stats_publisher(&self) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
        interval.tick().await;

        loop {
            interval.tick().await;
            match mqtt::Message::for_stats(&self.ctx.stats) {
                Ok(message) => self.channels.publish(message),
                Err(e) => warn!("stats: {}", e),
            }
            if !self.registry.healthy() {
                warn!("some connections are past their idle limit");
            }
        }
    }
}

/// Round-trips a socket through std to enable TCP keepalive.
pub fn with_keepalive(
    stream: tokio::net::TcpStream,
    peer: &str,
) -> std::io::Result<tokio::net::TcpStream> {
    let std_stream = stream.into_std()?;
    if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
        warn!("{}: failed to set TCP keepalive: {}", peer, e);
    }
    tokio::net::TcpStream::from_std(std_stream)
}

/// Time left until the next local midnight, plus a second of slack so the
/// reset lands on the new day.
pub fn until_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let fallback = Duration::from_secs(3600);
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return fallback;
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return fallback;
    };
    let Some(next) = now.timezone().from_local_datetime(&midnight).earliest() else {
        return fallback;
    };
    (next - now)
        .to_std()
        .map(|d| d + Duration::from_secs(1))
        .unwrap_or(fallback)
}

/// Wakes the session's writer whenever a frame is queued on `tx`.
pub(crate) fn tx_notify(session: &mut Session) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    let n = notify.clone();
    session
        .core_mut()
        .tx
        .reg_trigger(Box::new(move || n.notify_one()));
    notify
}

pub(crate) async fn flush<W>(session: &mut Session, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if session.core().tx.is_empty() {
        return Ok(());
    }
    let data = session.core_mut().tx.get_all();
    trace!(
        "{}: TX {} bytes\n{}",
        session.core().name(),
        data.len(),
        crate::byte_fifo::to_hex(&data)
    );

    match tokio::time::timeout(Duration::from_secs(WRITE_TIMEOUT_SECS), writer.write_all(&data)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => bail!("write failed: {}", e),
        Err(_) => bail!("write timeout after {} seconds", WRITE_TIMEOUT_SECS),
    }
    writer.flush().await?;
    Ok(())
}
