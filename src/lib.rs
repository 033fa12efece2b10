pub mod byte_fifo;
pub mod channels;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod home_assistant;
pub mod infos;
pub mod modbus;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod proxy;
pub mod solarman;
pub mod stats;
pub mod talent;
pub mod timer;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::mqtt::Mqtt;
use crate::proxy::{Proxy, Registry};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

// sessions get this long to flush before the process exits
const SHUTDOWN_GRACE_MS: u64 = 500;

pub async fn app(mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let options = Options::new();

    let config = match ConfigWrapper::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            init_logger(options.loglevel.as_deref().unwrap_or("info"));
            return Err(err);
        }
    };

    let loglevel = options.loglevel.clone().unwrap_or_else(|| config.loglevel());
    init_logger(&loglevel);

    info!("tsun-proxy {} starting, config {}", CARGO_PKG_VERSION, options.config_file);
    config.log();

    let channels = Channels::new();
    let stats = Arc::new(ProtocolStats::new());
    let registry = Registry::new();

    let mqtt = Mqtt::new(config.clone(), channels.clone(), stats.clone());
    let mqtt_clone = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_clone.start().await {
            error!("MQTT task failed: {}", e);
        }
    });

    let proxy = Proxy::new(
        Context::new(config.clone(), stats.clone()),
        channels.clone(),
        registry.clone(),
    );
    let mut proxy_handle = tokio::spawn(async move { proxy.start().await });

    tokio::select! {
        _ = shutdown_rx.recv() => info!("Shutdown signal received, stopping..."),
        r = &mut proxy_handle => match r {
            Ok(Ok(())) => warn!("proxy stopped unexpectedly"),
            Ok(Err(e)) => error!("proxy failed: {:#}", e),
            Err(e) => error!("proxy task: {}", e),
        },
    }

    proxy_handle.abort();
    let n = registry.disconnect_all(true);
    info!("closing {} connections", n);
    tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;

    mqtt.stop();
    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for MQTT task: {}", e);
    }

    stats.print_summary();
    info!("Application shutdown complete");
    Ok(())
}

fn init_logger(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}
