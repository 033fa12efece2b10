use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// accept devices that are not listed under `inverters`
    #[serde(default)]
    pub allow_unknown: bool,

    #[serde(default)]
    pub proxy: Proxy,

    #[serde(default = "Config::default_tsun")]
    pub tsun: Forward,

    #[serde(default = "Config::default_solarman")]
    pub solarman: Forward,

    #[serde(default)]
    pub mqtt: Mqtt,

    #[serde(default)]
    pub modbus: Modbus,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub emulation: Emulation,

    #[serde(default)]
    pub inverters: BTreeMap<String, Device>,
}

// Device {{{
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Device {
    #[serde(default)]
    pub node_id: String,

    #[serde(default)]
    pub suggested_area: String,

    #[serde(default)]
    pub modbus_polling: bool,

    pub sensor_list: Option<u16>,

    /// Solarman logger serial; Talent devices are keyed by inverter serial only.
    pub monitor_sn: Option<u32>,

    #[serde(default)]
    pub emulation: bool,
}
impl Device {
    /// Topic prefix for this device, always ending in `/`.
    pub fn node_id(&self, serial: &str) -> String {
        let node = if self.node_id.is_empty() {
            serial
        } else {
            self.node_id.as_str()
        };
        if node.ends_with('/') {
            node.to_owned()
        } else {
            format!("{}/", node)
        }
    }

    pub fn suggested_area(&self) -> &str {
        &self.suggested_area
    }

    pub fn modbus_polling(&self) -> bool {
        self.modbus_polling
    }

    pub fn sensor_list(&self) -> Option<u16> {
        self.sensor_list
    }

    pub fn monitor_sn(&self) -> Option<u32> {
        self.monitor_sn
    }

    pub fn emulation(&self) -> bool {
        self.emulation
    }
} // }}}

// Proxy {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Proxy {
    #[serde(default = "Config::default_bind")]
    pub bind: String,
    #[serde(default = "Config::default_talent_port")]
    pub talent_port: u16,
    #[serde(default = "Config::default_solarman_port")]
    pub solarman_port: u16,
}
impl Default for Proxy {
    fn default() -> Self {
        Self {
            bind: Config::default_bind(),
            talent_port: Config::default_talent_port(),
            solarman_port: Config::default_solarman_port(),
        }
    }
} // }}}

// Forward {{{
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Forward {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Permit a target that resolves to a loopback or LAN address, e.g. a
    /// second proxy.
    #[serde(default)]
    pub allow_local: bool,
}
impl Forward {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn allow_local(&self) -> bool {
        self.allow_local
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
} // }}}

// HomeAssistant {{{
#[derive(Clone, Debug, Deserialize)]
pub struct HomeAssistant {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_homeassistant_prefix")]
    pub prefix: String,
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self {
            enabled: Config::default_enabled(),
            prefix: Config::default_mqtt_homeassistant_prefix(),
        }
    }
}

impl HomeAssistant {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub homeassistant: HomeAssistant,
}
impl Default for Mqtt {
    // no mqtt section at all means no broker
    fn default() -> Self {
        Self {
            enabled: false,
            host: Config::default_mqtt_host(),
            port: Config::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Config::default_mqtt_namespace(),
            homeassistant: HomeAssistant::default(),
        }
    }
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn homeassistant(&self) -> &HomeAssistant {
        &self.homeassistant
    }
} // }}}

// Modbus {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Modbus {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_modbus_timeout")]
    pub timeout: Duration,

    #[serde(default = "Config::default_modbus_retries")]
    pub retries: u8,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_poll_interval")]
    pub poll_interval: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_first_poll")]
    pub first_poll: Duration,
}
impl Default for Modbus {
    fn default() -> Self {
        Self {
            timeout: Config::default_modbus_timeout(),
            retries: Config::default_modbus_retries(),
            poll_interval: Config::default_poll_interval(),
            first_poll: Config::default_first_poll(),
        }
    }
} // }}}

// Timeouts {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Timeouts {
    /// allowance for the first frame after accept
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_start_timeout")]
    pub start: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_device_idle")]
    pub device_idle: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_cloud_idle")]
    pub cloud_idle: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_dial_timeout")]
    pub dial: Duration,
}
impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start: Config::default_start_timeout(),
            device_idle: Config::default_device_idle(),
            cloud_idle: Config::default_cloud_idle(),
            dial: Config::default_dial_timeout(),
        }
    }
} // }}}

// Emulation {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Emulation {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_data_interval")]
    pub data_interval: Duration,
}
impl Default for Emulation {
    fn default() -> Self {
        Self {
            heartbeat_interval: Config::default_heartbeat_interval(),
            data_interval: Config::default_data_interval(),
        }
    }
} // }}}

#[derive(Debug)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&config)
    }

    /// Looks a device up by its configured key, or by the logger serial for
    /// Solarman devices.
    pub fn device_config(&self, serial: &str) -> Option<(String, Device)> {
        self.read(|c| {
            if let Some(device) = c.inverters.get(serial) {
                return Some((serial.to_owned(), device.clone()));
            }
            c.inverters
                .iter()
                .find(|(_, d)| d.monitor_sn.map(|sn| sn.to_string()).as_deref() == Some(serial))
                .map(|(k, d)| (k.clone(), d.clone()))
        })
    }

    pub fn inverters(&self) -> BTreeMap<String, Device> {
        self.read(|c| c.inverters.clone())
    }

    pub fn allow_unknown(&self) -> bool {
        self.read(|c| c.allow_unknown)
    }

    pub fn proxy(&self) -> Proxy {
        self.read(|c| c.proxy.clone())
    }

    pub fn tsun(&self) -> Forward {
        self.read(|c| c.tsun.clone())
    }

    pub fn solarman(&self) -> Forward {
        self.read(|c| c.solarman.clone())
    }

    pub fn mqtt(&self) -> Mqtt {
        self.read(|c| c.mqtt.clone())
    }

    pub fn modbus(&self) -> Modbus {
        self.read(|c| c.modbus.clone())
    }

    pub fn timeouts(&self) -> Timeouts {
        self.read(|c| c.timeouts.clone())
    }

    pub fn emulation(&self) -> Emulation {
        self.read(|c| c.emulation.clone())
    }

    pub fn loglevel(&self) -> String {
        self.read(|c| c.loglevel.clone())
    }

    pub fn homeassistant_enabled(&self) -> bool {
        self.read(|c| c.mqtt.enabled && c.mqtt.homeassistant.enabled)
    }

    pub fn log(&self) {
        self.read(|c| c.log())
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error_with_source!(err, "error reading {}", file))?;

        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn log(&self) {
        info!("Configuration loaded successfully:");
        info!("  Proxy:");
        info!("    Bind: {}", self.proxy.bind);
        info!("    Talent Port: {}", self.proxy.talent_port);
        info!("    Solarman Port: {}", self.proxy.solarman_port);
        for (name, fwd) in [("TSUN", &self.tsun), ("Solarman", &self.solarman)] {
            info!("  {} cloud: {}", name, if fwd.enabled { "enabled" } else { "disabled" });
            if fwd.enabled {
                info!("    Host: {}", fwd.host);
                info!("    Port: {}", fwd.port);
                if fwd.allow_local {
                    info!("    Allow Local: true");
                }
            }
        }
        info!("  Inverters: {} configured", self.inverters.len());
        for (serial, dev) in &self.inverters {
            info!("    Inverter[{}]:", serial);
            info!("      Node ID: {}", dev.node_id(serial));
            info!("      Area: {}", dev.suggested_area);
            info!("      Modbus Polling: {}", dev.modbus_polling);
            if let Some(sn) = dev.monitor_sn {
                info!("      Monitor SN: {}", sn);
            }
            if let Some(list) = dev.sensor_list {
                info!("      Sensor List: 0x{:04x}", list);
            }
            info!("      Emulation: {}", dev.emulation);
        }
        info!("  Allow Unknown: {}", self.allow_unknown);

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
            let ha = self.mqtt.homeassistant.enabled;
            info!("    Home Assistant: {}", if ha { "enabled" } else { "disabled" });
        }

        info!("  Modbus:");
        info!("    Timeout: {:?}", self.modbus.timeout);
        info!("    Retries: {}", self.modbus.retries);
        info!("    Poll Interval: {:?}", self.modbus.poll_interval);
        info!("    First Poll: {:?}", self.modbus.first_poll);

        info!("  Timeouts:");
        info!("    Start: {:?}", self.timeouts.start);
        info!("    Device Idle: {:?}", self.timeouts.device_idle);
        info!("    Cloud Idle: {:?}", self.timeouts.cloud_idle);
        info!("    Dial: {:?}", self.timeouts.dial);
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                return Err(file_error!("MQTT host cannot be empty"));
            }
        }

        for (name, fwd) in [("tsun", &self.tsun), ("solarman", &self.solarman)] {
            if fwd.enabled {
                if fwd.port == 0 {
                    bail!("{}.port must be between 1 and 65535", name);
                }
                if fwd.host.is_empty() {
                    return Err(file_error!("{}.host cannot be empty", name));
                }
            }
        }

        if self.modbus.timeout.is_zero() {
            return Err(file_error!("Invalid modbus timeout: 0"));
        }
        if self.timeouts.device_idle.is_zero() || self.timeouts.cloud_idle.is_zero() {
            return Err(file_error!("Idle timeouts must be non-zero"));
        }
        if self.timeouts.start < self.timeouts.device_idle {
            warn!("timeouts.start is shorter than timeouts.device_idle");
        }

        let mut seen = std::collections::HashSet::new();
        for (serial, dev) in &self.inverters {
            if serial.is_empty() {
                bail!("inverter serial cannot be empty");
            }
            if let Some(sn) = dev.monitor_sn {
                if !seen.insert(sn) {
                    bail!("inverter[{}]: monitor_sn {} is used more than once", serial, sn);
                }
            }
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_talent_port() -> u16 {
        5005
    }

    fn default_solarman_port() -> u16 {
        10000
    }

    fn default_tsun() -> Forward {
        Forward {
            enabled: true,
            host: "logger.talent-monitoring.com".to_string(),
            port: 5005,
            allow_local: false,
        }
    }

    fn default_solarman() -> Forward {
        Forward {
            enabled: true,
            host: "iot.talent-monitoring.com".to_string(),
            port: 10000,
            allow_local: false,
        }
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "tsun".to_string()
    }

    fn default_mqtt_homeassistant_prefix() -> String {
        "homeassistant".to_string()
    }

    fn default_modbus_timeout() -> Duration {
        Duration::from_secs(2)
    }

    fn default_modbus_retries() -> u8 {
        1
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_first_poll() -> Duration {
        Duration::from_secs(15)
    }

    fn default_start_timeout() -> Duration {
        Duration::from_secs(400)
    }

    fn default_device_idle() -> Duration {
        Duration::from_secs(120)
    }

    fn default_cloud_idle() -> Duration {
        Duration::from_secs(360)
    }

    fn default_dial_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_heartbeat_interval() -> Duration {
        Duration::from_secs(120)
    }

    fn default_data_interval() -> Duration {
        Duration::from_secs(300)
    }
}
