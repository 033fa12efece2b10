#![allow(dead_code)]

pub use tsun_proxy::prelude::*;

use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tsun_proxy::infos::register_map::SOLARMAN_DATA_LEN;
use tsun_proxy::solarman::packet as solarman_packet;
use tsun_proxy::talent::packet as talent_packet;

pub const TALENT_SERIAL: &str = "R170000000000001";
pub const SOLARMAN_SERIAL: &str = "Y170000000000001";
pub const LOGGER_SN: u32 = 2070233889;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;

impl Factory {
    pub fn config_yaml() -> &'static str {
        r#"
loglevel: debug
tsun:
  enabled: true
  host: logger.talent-monitoring.com
  port: 5005
solarman:
  enabled: true
  host: iot.talent-monitoring.com
  port: 10000
modbus:
  timeout: 2
  retries: 1
  poll_interval: 60
  first_poll: 15
inverters:
  R170000000000001:
    node_id: inv_1
    suggested_area: roof
  Y170000000000001:
    node_id: inv_2/
    monitor_sn: 2070233889
"#
    }

    pub fn config() -> ConfigWrapper {
        let config = Config::from_yaml(Self::config_yaml()).unwrap();
        config.validate().unwrap();
        ConfigWrapper::from_config(config)
    }

    pub fn config_with(f: impl FnOnce(&mut Config)) -> ConfigWrapper {
        let mut config = Config::from_yaml(Self::config_yaml()).unwrap();
        f(&mut config);
        ConfigWrapper::from_config(config)
    }

    pub fn ctx() -> Context {
        Context::new(Self::config(), Arc::new(ProtocolStats::new()))
    }

    pub fn events() -> (UnboundedSender<SessionEvent>, UnboundedReceiver<SessionEvent>) {
        mpsc::unbounded_channel()
    }

    pub fn session(family: Family, role: Role, ctx: &Context) -> (Session, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = Self::events();
        (Session::new(family, role, ctx.clone(), &tx), rx)
    }

    // {{{ talent frames
    /// The 23-byte contact-info indication: no payload at all.
    pub fn talent_contact_info(serial: &str) -> Vec<u8> {
        talent_packet::build(serial, 0x91, 0x00, &[])
    }

    pub fn talent_get_time(serial: &str) -> Vec<u8> {
        talent_packet::build(serial, 0x70, 0x22, &[])
    }

    /// Data block with grid voltage 230.5 V and total generation 1234.56 kWh.
    pub fn talent_data_payload(timestamp: i64) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&0u32.to_be_bytes());
        p.push(TALENT_SERIAL.len() as u8);
        p.extend_from_slice(TALENT_SERIAL.as_bytes());
        p.push(0x01);
        p.extend_from_slice(&timestamp.to_be_bytes());
        p.extend_from_slice(&3u32.to_be_bytes());
        // grid voltage, i16
        p.extend_from_slice(&0x3e8u32.to_be_bytes());
        p.push(0x53);
        p.extend_from_slice(&2305i16.to_be_bytes());
        // total generation, i32
        p.extend_from_slice(&0xed8u32.to_be_bytes());
        p.push(0x49);
        p.extend_from_slice(&123456i32.to_be_bytes());
        // model, pascal string
        p.extend_from_slice(&0x6eu32.to_be_bytes());
        p.push(0x54);
        p.push(6);
        p.extend_from_slice(b"TSOL-M");
        p
    }

    pub fn talent_data(timestamp: i64) -> Vec<u8> {
        talent_packet::build(TALENT_SERIAL, 0x91, 0x04, &Self::talent_data_payload(timestamp))
    }
    // }}}

    // {{{ solarman frames
    /// Real-time data payload, sensor list 0x02b0, with the given raw grid
    /// voltage (0.1 V) and current (0.01 A).
    pub fn solarman_data_payload(voltage: u16, current: u16) -> Vec<u8> {
        let mut p = vec![0u8; SOLARMAN_DATA_LEN];
        p[0] = 0x01;
        p[1..3].copy_from_slice(&0x02b0u16.to_le_bytes());
        p[0xd6..0xd8].copy_from_slice(&voltage.to_be_bytes());
        p[0xd8..0xda].copy_from_slice(&current.to_be_bytes());
        p
    }

    pub fn solarman_data(voltage: u16, current: u16) -> Vec<u8> {
        solarman_packet::build(0x4210, 0x0101, LOGGER_SN, &Self::solarman_data_payload(voltage, current))
    }

    pub fn solarman_frame(ctrl: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        solarman_packet::build(ctrl, seq, LOGGER_SN, payload)
    }
    // }}}
}
