pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};

pub use tokio::sync::broadcast;

pub use crate::{
    byte_fifo::ByteFifo,
    channels::Channels,
    command::Command,
    config::{self, Config, ConfigWrapper},
    connection::{Context, Family, Protocol, Role, Session, SessionEvent, State},
    error::FrameError,
    file_error, file_error_with_source,
    infos::{DeviceRecord, Register},
    modbus::{self, ModbusError, ModbusTunnel},
    mqtt,
    options::Options,
    stats::{Counter, ProtocolStats},
    timer::Timer,
};
