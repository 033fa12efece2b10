use crate::prelude::*;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

const RECENT_LOG_LEN: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    InverterCnt,
    CloudConnCnt,
    UnknownSnr,
    UnknownMsg,
    UnknownCtrl,
    InvalidDataType,
    InvalidMsgFormat,
    SwException,
    OtaStartMsg,
    ModbusCmds,
    ModbusTimeout,
    ModbusCrcErr,
    ModbusAddrErr,
    ModbusFuncErr,
    ModbusLenErr,
    ModbusException,
    ModbusUnsolicited,
    DialFailed,
    ForwardDisabled,
    MqttMessagesSent,
    MqttErrors,
}

impl Counter {
    pub const ALL: [Counter; 21] = [
        Counter::InverterCnt,
        Counter::CloudConnCnt,
        Counter::UnknownSnr,
        Counter::UnknownMsg,
        Counter::UnknownCtrl,
        Counter::InvalidDataType,
        Counter::InvalidMsgFormat,
        Counter::SwException,
        Counter::OtaStartMsg,
        Counter::ModbusCmds,
        Counter::ModbusTimeout,
        Counter::ModbusCrcErr,
        Counter::ModbusAddrErr,
        Counter::ModbusFuncErr,
        Counter::ModbusLenErr,
        Counter::ModbusException,
        Counter::ModbusUnsolicited,
        Counter::DialFailed,
        Counter::ForwardDisabled,
        Counter::MqttMessagesSent,
        Counter::MqttErrors,
    ];

    pub fn name(&self) -> &'static str {
        use Counter::*;
        match self {
            InverterCnt => "Inverter_Cnt",
            CloudConnCnt => "Cloud_Conn_Cnt",
            UnknownSnr => "Unknown_SNR",
            UnknownMsg => "Unknown_Msg",
            UnknownCtrl => "Unknown_Ctrl",
            InvalidDataType => "Invalid_Data_Type",
            InvalidMsgFormat => "Invalid_Msg_Format",
            SwException => "SW_Exception",
            OtaStartMsg => "OTA_Start_Msg",
            ModbusCmds => "Modbus_Command",
            ModbusTimeout => "Modbus_Timeout",
            ModbusCrcErr => "Modbus_CRC_Error",
            ModbusAddrErr => "Modbus_Addr_Error",
            ModbusFuncErr => "Modbus_Func_Error",
            ModbusLenErr => "Modbus_Len_Error",
            ModbusException => "Modbus_Exception",
            ModbusUnsolicited => "Modbus_Unsolicited",
            DialFailed => "Dial_Failed",
            ForwardDisabled => "Forward_Disabled",
            MqttMessagesSent => "MQTT_Messages_Sent",
            MqttErrors => "MQTT_Errors",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Process-wide protocol health counters plus a small ring buffer of the most
/// recent notable events. Shared between all connection tasks.
#[derive(Debug)]
pub struct ProtocolStats {
    counters: [AtomicI64; Counter::ALL.len()],
    recent: Mutex<VecDeque<String>>,
}

impl Default for ProtocolStats {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_LOG_LEN)),
        }
    }
}

impl ProtocolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self, counter: Counter) {
        self.counters[counter.index()].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> i64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Increments `counter` and records `msg` in the recent-events buffer.
    pub fn count(&self, counter: Counter, msg: impl Into<String>) {
        self.inc(counter);
        self.log(format!("{}: {}", counter.name(), msg.into()));
    }

    pub fn log(&self, line: String) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_LOG_LEN {
                recent.pop_front();
            }
            recent.push_back(format!(
                "{} {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                line
            ));
        }
    }

    pub fn recent(&self) -> Vec<String> {
        self.recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for counter in Counter::ALL {
            map.insert(counter.name().to_owned(), self.get(counter).into());
        }
        serde_json::Value::Object(map)
    }

    pub fn print_summary(&self) {
        info!("Protocol Statistics:");
        info!("  Connections:");
        info!("    Inverters connected: {}", self.get(Counter::InverterCnt));
        info!("    Cloud connections: {}", self.get(Counter::CloudConnCnt));
        info!("    Dial failures: {}", self.get(Counter::DialFailed));
        info!("    Forward targets disabled: {}", self.get(Counter::ForwardDisabled));
        info!("  Frames:");
        info!("    Unknown serial numbers: {}", self.get(Counter::UnknownSnr));
        info!("    Unknown messages: {}", self.get(Counter::UnknownMsg));
        info!("    Unknown control codes: {}", self.get(Counter::UnknownCtrl));
        info!("    Invalid data types: {}", self.get(Counter::InvalidDataType));
        info!("    Invalid message formats: {}", self.get(Counter::InvalidMsgFormat));
        info!("    OTA start messages: {}", self.get(Counter::OtaStartMsg));
        info!("    Software exceptions: {}", self.get(Counter::SwException));
        info!("  Modbus:");
        info!("    Commands: {}", self.get(Counter::ModbusCmds));
        info!("    Timeouts: {}", self.get(Counter::ModbusTimeout));
        info!("    CRC errors: {}", self.get(Counter::ModbusCrcErr));
        info!("    Address errors: {}", self.get(Counter::ModbusAddrErr));
        info!("    Function errors: {}", self.get(Counter::ModbusFuncErr));
        info!("    Length errors: {}", self.get(Counter::ModbusLenErr));
        info!("    Exceptions: {}", self.get(Counter::ModbusException));
        info!("    Unsolicited: {}", self.get(Counter::ModbusUnsolicited));
        info!("  MQTT:");
        info!("    Messages sent: {}", self.get(Counter::MqttMessagesSent));
        info!("    Errors: {}", self.get(Counter::MqttErrors));
        let recent = self.recent();
        if !recent.is_empty() {
            info!("  Recent events:");
            for line in recent {
                info!("    {}", line);
            }
        }
    }
}
