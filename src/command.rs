use crate::prelude::*;

/// Modbus commands accepted over MQTT and routed to the device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReadHolding { serial: String, register: u16, count: u16 },
    ReadInput { serial: String, register: u16, count: u16 },
    WriteSingle { serial: String, register: u16, value: u16 },
}

impl Command {
    pub fn serial(&self) -> &str {
        use Command::*;
        match self {
            ReadHolding { serial, .. } | ReadInput { serial, .. } | WriteSingle { serial, .. } => serial,
        }
    }

    pub fn func(&self) -> u8 {
        match self {
            Command::ReadHolding { .. } => modbus::READ_HOLDING_REGS,
            Command::ReadInput { .. } => modbus::READ_INPUT_REGS,
            Command::WriteSingle { .. } => modbus::WRITE_SINGLE_REG,
        }
    }

    pub fn register(&self) -> u16 {
        use Command::*;
        match self {
            ReadHolding { register, .. } | ReadInput { register, .. } | WriteSingle { register, .. } => *register,
        }
    }

    /// Register count for reads, the new value for writes.
    pub fn value(&self) -> u16 {
        match self {
            Command::ReadHolding { count, .. } | Command::ReadInput { count, .. } => *count,
            Command::WriteSingle { value, .. } => *value,
        }
    }

    pub fn to_result_topic(&self) -> String {
        let action = match self {
            Command::ReadHolding { .. } => "modbus_read_regs",
            Command::ReadInput { .. } => "modbus_read_inputs",
            Command::WriteSingle { .. } => "modbus_write_reg",
        };

        format!("result/{}/{}/{}", self.serial(), action, self.register())
    }
}
