// Static address tables for the three telemetry sources: Talent typed
// triples, the Solarman real-time data dump and Modbus input registers.

use super::Register::{self, *};

#[derive(Clone, Copy, Debug)]
pub enum Scale {
    None,
    Div(f64),
    Offset(f64),
    Formula(fn(f64) -> f64),
}

impl Scale {
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            Scale::None => raw,
            Scale::Div(d) => raw / d,
            Scale::Offset(o) => raw + o,
            Scale::Formula(f) => f(raw),
        }
    }

    /// Raw wire value for an already scaled value. Formulas are one-way.
    pub fn invert(&self, value: f64) -> Option<f64> {
        match self {
            Scale::None => Some(value),
            Scale::Div(d) => Some((value * d).round()),
            Scale::Offset(o) => Some(value - o),
            Scale::Formula(_) => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Scale::None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    U16,
    I16,
    U32,
}

impl Kind {
    pub fn size(&self) -> usize {
        match self {
            Kind::U16 | Kind::I16 => 2,
            Kind::U32 => 4,
        }
    }

    /// Reads a big-endian value of this kind; `None` when `data` is too short.
    pub fn read(&self, data: &[u8], offset: usize) -> Option<f64> {
        let b = data.get(offset..offset + self.size())?;
        Some(match self {
            Kind::U16 => u16::from_be_bytes([b[0], b[1]]) as f64,
            Kind::I16 => i16::from_be_bytes([b[0], b[1]]) as f64,
            Kind::U32 => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
        })
    }

    pub fn write(&self, data: &mut [u8], offset: usize, raw: f64) {
        let Some(b) = data.get_mut(offset..offset + self.size()) else {
            return;
        };
        match self {
            Kind::U16 => b.copy_from_slice(&(raw as u16).to_be_bytes()),
            Kind::I16 => b.copy_from_slice(&(raw as i16).to_be_bytes()),
            Kind::U32 => b.copy_from_slice(&(raw as u32).to_be_bytes()),
        }
    }
}

#[derive(Debug)]
pub struct TalentEntry {
    pub addr: u32,
    pub register: Register,
    pub scale: Scale,
}

#[derive(Debug)]
pub struct OffsetEntry {
    pub offset: usize,
    pub register: Register,
    pub kind: Kind,
    pub scale: Scale,
}

#[derive(Debug)]
pub struct ModbusEntry {
    pub addr: u16,
    pub register: Register,
    pub kind: Kind,
    pub scale: Scale,
}

const fn t(addr: u32, register: Register, scale: Scale) -> TalentEntry {
    TalentEntry {
        addr,
        register,
        scale,
    }
}

const fn o(offset: usize, register: Register, kind: Kind, scale: Scale) -> OffsetEntry {
    OffsetEntry {
        offset,
        register,
        kind,
        scale,
    }
}

const fn m(addr: u16, register: Register, kind: Kind, scale: Scale) -> ModbusEntry {
    ModbusEntry {
        addr,
        register,
        kind,
        scale,
    }
}

const V: Scale = Scale::Div(10.0);
const A: Scale = Scale::Div(100.0);
const HZ: Scale = Scale::Div(100.0);
const W: Scale = Scale::Div(10.0);
const KWH: Scale = Scale::Div(100.0);

fn temp_from_raw(raw: f64) -> f64 {
    raw - 40.0
}

// {{{ Talent
pub static TALENT_MAP: &[TalentEntry] = &[
    t(0x0000_0064, Manufacturer, Scale::None),
    t(0x0000_006e, Model, Scale::None),
    t(0x0000_0078, Version, Scale::None),
    t(0x0000_0082, RatedPower, Scale::None),
    t(0x0000_03e8, GridVoltage, V),
    t(0x0000_044c, GridCurrent, A),
    t(0x0000_04b0, GridFrequency, HZ),
    t(0x0000_0514, InverterTemp, Scale::None),
    t(0x0000_0578, Status, Scale::None),
    t(0x0000_0640, OutputPower, W),
    t(0x0000_06a4, Pv1Voltage, V),
    t(0x0000_0708, Pv1Current, A),
    t(0x0000_076c, Pv1Power, W),
    t(0x0000_07d0, Pv1DailyGeneration, KWH),
    t(0x0000_0834, Pv1TotalGeneration, KWH),
    t(0x0000_0898, Pv2Voltage, V),
    t(0x0000_08fc, Pv2Current, A),
    t(0x0000_0960, Pv2Power, W),
    t(0x0000_09c4, Pv2DailyGeneration, KWH),
    t(0x0000_0a28, Pv2TotalGeneration, KWH),
    t(0x0000_0a8c, Pv3Voltage, V),
    t(0x0000_0af0, Pv3Current, A),
    t(0x0000_0b54, Pv3Power, W),
    t(0x0000_0bb8, Pv3DailyGeneration, KWH),
    t(0x0000_0c1c, Pv3TotalGeneration, KWH),
    t(0x0000_0c80, Pv4Voltage, V),
    t(0x0000_0ce4, Pv4Current, A),
    t(0x0000_0d48, Pv4Power, W),
    t(0x0000_0dac, Pv4DailyGeneration, KWH),
    t(0x0000_0e10, Pv4TotalGeneration, KWH),
    t(0x0000_0e74, DailyGeneration, KWH),
    t(0x0000_0ed8, TotalGeneration, KWH),
    t(0x0000_0f3c, EventAlarm, Scale::None),
    t(0x0000_0fa0, EventFault, Scale::None),
    // collector data (msg 0x71)
    t(0x0000_1388, CollectorFwVersion, Scale::None),
    t(0x0000_13ec, CollectorSignalStrength, Scale::None),
    t(0x0000_1450, CollectorUptime, Scale::None),
];

pub fn talent_entry(addr: u32) -> Option<&'static TalentEntry> {
    TALENT_MAP.iter().find(|e| e.addr == addr)
}
// }}}

// {{{ Solarman real-time data, sensor list 0x02b0
pub const SOLARMAN_SENSOR_LIST: u16 = 0x02b0;
pub const SOLARMAN_DATA_LEN: usize = 0x11c;

// offsets are relative to the start of the 0x4210 payload
pub static SOLARMAN_MAP: &[OffsetEntry] = &[
    o(0xd6, GridVoltage, Kind::U16, V),
    o(0xd8, GridCurrent, Kind::U16, A),
    o(0xda, GridFrequency, Kind::U16, HZ),
    o(0xdc, InverterTemp, Kind::I16, Scale::None),
    o(0xde, Status, Kind::U16, Scale::None),
    o(0xe0, OutputPower, Kind::U16, W),
    o(0xe2, Pv1Voltage, Kind::U16, V),
    o(0xe4, Pv1Current, Kind::U16, A),
    o(0xe6, Pv1Power, Kind::U16, W),
    o(0xe8, Pv2Voltage, Kind::U16, V),
    o(0xea, Pv2Current, Kind::U16, A),
    o(0xec, Pv2Power, Kind::U16, W),
    o(0xee, Pv3Voltage, Kind::U16, V),
    o(0xf0, Pv3Current, Kind::U16, A),
    o(0xf2, Pv3Power, Kind::U16, W),
    o(0xf4, Pv4Voltage, Kind::U16, V),
    o(0xf6, Pv4Current, Kind::U16, A),
    o(0xf8, Pv4Power, Kind::U16, W),
    o(0xfa, DailyGeneration, Kind::U16, KWH),
    o(0xfc, TotalGeneration, Kind::U32, KWH),
    o(0x100, Pv1DailyGeneration, Kind::U16, KWH),
    o(0x102, Pv1TotalGeneration, Kind::U32, KWH),
    o(0x106, Pv2DailyGeneration, Kind::U16, KWH),
    o(0x108, Pv2TotalGeneration, Kind::U32, KWH),
    o(0x10c, Pv3DailyGeneration, Kind::U16, KWH),
    o(0x10e, Pv3TotalGeneration, Kind::U32, KWH),
    o(0x112, Pv4DailyGeneration, Kind::U16, KWH),
    o(0x114, Pv4TotalGeneration, Kind::U32, KWH),
    o(0x118, EventAlarm, Kind::U16, Scale::None),
    o(0x11a, EventFault, Kind::U16, Scale::None),
];
// }}}

// {{{ Modbus input registers
pub const MODBUS_POLL_START: u16 = 0x3000;
pub const MODBUS_POLL_COUNT: u16 = 0x30;

pub static MODBUS_MAP: &[ModbusEntry] = &[
    m(0x3000, Status, Kind::U16, Scale::None),
    m(0x3001, EventAlarm, Kind::U16, Scale::None),
    m(0x3002, EventFault, Kind::U16, Scale::None),
    m(0x3008, RatedPower, Kind::U16, Scale::None),
    m(0x300b, GridVoltage, Kind::U16, V),
    m(0x300c, GridCurrent, Kind::U16, A),
    m(0x300d, GridFrequency, Kind::U16, HZ),
    m(0x300e, InverterTemp, Kind::I16, Scale::Formula(temp_from_raw)),
    m(0x3010, OutputPower, Kind::U16, W),
    m(0x3011, Pv1Voltage, Kind::U16, V),
    m(0x3012, Pv1Current, Kind::U16, A),
    m(0x3013, Pv1Power, Kind::U16, W),
    m(0x3014, Pv2Voltage, Kind::U16, V),
    m(0x3015, Pv2Current, Kind::U16, A),
    m(0x3016, Pv2Power, Kind::U16, W),
    m(0x3017, Pv3Voltage, Kind::U16, V),
    m(0x3018, Pv3Current, Kind::U16, A),
    m(0x3019, Pv3Power, Kind::U16, W),
    m(0x301a, Pv4Voltage, Kind::U16, V),
    m(0x301b, Pv4Current, Kind::U16, A),
    m(0x301c, Pv4Power, Kind::U16, W),
    m(0x301d, DailyGeneration, Kind::U16, KWH),
    m(0x3021, TotalGeneration, Kind::U32, KWH),
];
// }}}
