pub mod register_map;

use crate::prelude::*;
use crate::talent::data::TalentValue;

use register_map::{OffsetEntry, Scale};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// {{{ Register
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Manufacturer,
    Model,
    Version,
    RatedPower,
    Status,
    EventAlarm,
    EventFault,
    GridVoltage,
    GridCurrent,
    GridFrequency,
    OutputPower,
    InverterTemp,
    Pv1Voltage,
    Pv1Current,
    Pv1Power,
    Pv1DailyGeneration,
    Pv1TotalGeneration,
    Pv2Voltage,
    Pv2Current,
    Pv2Power,
    Pv2DailyGeneration,
    Pv2TotalGeneration,
    Pv3Voltage,
    Pv3Current,
    Pv3Power,
    Pv3DailyGeneration,
    Pv3TotalGeneration,
    Pv4Voltage,
    Pv4Current,
    Pv4Power,
    Pv4DailyGeneration,
    Pv4TotalGeneration,
    DailyGeneration,
    TotalGeneration,
    CollectorFwVersion,
    CollectorSignalStrength,
    CollectorUptime,
}

#[derive(Clone, Copy, Debug)]
pub struct RegisterInfo {
    /// dotted `category.field` (or `category.sub.field`) path in the record
    pub path: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub must_increase: bool,
    pub midnight_reset: bool,
}

const fn info(
    path: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
) -> RegisterInfo {
    RegisterInfo {
        path,
        name,
        unit,
        device_class,
        must_increase: false,
        midnight_reset: false,
    }
}

const fn daily(path: &'static str, name: &'static str) -> RegisterInfo {
    RegisterInfo {
        midnight_reset: true,
        ..info(path, name, Some("kWh"), Some("energy"))
    }
}

const fn total(path: &'static str, name: &'static str) -> RegisterInfo {
    RegisterInfo {
        must_increase: true,
        ..info(path, name, Some("kWh"), Some("energy"))
    }
}

const VOLT: (Option<&str>, Option<&str>) = (Some("V"), Some("voltage"));
const AMP: (Option<&str>, Option<&str>) = (Some("A"), Some("current"));
const WATT: (Option<&str>, Option<&str>) = (Some("W"), Some("power"));

impl Register {
    pub const ALL: [Register; 37] = {
        use Register::*;
        [
            Manufacturer,
            Model,
            Version,
            RatedPower,
            Status,
            EventAlarm,
            EventFault,
            GridVoltage,
            GridCurrent,
            GridFrequency,
            OutputPower,
            InverterTemp,
            Pv1Voltage,
            Pv1Current,
            Pv1Power,
            Pv1DailyGeneration,
            Pv1TotalGeneration,
            Pv2Voltage,
            Pv2Current,
            Pv2Power,
            Pv2DailyGeneration,
            Pv2TotalGeneration,
            Pv3Voltage,
            Pv3Current,
            Pv3Power,
            Pv3DailyGeneration,
            Pv3TotalGeneration,
            Pv4Voltage,
            Pv4Current,
            Pv4Power,
            Pv4DailyGeneration,
            Pv4TotalGeneration,
            DailyGeneration,
            TotalGeneration,
            CollectorFwVersion,
            CollectorSignalStrength,
            CollectorUptime,
        ]
    };

    pub fn info(&self) -> RegisterInfo {
        use Register::*;
        match self {
            Manufacturer => info("inverter.Manufacturer", "Manufacturer", None, None),
            Model => info("inverter.Model", "Model", None, None),
            Version => info("inverter.Version", "Firmware", None, None),
            RatedPower => info("inverter.Rated_Power", "Rated Power", WATT.0, WATT.1),
            Status => info("inverter.Status", "Status", None, None),
            EventAlarm => info("events.Inverter_Alarm", "Alarm", None, None),
            EventFault => info("events.Inverter_Fault", "Fault", None, None),
            GridVoltage => info("grid.Voltage", "Grid Voltage", VOLT.0, VOLT.1),
            GridCurrent => info("grid.Current", "Grid Current", AMP.0, AMP.1),
            GridFrequency => info("grid.Frequency", "Grid Frequency", Some("Hz"), Some("frequency")),
            OutputPower => info("grid.Output_Power", "Power", WATT.0, WATT.1),
            InverterTemp => info("env.Inverter_Temp", "Temperature", Some("°C"), Some("temperature")),
            Pv1Voltage => info("input.pv1.Voltage", "PV1 Voltage", VOLT.0, VOLT.1),
            Pv1Current => info("input.pv1.Current", "PV1 Current", AMP.0, AMP.1),
            Pv1Power => info("input.pv1.Power", "PV1 Power", WATT.0, WATT.1),
            Pv1DailyGeneration => daily("input.pv1.Daily_Generation", "PV1 Daily Generation"),
            Pv1TotalGeneration => total("input.pv1.Total_Generation", "PV1 Total Generation"),
            Pv2Voltage => info("input.pv2.Voltage", "PV2 Voltage", VOLT.0, VOLT.1),
            Pv2Current => info("input.pv2.Current", "PV2 Current", AMP.0, AMP.1),
            Pv2Power => info("input.pv2.Power", "PV2 Power", WATT.0, WATT.1),
            Pv2DailyGeneration => daily("input.pv2.Daily_Generation", "PV2 Daily Generation"),
            Pv2TotalGeneration => total("input.pv2.Total_Generation", "PV2 Total Generation"),
            Pv3Voltage => info("input.pv3.Voltage", "PV3 Voltage", VOLT.0, VOLT.1),
            Pv3Current => info("input.pv3.Current", "PV3 Current", AMP.0, AMP.1),
            Pv3Power => info("input.pv3.Power", "PV3 Power", WATT.0, WATT.1),
            Pv3DailyGeneration => daily("input.pv3.Daily_Generation", "PV3 Daily Generation"),
            Pv3TotalGeneration => total("input.pv3.Total_Generation", "PV3 Total Generation"),
            Pv4Voltage => info("input.pv4.Voltage", "PV4 Voltage", VOLT.0, VOLT.1),
            Pv4Current => info("input.pv4.Current", "PV4 Current", AMP.0, AMP.1),
            Pv4Power => info("input.pv4.Power", "PV4 Power", WATT.0, WATT.1),
            Pv4DailyGeneration => daily("input.pv4.Daily_Generation", "PV4 Daily Generation"),
            Pv4TotalGeneration => total("input.pv4.Total_Generation", "PV4 Total Generation"),
            DailyGeneration => daily("total.Daily_Generation", "Daily Generation"),
            TotalGeneration => total("total.Total_Generation", "Total Generation"),
            CollectorFwVersion => info("collector.Collector_Fw_Version", "Collector Firmware", None, None),
            CollectorSignalStrength => info("collector.Signal_Strength", "Signal Strength", Some("%"), None),
            CollectorUptime => info("collector.Uptime", "Collector Uptime", Some("s"), Some("duration")),
        }
    }

    pub fn path(&self) -> &'static str {
        self.info().path
    }

    /// Topic suffix: the dotted path with `/` separators.
    pub fn topic(&self) -> String {
        self.path().replace('.', "/")
    }

    pub fn from_path(path: &str) -> Option<Register> {
        Self::ALL.into_iter().find(|r| r.path() == path)
    }
} // }}}

/// Builds the JSON value for a raw reading. Unscaled integral readings stay
/// integers so they compare and publish without a trailing `.0`.
pub fn scaled_value(raw: f64, scale: &Scale) -> Value {
    let v = scale.apply(raw);
    if scale.is_none() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

// {{{ DeviceRecord
/// Telemetry snapshot of one device plus change tracking.
#[derive(Clone, Debug, Default)]
pub struct DeviceRecord {
    values: BTreeMap<Register, Value>,
    changed: BTreeSet<Register>,
    revision: u64,
}

impl DeviceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning whether the stored value changed.
    ///
    /// Must-increase registers only accept a strictly greater number.
    pub fn update(&mut self, register: Register, value: Value) -> bool {
        if let Some(old) = self.values.get(&register) {
            if register.info().must_increase {
                if let (Some(old), Some(new)) = (old.as_f64(), value.as_f64()) {
                    if new <= old {
                        if new < old {
                            debug!("{}: ignoring {} < {}", register.path(), new, old);
                        }
                        return false;
                    }
                }
            } else if *old == value {
                return false;
            }
        }

        self.values.insert(register, value);
        self.changed.insert(register);
        self.revision += 1;
        true
    }

    pub fn get(&self, register: Register) -> Option<&Value> {
        self.values.get(&register)
    }

    pub fn get_f64(&self, register: Register) -> Option<f64> {
        self.get(register).and_then(Value::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bumped by every stored change; publishing does not touch it.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn take_changed(&mut self) -> Vec<(Register, Value)> {
        std::mem::take(&mut self.changed)
            .into_iter()
            .filter_map(|r| self.values.get(&r).map(|v| (r, v.clone())))
            .collect()
    }

    /// Zeroes every midnight-reset register that is not already zero.
    pub fn reset_daily(&mut self) -> usize {
        let mut n = 0;
        for (register, value) in self.values.iter_mut() {
            if register.info().midnight_reset && value.as_f64() != Some(0.0) {
                *value = Value::from(0);
                self.changed.insert(*register);
                n += 1;
            }
        }
        if n > 0 {
            self.revision += 1;
        }
        n
    }

    /// Applies Talent typed triples; unknown addresses are skipped.
    pub fn apply_talent(&mut self, items: &[(u32, TalentValue)]) -> usize {
        let mut changed = 0;
        for (addr, value) in items {
            let Some(entry) = register_map::talent_entry(*addr) else {
                trace!("talent: no mapping for address 0x{:08x}", addr);
                continue;
            };
            let value = match value {
                TalentValue::Str(s) => Value::from(s.clone()),
                other => match other.as_f64() {
                    Some(raw) => scaled_value(raw, &entry.scale),
                    None => continue,
                },
            };
            if self.update(entry.register, value) {
                changed += 1;
            }
        }
        changed
    }

    /// Applies a fixed-offset register dump (Solarman real-time data).
    pub fn apply_offsets(&mut self, map: &[OffsetEntry], data: &[u8]) -> usize {
        let mut changed = 0;
        for entry in map {
            if let Some(raw) = entry.kind.read(data, entry.offset) {
                if self.update(entry.register, scaled_value(raw, &entry.scale)) {
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn apply(&mut self, values: Vec<(Register, Value)>) -> usize {
        values
            .into_iter()
            .filter(|(r, v)| self.update(*r, v.clone()))
            .count()
    }

    /// Nested `category -> field -> value` view of the record.
    pub fn to_json(&self) -> Value {
        let mut root = serde_json::Map::new();
        for (register, value) in &self.values {
            let mut node = &mut root;
            let mut parts = register.path().split('.').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_owned(), value.clone());
                    break;
                }
                let entry = node
                    .entry(part.to_owned())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(serde_json::Map::new());
                }
                match entry {
                    Value::Object(map) => node = map,
                    _ => break,
                }
            }
        }
        Value::Object(root)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Register, &Value)> {
        self.values.iter()
    }
} // }}}
