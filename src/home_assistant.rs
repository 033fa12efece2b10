use crate::prelude::*;

use serde::Serialize;

#[derive(Debug, Serialize)]
struct Device {
    identifiers: [String; 1],
    name: String,
    manufacturer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    suggested_area: String,
}

#[derive(Debug, Serialize)]
struct Entity<'a> {
    name: &'a str,
    state_topic: String,
    unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    availability_topic: String,
    device: &'a Device,
}

/// Home Assistant discovery messages for one device.
pub struct Config {
    unique_id: String,
    node_id: String,
    namespace: String,
    prefix: String,
    device: Device,
}

impl Config {
    pub fn new(unique_id: &str, node_id: &str, suggested_area: &str, mqtt: &config::Mqtt) -> Self {
        Self {
            unique_id: unique_id.to_owned(),
            node_id: node_id.to_owned(),
            namespace: mqtt.namespace().to_owned(),
            prefix: mqtt.homeassistant().prefix().to_owned(),
            device: Device {
                identifiers: [unique_id.to_owned()],
                name: node_id.trim_end_matches('/').to_owned(),
                manufacturer: "TSUN".to_owned(),
                suggested_area: suggested_area.to_owned(),
            },
        }
    }

    pub fn all(&self) -> Result<Vec<mqtt::Message>> {
        Register::ALL.iter().map(|r| self.sensor(*r)).collect()
    }

    fn sensor(&self, register: Register) -> Result<mqtt::Message> {
        let info = register.info();
        let slug = register.path().replace('.', "_").to_lowercase();
        let state_class = match (info.must_increase || info.midnight_reset, info.unit) {
            (true, _) => Some("total_increasing"),
            (false, Some(_)) => Some("measurement"),
            (false, None) => None,
        };

        let entity = Entity {
            name: info.name,
            state_topic: format!("{}/{}{}", self.namespace, self.node_id, register.topic()),
            unique_id: format!("{}_{}", self.unique_id, slug),
            device_class: info.device_class,
            state_class,
            unit_of_measurement: info.unit,
            availability_topic: format!("{}/LWT", self.namespace),
            device: &self.device,
        };

        Ok(mqtt::Message {
            // absolute topic, published outside our namespace
            topic: format!("{}/sensor/{}/{}/config", self.prefix, self.unique_id, slug),
            retain: true,
            payload: serde_json::to_string(&entity)?,
        })
    }
}
