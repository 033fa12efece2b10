use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub from_mqtt: broadcast::Sender<mqtt::ChannelData>,
    pub to_mqtt: broadcast::Sender<mqtt::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_mqtt: Self::channel(),
            to_mqtt: Self::channel(),
        }
    }

    /// Fire-and-forget publish; having no subscriber is not an error.
    pub fn publish(&self, message: mqtt::Message) {
        if self.to_mqtt.send(mqtt::ChannelData::Message(message)).is_err() {
            trace!("to_mqtt has no receivers, message dropped");
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
