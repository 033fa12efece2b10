use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    /// One message per changed telemetry field, under the device's node id.
    pub fn for_changes(node_id: &str, changes: Vec<(Register, serde_json::Value)>) -> Vec<Message> {
        changes
            .into_iter()
            .map(|(register, value)| Message {
                topic: format!("{}{}", node_id, register.topic()),
                retain: false,
                payload: value.to_string(),
            })
            .collect()
    }

    pub fn for_stats(stats: &ProtocolStats) -> Result<Message> {
        Ok(Message {
            topic: "proxy/stats".to_string(),
            retain: false,
            payload: serde_json::to_string(&stats.snapshot())?,
        })
    }

    pub fn to_command(&self) -> Result<Command> {
        let (serial, parts) = self.split_cmd_topic()?;
        let serial = serial.to_owned();

        let r = match parts[..] {
            ["modbus_read_regs"] => {
                let (register, count) = self.payload_pair()?;
                Command::ReadHolding { serial, register, count: count.unwrap_or(1) }
            }
            ["modbus_read_inputs"] => {
                let (register, count) = self.payload_pair()?;
                Command::ReadInput { serial, register, count: count.unwrap_or(1) }
            }
            ["modbus_write_reg"] => match self.payload_pair()? {
                (register, Some(value)) => Command::WriteSingle { serial, register, value },
                (_, None) => bail!("modbus_write_reg needs \"register,value\": {:?}", self),
            },
            [..] => bail!("unhandled: {:?}", self),
        };

        Ok(r)
    }

    // given a cmd Message, return the serial it is intended for.
    //
    // eg cmd/R170000000000001/modbus_read_regs => (R170000000000001, ['modbus_read_regs'])
    pub fn split_cmd_topic(&self) -> Result<(&str, Vec<&str>)> {
        let parts: Vec<&str> = self.topic.split('/').collect();

        // this *shouldn't* happen as our subscribe is for {ns}/cmd/#
        if parts.len() < 3 || parts[0] != "cmd" {
            bail!("ignoring badly formed MQTT topic: {}", self.topic);
        }

        Ok((parts[1], parts[2..].to_vec()))
    }

    // "0x3000,10" or "12288" -> (0x3000, Some(10)) / (12288, None)
    fn payload_pair(&self) -> Result<(u16, Option<u16>)> {
        let mut it = self.payload.split(',').map(str::trim);
        let first = it
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("empty payload"))?;
        let second = it.next().map(parse_u16).transpose()?;
        Ok((parse_u16(first)?, second))
    }
} // }}}

fn parse_u16(s: &str) -> Result<u16> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.map_err(|err| anyhow!("payload_int {}: {}", s, err))
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    /// a device was admitted; (re)publish its discovery config
    Discovery {
        unique_id: String,
        node_id: String,
        suggested_area: String,
    },
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    shutdown: Arc<AtomicBool>,
    channels: Channels,
    stats: Arc<ProtocolStats>,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, stats: Arc<ProtocolStats>) -> Self {
        Self {
            config,
            channels,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("tsun-proxy", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        client
            .subscribe(
                format!("{}/cmd/#", self.config.mqtt().namespace()),
                QoS::AtMostOnce,
            )
            .await?;

        Ok(())
    }

    // mqtt -> proxy
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("MQTT receiver shutting down");
                break;
            }

            if let Ok(event) =
                tokio::time::timeout(std::time::Duration::from_secs(1), eventloop.poll()).await
            {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Err(e) = self.handle_message(publish) {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => {
                        if !self.shutdown.load(Ordering::Relaxed) {
                            error!("{}", e);
                            info!("reconnecting in 5s");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                    _ => {} // keepalives etc
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        // remove the namespace, including the first /
        // doing it this way means we don't break if namespace happens to contain a /
        let namespace_len = self.config.mqtt().namespace().len() + 1;
        let topic = publish
            .topic
            .get(namespace_len..)
            .ok_or_else(|| anyhow!("topic outside namespace: {}", publish.topic))?
            .to_owned();

        let message = Message {
            topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);
        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // proxy -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            let message = match receiver.recv().await {
                Ok(Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.disconnect().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                    self.stats.inc(Counter::MqttErrors);
                    continue;
                }
                Ok(Discovery { unique_id, node_id, suggested_area }) => {
                    self.publish_discovery(&client, &unique_id, &node_id, &suggested_area).await;
                    continue;
                }
                Ok(Message(message)) => message,
            };

            let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
            debug!("publishing: {} = {}", topic, message.payload);
            let mut retry_count = 0;
            loop {
                match client
                    .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                    .await
                {
                    Ok(_) => {
                        self.stats.inc(Counter::MqttMessagesSent);
                        break;
                    }
                    Err(err) => {
                        self.stats.inc(Counter::MqttErrors);
                        retry_count += 1;
                        if retry_count >= 3 {
                            error!("MQTT publish to {} failed, giving up: {:?}", topic, err);
                            break;
                        }
                        error!("MQTT publish failed: {:?} - retrying in 10s (attempt {}/3)", err, retry_count);
                        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish_discovery(&self, client: &AsyncClient, unique_id: &str, node_id: &str, area: &str) {
        if !self.config.homeassistant_enabled() {
            return;
        }

        let ha = crate::home_assistant::Config::new(unique_id, node_id, area, &self.config.mqtt());
        match ha.all() {
            Ok(messages) => {
                info!("publishing home assistant discovery for {}", unique_id);
                for msg in messages {
                    if client
                        .publish(&msg.topic, QoS::AtLeastOnce, msg.retain, msg.payload)
                        .await
                        .is_err()
                    {
                        self.stats.inc(Counter::MqttErrors);
                    }
                }
            }
            Err(e) => warn!("home assistant config for {}: {}", unique_id, e),
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
