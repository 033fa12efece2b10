mod common;
use common::*;

use tsun_proxy::connection::now_ms;
use tsun_proxy::mqtt::ChannelData;
use tsun_proxy::talent::data::{self, parse_data};
use tsun_proxy::talent::packet::{self, TalentCodec};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

fn messages(outbox: Vec<ChannelData>) -> Vec<(String, String)> {
    outbox
        .into_iter()
        .filter_map(|d| match d {
            ChannelData::Message(m) => Some((m.topic, m.payload)),
            _ => None,
        })
        .collect()
}

fn modbus_response(pdu: &[u8]) -> Vec<u8> {
    packet::build(TALENT_SERIAL, 0x99, 0x77, &data::wrap_modbus(pdu))
}

fn read_input_response(regs: &[u16]) -> Vec<u8> {
    let mut pdu = vec![0x01, modbus::READ_INPUT_REGS, (regs.len() * 2) as u8];
    for r in regs {
        pdu.extend_from_slice(&r.to_be_bytes());
    }
    let crc = modbus::crc16(&pdu);
    pdu.extend_from_slice(&crc.to_le_bytes());
    pdu
}

#[tokio::test]
async fn contact_info_is_acked_and_forwarded() {
    common_setup();

    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    let raw = Factory::talent_contact_info(TALENT_SERIAL);
    assert_eq!(raw.len(), 23);
    session.feed(&raw);

    let core = session.core();
    assert_eq!(core.unique_id.as_deref(), Some(TALENT_SERIAL));
    assert_eq!(core.state, State::Received);
    assert!(core.admitted());
    assert!(core.rx.is_empty());

    let ack = packet::build(TALENT_SERIAL, 0x99, 0x00, &[0x01]);
    assert_eq!(core.tx.peek(), &ack[..]);
    assert_eq!(core.fwd.peek(), &raw[..]);

    assert_eq!(ctx.stats.get(Counter::InverterCnt), 1);
    assert_eq!(
        session.core_mut().take_outbox(),
        vec![ChannelData::Discovery {
            unique_id: TALENT_SERIAL.to_string(),
            node_id: "inv_1/".to_string(),
            suggested_area: "roof".to_string(),
        }]
    );
}

#[tokio::test]
async fn unknown_serial_is_dropped() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_contact_info("R17FFFFFFFFFFFFF"));

    let core = session.core();
    assert!(!core.admitted());
    assert!(core.tx.is_empty());
    assert!(core.fwd.is_empty());
    assert_eq!(core.state, State::Init);
    assert_eq!(ctx.stats.get(Counter::UnknownSnr), 1);
    assert_eq!(ctx.stats.get(Counter::InverterCnt), 0);
}

#[tokio::test]
async fn unknown_serial_allowed_by_config() {
    let config = Factory::config_with(|c| c.allow_unknown = true);
    let ctx = Context::new(config, std::sync::Arc::new(ProtocolStats::new()));
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    let serial = "R17FFFFFFFFFFFFF";
    session.feed(&Factory::talent_contact_info(serial));

    let core = session.core();
    assert!(core.admitted());
    assert_eq!(core.node_id, format!("{}/", serial));
    assert!(!core.fwd.is_empty());
}

#[tokio::test]
async fn get_time_brings_session_up() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    let before = now_ms();
    let raw = Factory::talent_get_time(TALENT_SERIAL);
    session.feed(&raw);
    assert_eq!(session.core().state, State::Up);
    assert_eq!(session.core().fwd.peek(), &raw[..]);

    let mut buf = BytesMut::from(session.core().tx.peek());
    let reply = TalentCodec::new().decode(&mut buf).unwrap().unwrap();
    assert_eq!(reply.ctrl, 0x99);
    assert_eq!(reply.msg_id, 0x22);
    let ts = data::parse_time(reply.payload()).unwrap();
    assert!(ts >= before && ts <= now_ms());
}

#[tokio::test]
async fn data_is_acked_and_published() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_get_time(TALENT_SERIAL));
    session.core_mut().tx.clear();
    session.core_mut().fwd.clear();
    session.core_mut().take_outbox();

    let raw = Factory::talent_data(1_700_000_000_000);
    session.feed(&raw);

    let ack = packet::build(TALENT_SERIAL, 0x99, 0x04, &[0x01]);
    assert_eq!(session.core().tx.peek(), &ack[..]);
    assert_eq!(session.core().fwd.peek(), &raw[..]);

    let mut published = messages(session.core_mut().take_outbox());
    published.sort();
    assert_eq!(
        published,
        vec![
            ("inv_1/grid/Voltage".to_string(), "230.5".to_string()),
            ("inv_1/inverter/Model".to_string(), "\"TSOL-M\"".to_string()),
            ("inv_1/total/Total_Generation".to_string(), "1234.56".to_string()),
        ]
    );

    // unchanged values are not published twice
    session.feed(&raw);
    assert!(messages(session.core_mut().take_outbox()).is_empty());
}

#[tokio::test]
async fn bad_data_type_is_counted_not_fatal() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    let mut payload = Factory::talent_data_payload(0);
    let tag_pos = 4 + 1 + TALENT_SERIAL.len() + 1 + 8 + 4 + 4;
    payload[tag_pos] = 0x7f;
    session.feed(&packet::build(TALENT_SERIAL, 0x91, 0x04, &payload));

    assert_eq!(ctx.stats.get(Counter::InvalidDataType), 1);
    assert!(!session.core().is_closed());
    // the frame still reaches the cloud
    assert!(!session.core().fwd.is_empty());
}

#[tokio::test]
async fn garbage_length_is_counted() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&[0x00, 0x00, 0x00, 0x01, 0x20, 0x00]);
    assert_eq!(ctx.stats.get(Counter::InvalidMsgFormat), 1);
    assert!(session.core().rx.is_empty());

    session.feed(&Factory::talent_contact_info(TALENT_SERIAL));
    assert_eq!(session.core().unique_id.as_deref(), Some(TALENT_SERIAL));
}

#[tokio::test]
async fn unknown_msg_is_forwarded() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    let raw = packet::build(TALENT_SERIAL, 0x91, 0x55, &[1, 2, 3]);
    session.feed(&raw);
    assert_eq!(ctx.stats.get(Counter::UnknownMsg), 1);
    assert_eq!(session.core().fwd.peek(), &raw[..]);
    assert!(session.core().tx.is_empty());
}

#[tokio::test]
async fn modbus_command_round_trip() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_get_time(TALENT_SERIAL));
    session.core_mut().tx.clear();
    session.core_mut().fwd.clear();
    session.core_mut().take_outbox();

    session.handle_event(SessionEvent::Command(Command::ReadInput {
        serial: TALENT_SERIAL.to_string(),
        register: 0x300b,
        count: 2,
    }));
    assert_eq!(ctx.stats.get(Counter::ModbusCmds), 1);

    let pdu = modbus::build_pdu(1, modbus::READ_INPUT_REGS, 0x300b, 2);
    let request = packet::build(TALENT_SERIAL, 0x70, 0x77, &data::wrap_modbus(&pdu));
    assert_eq!(session.core().tx.peek(), &request[..]);

    session.feed(&modbus_response(&read_input_response(&[2298, 150])));
    assert!(!session.core().tunnel.has_pending());
    // answers to our own requests stay local
    assert!(session.core().fwd.is_empty());

    let mut published = messages(session.core_mut().take_outbox());
    published.sort();
    assert_eq!(
        published,
        vec![
            ("inv_1/grid/Current".to_string(), "1.5".to_string()),
            ("inv_1/grid/Voltage".to_string(), "229.8".to_string()),
        ]
    );
}

#[tokio::test]
async fn modbus_command_needs_up_state() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_contact_info(TALENT_SERIAL));
    session.core_mut().tx.clear();

    session.handle_event(SessionEvent::Command(Command::WriteSingle {
        serial: TALENT_SERIAL.to_string(),
        register: 0x2000,
        value: 1,
    }));
    assert!(session.core().tx.is_empty());
    assert_eq!(ctx.stats.get(Counter::ModbusCmds), 0);
}

#[tokio::test(start_paused = true)]
async fn modbus_timeout_retries_once() {
    let ctx = Factory::ctx();
    let (mut session, mut events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_get_time(TALENT_SERIAL));
    session.handle_event(SessionEvent::Command(Command::ReadInput {
        serial: TALENT_SERIAL.to_string(),
        register: 0x3000,
        count: 1,
    }));
    session.core_mut().tx.clear();

    let event = events.recv().await.unwrap();
    assert!(matches!(event, SessionEvent::ModbusTimeout(_)));
    session.handle_event(event);
    assert!(!session.core().tx.is_empty(), "retransmitted");
    session.core_mut().tx.clear();

    let event = events.recv().await.unwrap();
    assert!(matches!(event, SessionEvent::ModbusTimeout(_)));
    session.handle_event(event);
    assert!(session.core().tx.is_empty());
    assert!(!session.core().tunnel.has_pending());
    assert_eq!(ctx.stats.get(Counter::ModbusTimeout), 2);
}

#[tokio::test(start_paused = true)]
async fn idle_device_is_closed() {
    let ctx = Factory::ctx();
    let (mut session, mut events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_contact_info(TALENT_SERIAL));
    assert_eq!(ctx.stats.get(Counter::InverterCnt), 1);

    let event = events.recv().await.unwrap();
    assert!(matches!(event, SessionEvent::IdleTimeout(_)));
    session.handle_event(event);

    assert!(session.core().is_closed());
    assert_eq!(ctx.stats.get(Counter::InverterCnt), 0);
}

#[tokio::test]
async fn stale_timer_events_are_ignored() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_contact_info(TALENT_SERIAL));
    session.handle_event(SessionEvent::IdleTimeout(0));
    assert!(!session.core().is_closed());
}

#[tokio::test]
async fn abortive_close_drops_pending_output() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_contact_info(TALENT_SERIAL));
    assert!(!session.core().tx.is_empty());

    session.handle_event(SessionEvent::Close { graceful: false });
    assert!(session.core().is_closed());
    assert!(session.core().tx.is_empty());

    // closing twice is harmless
    session.handle_event(SessionEvent::Close { graceful: true });
    assert_eq!(ctx.stats.get(Counter::InverterCnt), 0);

    session.feed(&Factory::talent_contact_info(TALENT_SERIAL));
    assert!(session.core().rx.is_empty());
}

#[tokio::test]
async fn cloud_leg_learns_clock_offset() {
    let ctx = Factory::ctx();
    let (tx, _events) = Factory::events();
    let mut session = Session::new_client(Family::Talent, ctx.clone(), &tx, Some(TALENT_SERIAL));

    let cloud_ts = now_ms() + 60_000;
    session.feed(&packet::build(TALENT_SERIAL, 0x99, 0x22, &cloud_ts.to_be_bytes()));
    assert_eq!(session.core().state, State::Up);
    // nothing goes back to the device for a time answer
    assert!(session.core().fwd.is_empty());

    let offset = match &session {
        Session::Talent(c) => c.ts_offset(),
        _ => unreachable!(),
    };
    assert!((59_000..=60_000).contains(&offset), "offset {}", offset);

    // device data is restamped on the way out
    let ts = 1_700_000_000_000;
    session.handle_event(SessionEvent::FromRemote(Factory::talent_data(ts).into()));

    let mut buf = BytesMut::from(session.core().tx.peek());
    let frame = TalentCodec::new().decode(&mut buf).unwrap().unwrap();
    let block = parse_data(frame.payload()).unwrap();
    assert_eq!(block.timestamp, ts + offset);
}

#[tokio::test]
async fn cloud_modbus_request_is_passed_through() {
    let ctx = Factory::ctx();
    let (tx, _events) = Factory::events();
    let mut session = Session::new_client(Family::Talent, ctx.clone(), &tx, Some(TALENT_SERIAL));

    let pdu = modbus::build_pdu(1, modbus::READ_HOLDING_REGS, 0x2000, 1);
    let raw = packet::build(TALENT_SERIAL, 0x70, 0x77, &data::wrap_modbus(&pdu));
    session.feed(&raw);
    assert_eq!(session.core().fwd.peek(), &raw[..]);
    assert_eq!(ctx.stats.get(Counter::ModbusCrcErr), 0);

    // cloud acks for frames the proxy already answered are swallowed
    session.core_mut().fwd.clear();
    session.feed(&packet::build(TALENT_SERIAL, 0x99, 0x04, &[0x01]));
    assert!(session.core().fwd.is_empty());
}

#[tokio::test]
async fn emulated_heartbeat_and_data() {
    let ctx = Factory::ctx();
    let (tx, _events) = Factory::events();
    let mut session = Session::new_client(Family::Talent, ctx.clone(), &tx, Some(TALENT_SERIAL));

    session.send_heartbeat();
    assert_eq!(session.core().state, State::Pend);
    assert_eq!(
        session.core().tx.peek(),
        &Factory::talent_get_time(TALENT_SERIAL)[..]
    );
    session.core_mut().tx.clear();

    let mut record = DeviceRecord::new();
    let block = parse_data(&Factory::talent_data_payload(0)).unwrap();
    record.apply_talent(&block.items);
    session.send_data(&record);

    let mut buf = BytesMut::from(session.core().tx.peek());
    let frame = TalentCodec::new().decode(&mut buf).unwrap().unwrap();
    assert_eq!((frame.ctrl, frame.msg_id), (0x91, 0x04));

    let mut replay = DeviceRecord::new();
    replay.apply_talent(&parse_data(frame.payload()).unwrap().items);
    assert_eq!(replay.to_json(), record.to_json());
}

fn cloud_modbus_request(reg: u16, count: u16) -> Vec<u8> {
    let pdu = modbus::build_pdu(1, modbus::READ_INPUT_REGS, reg, count);
    packet::build(TALENT_SERIAL, 0x70, 0x77, &data::wrap_modbus(&pdu))
}

#[tokio::test]
async fn cloud_request_waits_for_local_command() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_get_time(TALENT_SERIAL));
    session.core_mut().tx.clear();
    session.core_mut().fwd.clear();

    session.handle_event(SessionEvent::Command(Command::ReadInput {
        serial: TALENT_SERIAL.to_string(),
        register: 0x300b,
        count: 2,
    }));
    session.core_mut().tx.clear();

    // same register count as our own read, so only ordering tells them apart
    let cloud = cloud_modbus_request(0x0000, 2);
    session.handle_event(SessionEvent::FromRemote(cloud.clone().into()));
    assert!(session.core().tx.is_empty(), "held while our read is outstanding");
    assert_eq!(session.core().tunnel.held(), 1);

    // our answer completes the local read and releases the cloud request
    session.feed(&modbus_response(&read_input_response(&[2298, 150])));
    assert!(session.core().fwd.is_empty());
    assert_eq!(session.core().db.get_f64(Register::GridVoltage), Some(229.8));
    assert_eq!(session.core().tx.peek(), &cloud[..]);
    assert!(session.core().tunnel.cloud_in_flight());

    // the cloud's answer goes back to the cloud and leaves telemetry alone
    let answer = modbus_response(&read_input_response(&[7777, 8888]));
    session.feed(&answer);
    assert_eq!(session.core().fwd.peek(), &answer[..]);
    assert_eq!(session.core().db.get_f64(Register::GridVoltage), Some(229.8));
    assert!(!session.core().tunnel.link_busy());
}

#[tokio::test]
async fn local_command_waits_for_cloud_request() {
    let ctx = Factory::ctx();
    let (mut session, _events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_get_time(TALENT_SERIAL));
    session.core_mut().tx.clear();
    session.core_mut().fwd.clear();

    let cloud = cloud_modbus_request(0x0000, 2);
    session.handle_event(SessionEvent::FromRemote(cloud.clone().into()));
    assert_eq!(session.core().tx.peek(), &cloud[..]);
    session.core_mut().tx.clear();

    session.handle_event(SessionEvent::Command(Command::ReadInput {
        serial: TALENT_SERIAL.to_string(),
        register: 0x300b,
        count: 2,
    }));
    assert!(session.core().tx.is_empty(), "queued behind the cloud request");

    let answer = modbus_response(&read_input_response(&[7777, 8888]));
    session.feed(&answer);
    assert_eq!(session.core().fwd.peek(), &answer[..]);
    assert_eq!(session.core().db.get_f64(Register::GridVoltage), None);

    let pdu = modbus::build_pdu(1, modbus::READ_INPUT_REGS, 0x300b, 2);
    let request = packet::build(TALENT_SERIAL, 0x70, 0x77, &data::wrap_modbus(&pdu));
    assert_eq!(session.core().tx.peek(), &request[..]);
    assert!(session.core().tunnel.has_pending());
}

#[tokio::test(start_paused = true)]
async fn unanswered_cloud_request_frees_the_link() {
    let ctx = Factory::ctx();
    let (mut session, mut events) = Factory::session(Family::Talent, Role::Server, &ctx);

    session.feed(&Factory::talent_get_time(TALENT_SERIAL));
    session.handle_event(SessionEvent::FromRemote(cloud_modbus_request(0x0000, 2).into()));
    session.handle_event(SessionEvent::Command(Command::ReadInput {
        serial: TALENT_SERIAL.to_string(),
        register: 0x300b,
        count: 2,
    }));
    session.core_mut().tx.clear();

    loop {
        match events.recv().await.unwrap() {
            e @ SessionEvent::ModbusTimeout(_) => {
                session.handle_event(e);
                break;
            }
            _ => {}
        }
    }

    // never retransmitted; our read goes out instead
    assert!(!session.core().tunnel.cloud_in_flight());
    assert!(session.core().tunnel.has_pending());
    let pdu = modbus::build_pdu(1, modbus::READ_INPUT_REGS, 0x300b, 2);
    let request = packet::build(TALENT_SERIAL, 0x70, 0x77, &data::wrap_modbus(&pdu));
    assert_eq!(session.core().tx.peek(), &request[..]);
}
