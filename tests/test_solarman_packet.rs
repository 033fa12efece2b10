mod common;
use common::*;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tsun_proxy::solarman::packet::{self, ControlCode, SolarmanCodec};
use tsun_proxy::solarman::Sequence;

#[test]
fn build_then_decode() {
    common_setup();

    let raw = Factory::solarman_frame(0x4710, 0x0203, &[0x00]);
    assert_eq!(raw.len(), packet::OVERHEAD + 1);
    assert_eq!(raw[0], packet::START);
    assert_eq!(*raw.last().unwrap(), packet::STOP);
    assert_eq!(raw[raw.len() - 2], packet::checksum(&raw[1..raw.len() - 2]));

    let mut buf = BytesMut::from(&raw[..]);
    let frame = SolarmanCodec::new().decode(&mut buf).unwrap().unwrap();

    assert_eq!(frame.ctrl, 0x4710);
    assert_eq!(frame.code(), Some(ControlCode::Heartbeat));
    assert_eq!(frame.seq, 0x0203);
    assert_eq!(frame.serial, LOGGER_SN);
    assert_eq!(frame.payload(), &[0x00]);
    assert!(buf.is_empty());
}

#[test]
fn largest_payload_fits_the_length_field() {
    let payload = vec![0x5a; packet::MAX_PAYLOAD];
    let raw = Factory::solarman_frame(0x4210, 0x0101, &payload);
    assert_eq!(&raw[1..3], &[0xff, 0xff]);

    let frame = SolarmanCodec::new()
        .decode(&mut BytesMut::from(&raw[..]))
        .unwrap()
        .unwrap();
    assert_eq!(frame.payload_len(), packet::MAX_PAYLOAD);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "solarman payload of 65536 bytes")]
fn oversized_payload_is_refused() {
    Factory::solarman_frame(0x4210, 0x0101, &vec![0u8; packet::MAX_PAYLOAD + 1]);
}

#[test]
fn checksum_wraps() {
    assert_eq!(packet::checksum(&[]), 0);
    assert_eq!(packet::checksum(&[0xff, 0x02]), 0x01);
}

#[test]
fn bad_start_byte_drops_buffer() {
    let mut raw = vec![0x00];
    raw.extend(Factory::solarman_frame(0x4710, 1, &[0x00]));
    let mut buf = BytesMut::from(&raw[..]);

    let err = SolarmanCodec::new().decode(&mut buf).unwrap_err();
    assert!(matches!(err, FrameError::BadStartByte(0x00)));
    assert!(buf.is_empty());
}

#[test]
fn bad_checksum_drops_one_frame() {
    let mut first = Factory::solarman_frame(0x4710, 1, &[0x00]);
    let n = first.len();
    first[n - 2] ^= 0xff;
    let second = Factory::solarman_frame(0x4110, 2, &[0x02]);

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&second);

    let mut codec = SolarmanCodec::new();
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, FrameError::BadChecksum { .. }));

    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(frame.code(), Some(ControlCode::DeviceInd));
    assert!(buf.is_empty());
}

#[test]
fn bad_stop_byte_drops_one_frame() {
    let mut raw = Factory::solarman_frame(0x4710, 1, &[0x00]);
    let n = raw.len();
    raw[n - 1] = 0x16;

    let mut buf = BytesMut::from(&raw[..]);
    let err = SolarmanCodec::new().decode(&mut buf).unwrap_err();
    assert!(matches!(err, FrameError::BadStopByte(0x16)));
    assert!(buf.is_empty());
}

#[test]
fn partial_reads() {
    let raw = Factory::solarman_data(2248, 73);

    for split in [1, 5, packet::HEADER_LEN, 100, raw.len() - 1] {
        let mut codec = SolarmanCodec::new();
        let mut buf = BytesMut::from(&raw[..split]);
        assert!(codec.decode(&mut buf).unwrap().is_none(), "split at {}", split);

        buf.extend_from_slice(&raw[split..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.code(), Some(ControlCode::Data));
        assert_eq!(frame.payload_len(), raw.len() - packet::OVERHEAD);
    }
}

#[test]
fn response_codes() {
    assert_eq!(ControlCode::response_to(0x4210), 0x1210);
    assert_eq!(ControlCode::response_to(0x4510), 0x1510);
    assert!(ControlCode::is_response(0x1710));
    assert!(!ControlCode::is_response(0x4710));
}

#[test]
fn server_sequence_layout() {
    let mut seq = Sequence::new(true);
    // device counter travels in the low byte
    seq.set_recv(0x0007);
    assert_eq!(seq.received(), 0x07);

    assert_eq!(seq.next_send(), 0x0107);
    assert_eq!(seq.next_send(), 0x0207);
}

#[test]
fn client_sequence_layout() {
    let mut seq = Sequence::new(false);
    seq.set_recv(0x0900);
    assert_eq!(seq.received(), 0x09);
    assert_eq!(seq.next_send(), 0x0901);
}

#[test]
fn sequence_wraps() {
    let mut seq = Sequence::new(false);
    for _ in 0..255 {
        seq.next_send();
    }
    assert_eq!(seq.next_send() & 0xff, 0x00);
}

#[test]
fn rewrite_renumbers_and_rechecks() {
    let mut raw = Factory::solarman_frame(0x4710, 0x0505, &[0x00]);
    raw.extend(Factory::solarman_data(2248, 73));

    let mut seq = Sequence::new(false);
    let out = packet::rewrite_for_forward(&raw, &mut seq);
    assert_eq!(out.len(), raw.len());

    let mut buf = BytesMut::from(&out[..]);
    let mut codec = SolarmanCodec::new();
    let first = codec.decode(&mut buf).unwrap().unwrap();
    let second = codec.decode(&mut buf).unwrap().unwrap();

    assert_eq!(first.seq, 0x0001);
    assert_eq!(second.seq, 0x0002);
    assert_eq!(
        second.payload(),
        &Factory::solarman_data_payload(2248, 73)[..]
    );
}

#[test]
fn payload_headers() {
    let hdr = packet::data_header(&Factory::solarman_data_payload(0, 0)).unwrap();
    assert_eq!(hdr.frame_type, 0x01);
    assert_eq!(hdr.sensor_list, 0x02b0);
    assert!(packet::data_header(&[0x01]).is_err());

    let pdu = modbus::build_pdu(1, 3, 0x3000, 1);
    let payload = packet::command_payload(&pdu);
    assert_eq!(payload.len(), packet::COMMAND_HEADER_LEN + pdu.len());
    let (hdr, rest) = packet::command_pdu(&payload).unwrap();
    assert_eq!(hdr.frame_type, 0x02);
    assert_eq!(rest, &pdu[..]);

    let mut rsp = vec![0x02, 0x01];
    rsp.extend_from_slice(&[0u8; 12]);
    rsp.extend_from_slice(&[0x01, 0x03, 0x02, 0x00, 0x10]);
    let (hdr, rest) = packet::command_response_pdu(&rsp).unwrap();
    assert_eq!(hdr.status, 0x01);
    assert_eq!(rest, &[0x01, 0x03, 0x02, 0x00, 0x10]);
}

#[test]
fn ack_layout() {
    let ack = packet::ack_payload(0x01, 0x6543_2100);
    assert_eq!(ack, vec![0x01, 0x01, 0x00, 0x21, 0x43, 0x65, 0, 0, 0, 0]);
}
