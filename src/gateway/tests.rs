use super::codec::{ProtocolVersion, SubscribePacket, UnsubscribePacket, decode};
use super::*;
use crate::persistence::{CredentialStore, Device};
use crate::queue::{Envelope, Forwarder, QueueProducer};
use crate::tests::fixtures::{DEVICE_ID, SECRET_PATH, seeded_store};
use crate::utils::error::{ProtocolError, QueueError, StoreError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX: usize = 1024 * 1024;

#[derive(Default)]
struct RecordingProducer {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingProducer {
    fn envelopes(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, value)| serde_json::from_str(value).unwrap())
            .collect()
    }
}

impl QueueProducer for RecordingProducer {
    fn send(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.sent
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }
}

struct BrokenStore;

impl CredentialStore for BrokenStore {
    fn find_by_credentials(&self, _: &str, _: &str) -> Result<Option<Device>, StoreError> {
        Err(StoreError::Sled(sled::Error::Unsupported("offline".into())))
    }
}

fn connection() -> (Connection, Arc<RecordingProducer>) {
    let producer = Arc::new(RecordingProducer::default());
    let connection = Connection::new(
        "test-peer",
        seeded_store(),
        Forwarder::new(producer.clone()),
    );
    (connection, producer)
}

fn connect(username: &str, password: &str) -> Packet {
    Packet::Connect(ConnectPacket::new("client-1").with_credentials(username, password))
}

fn publish(topic: &str, payload: &str, qos: QoS, packet_id: Option<u16>) -> Packet {
    Packet::Publish(PublishPacket {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
        qos,
        packet_id,
        dup: false,
        retain: false,
    })
}

fn connack(code: ConnectReturnCode) -> Packet {
    Packet::ConnAck {
        session_present: false,
        code,
    }
}

async fn roundtrip(packet: &Packet) -> Packet {
    let bytes = packet.encode();
    read_packet(&mut bytes.as_slice(), MAX)
        .await
        .unwrap()
        .expect("a packet")
}

#[tokio::test]
async fn test_connect_with_credentials_decodes() {
    let packet = connect(DEVICE_ID, SECRET_PATH);
    let Packet::Connect(decoded) = roundtrip(&packet).await else {
        panic!("expected CONNECT");
    };
    assert_eq!(decoded.protocol, ProtocolVersion::V3_1_1);
    assert_eq!(decoded.client_id, "client-1");
    assert_eq!(decoded.keep_alive, 60);
    assert_eq!(decoded.username.as_deref(), Some(DEVICE_ID));
    assert_eq!(decoded.password.as_deref(), Some(SECRET_PATH.as_bytes()));
}

#[tokio::test]
async fn test_mqtt_3_1_connect_decodes() {
    let mut connect = ConnectPacket::new("legacy");
    connect.protocol = ProtocolVersion::V3_1;
    let Packet::Connect(decoded) = roundtrip(&Packet::Connect(connect)).await else {
        panic!("expected CONNECT");
    };
    assert_eq!(decoded.protocol, ProtocolVersion::V3_1);
    assert_eq!(decoded.username, None);
}

#[test]
fn test_connack_bytes() {
    assert_eq!(
        connack(ConnectReturnCode::BadUserNameOrPassword).encode(),
        vec![0x20, 0x02, 0x00, 0x04]
    );
}

#[tokio::test]
async fn test_qos1_publish_keeps_packet_id() {
    let packet = publish("sensors/temp", "{\"temp\":25}", QoS::AtLeastOnce, Some(7));
    assert_eq!(roundtrip(&packet).await, packet);
}

#[tokio::test]
async fn test_large_payload_uses_multi_byte_length() {
    let payload = "x".repeat(20_000);
    let packet = publish("t", &payload, QoS::AtMostOnce, None);
    let bytes = packet.encode();
    assert_eq!(bytes[1] & 0x80, 0x80);
    assert_eq!(roundtrip(&packet).await, packet);
}

#[tokio::test]
async fn test_every_ack_type_decodes() {
    for packet in [
        Packet::PubAck(1),
        Packet::PubRec(2),
        Packet::PubRel(3),
        Packet::PubComp(4),
        Packet::UnsubAck(5),
        Packet::PingReq,
        Packet::PingResp,
        Packet::Disconnect,
        Packet::SubAck {
            packet_id: 6,
            return_codes: vec![0x80, 0x80],
        },
        Packet::Subscribe(SubscribePacket {
            packet_id: 8,
            filters: vec![("a/+".to_string(), QoS::AtLeastOnce)],
        }),
        Packet::Unsubscribe(UnsubscribePacket {
            packet_id: 9,
            topics: vec!["a/#".to_string()],
        }),
    ] {
        assert_eq!(roundtrip(&packet).await, packet);
    }
}

#[tokio::test]
async fn test_clean_eof_yields_none() {
    let mut empty: &[u8] = &[];
    assert!(read_packet(&mut empty, MAX).await.unwrap().is_none());
}

#[tokio::test]
async fn test_truncated_frame_is_an_error() {
    let bytes = publish("t", "payload", QoS::AtMostOnce, None).encode();
    let mut truncated = &bytes[..bytes.len() - 2];
    assert!(matches!(
        read_packet(&mut truncated, MAX).await,
        Err(ProtocolError::UnexpectedEof)
    ));
}

#[tokio::test]
async fn test_five_byte_remaining_length_is_rejected() {
    let mut bytes: &[u8] = &[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    assert!(matches!(
        read_packet(&mut bytes, MAX).await,
        Err(ProtocolError::MalformedLength)
    ));
}

#[tokio::test]
async fn test_packet_over_limit_is_rejected() {
    let bytes = publish("t", &"x".repeat(100), QoS::AtMostOnce, None).encode();
    assert!(matches!(
        read_packet(&mut bytes.as_slice(), 16).await,
        Err(ProtocolError::PacketTooLarge { limit: 16, .. })
    ));
}

#[test]
fn test_wildcard_publish_topic_is_rejected() {
    // topic "a/#", no payload
    let body = [0x00, 0x03, b'a', b'/', b'#'];
    assert!(matches!(
        decode(3, 0, &body),
        Err(ProtocolError::InvalidTopic(_))
    ));
    assert!(matches!(
        decode(3, 0, &[0x00, 0x00]),
        Err(ProtocolError::InvalidTopic(_))
    ));
}

#[test]
fn test_bad_fixed_header_flags_are_rejected() {
    assert!(matches!(
        decode(8, 0, &[0x00, 0x01]),
        Err(ProtocolError::InvalidFlags { packet_type: 8, .. })
    ));
    assert!(matches!(
        decode(3, 0b0110, &[0x00, 0x01, b't']),
        Err(ProtocolError::InvalidQos(3))
    ));
}

#[test]
fn test_unknown_protocol_name_is_rejected() {
    let mut body = vec![0x00, 0x04];
    body.extend_from_slice(b"HTTP");
    body.extend_from_slice(&[4, 0x02, 0x00, 0x3C, 0x00, 0x00]);
    assert!(matches!(
        decode(1, 0, &body),
        Err(ProtocolError::InvalidProtocolName(_))
    ));
}

#[test]
fn test_unsupported_packet_type() {
    assert!(matches!(
        decode(15, 0, &[]),
        Err(ProtocolError::UnsupportedPacketType(15))
    ));
}

#[test]
fn test_valid_connect_authenticates() {
    let (mut connection, _) = connection();
    let reply = connection.handle(connect(DEVICE_ID, SECRET_PATH));
    assert_eq!(reply.packets, vec![connack(ConnectReturnCode::Accepted)]);
    assert!(!reply.close);
    assert_eq!(
        connection.state(),
        &ConnectionState::Authenticated {
            device_id: DEVICE_ID.to_string()
        }
    );
    assert_eq!(connection.idle_timeout(), Some(Duration::from_secs(90)));
}

#[test]
fn test_wrong_secret_is_refused_and_closed() {
    let (mut connection, _) = connection();
    let reply = connection.handle(connect(DEVICE_ID, "secret/other"));
    assert_eq!(
        reply.packets,
        vec![connack(ConnectReturnCode::BadUserNameOrPassword)]
    );
    assert!(reply.close);
    assert_eq!(connection.state(), &ConnectionState::Closed);
}

#[test]
fn test_missing_password_is_refused() {
    let (mut connection, _) = connection();
    let mut packet = ConnectPacket::new("client-1");
    packet.username = Some(DEVICE_ID.to_string());
    let reply = connection.handle(Packet::Connect(packet));
    assert_eq!(
        reply.packets,
        vec![connack(ConnectReturnCode::BadUserNameOrPassword)]
    );
    assert!(reply.close);
}

#[test]
fn test_store_failure_reports_server_unavailable() {
    let producer = Arc::new(RecordingProducer::default());
    let mut connection = Connection::new("p", Arc::new(BrokenStore), Forwarder::new(producer));
    let reply = connection.handle(connect(DEVICE_ID, SECRET_PATH));
    assert_eq!(
        reply.packets,
        vec![connack(ConnectReturnCode::ServerUnavailable)]
    );
    assert!(reply.close);
}

#[test]
fn test_v5_connect_is_refused() {
    let (mut connection, _) = connection();
    let mut packet = ConnectPacket::new("client-5").with_credentials(DEVICE_ID, SECRET_PATH);
    packet.protocol = ProtocolVersion::V5;
    let reply = connection.handle(Packet::Connect(packet));
    assert_eq!(
        reply.packets,
        vec![connack(ConnectReturnCode::UnacceptableProtocolVersion)]
    );
    assert!(reply.close);
}

#[test]
fn test_second_connect_closes() {
    let (mut connection, _) = connection();
    connection.handle(connect(DEVICE_ID, SECRET_PATH));
    let reply = connection.handle(connect(DEVICE_ID, SECRET_PATH));
    assert!(reply.packets.is_empty());
    assert!(reply.close);
    assert_eq!(connection.state(), &ConnectionState::Closed);
}

#[test]
fn test_authenticated_publish_forwards_once_per_qos() {
    let (mut connection, producer) = connection();
    connection.handle(connect(DEVICE_ID, SECRET_PATH));

    let reply = connection.handle(publish("t/0", "a", QoS::AtMostOnce, None));
    assert!(reply.packets.is_empty());

    let reply = connection.handle(publish("t/1", "b", QoS::AtLeastOnce, Some(42)));
    assert_eq!(reply.packets, vec![Packet::PubAck(42)]);

    // forwarded, never acknowledged
    let reply = connection.handle(publish("t/2", "c", QoS::ExactlyOnce, Some(43)));
    assert!(reply.packets.is_empty());

    let envelopes = producer.envelopes();
    assert_eq!(
        envelopes,
        vec![
            Envelope::new(DEVICE_ID, "t/0", b"a"),
            Envelope::new(DEVICE_ID, "t/1", b"b"),
            Envelope::new(DEVICE_ID, "t/2", b"c"),
        ]
    );
    assert!(
        producer
            .sent
            .lock()
            .unwrap()
            .iter()
            .all(|(key, _)| key == DEVICE_ID)
    );
}

#[test]
fn test_unauthenticated_publish_is_never_forwarded() {
    let (mut connection, producer) = connection();
    let reply = connection.handle(publish("t", "{\"temp\":1}", QoS::AtLeastOnce, Some(9)));
    assert_eq!(reply.packets, vec![Packet::PubAck(9)]);
    assert!(!reply.close);
    assert!(producer.sent.lock().unwrap().is_empty());
}

#[test]
fn test_subscribe_is_refused_per_filter() {
    let (mut connection, _) = connection();
    connection.handle(connect(DEVICE_ID, SECRET_PATH));
    let reply = connection.handle(Packet::Subscribe(SubscribePacket {
        packet_id: 3,
        filters: vec![
            ("a".to_string(), QoS::AtMostOnce),
            ("b/#".to_string(), QoS::AtLeastOnce),
        ],
    }));
    assert_eq!(
        reply.packets,
        vec![Packet::SubAck {
            packet_id: 3,
            return_codes: vec![0x80, 0x80],
        }]
    );
}

#[test]
fn test_unsubscribe_ping_and_disconnect() {
    let (mut connection, _) = connection();
    connection.handle(connect(DEVICE_ID, SECRET_PATH));

    let reply = connection.handle(Packet::Unsubscribe(UnsubscribePacket {
        packet_id: 11,
        topics: vec!["a".to_string()],
    }));
    assert_eq!(reply.packets, vec![Packet::UnsubAck(11)]);

    assert_eq!(connection.handle(Packet::PingReq).packets, vec![Packet::PingResp]);
    assert_eq!(connection.handle(Packet::PubAck(1)), Reply::default());

    let reply = connection.handle(Packet::Disconnect);
    assert!(reply.close);
    assert_eq!(connection.state(), &ConnectionState::Closed);
    assert!(connection.handle(Packet::PingReq).close);
}

#[test]
fn test_zero_keep_alive_disables_idle_timeout() {
    let (mut connection, _) = connection();
    let mut packet = ConnectPacket::new("c").with_credentials(DEVICE_ID, SECRET_PATH);
    packet.keep_alive = 0;
    connection.handle(Packet::Connect(packet));
    assert_eq!(connection.idle_timeout(), None);
}
