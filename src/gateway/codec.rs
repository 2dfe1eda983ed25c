//! MQTT 3.1 / 3.1.1 control packets.
//!
//! Decoding reads one frame from an async stream; encoding produces the
//! complete frame. Both directions are implemented for every packet type so
//! the same codec drives the gateway and the `publish` client.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3_1,
    V3_1_1,
    /// Recognised only so it can be refused with a proper CONNACK.
    V5,
}

impl ProtocolVersion {
    fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V3_1 => "MQIsdp",
            ProtocolVersion::V3_1_1 | ProtocolVersion::V5 => "MQTT",
        }
    }

    fn level(self) -> u8 {
        match self {
            ProtocolVersion::V3_1 => 3,
            ProtocolVersion::V3_1_1 => 4,
            ProtocolVersion::V5 => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUserNameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            _ => return Err(ProtocolError::Malformed("unknown connack return code")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl ConnectPacket {
    pub fn new(client_id: &str) -> Self {
        Self {
            protocol: ProtocolVersion::V3_1_1,
            client_id: client_id.to_string(),
            keep_alive: 60,
            clean_session: true,
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.as_bytes().to_vec());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    /// Present iff `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck {
        session_present: bool,
        code: ConnectReturnCode,
    },
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    Unsubscribe(UnsubscribePacket),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// SUBACK return code for a refused filter.
pub const SUBACK_FAILURE: u8 = 0x80;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

/// Read one packet. `Ok(None)` means the peer closed the stream between
/// packets; EOF inside a packet is an error.
pub async fn read_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_packet_size: usize,
) -> Result<Option<Packet>, ProtocolError> {
    let mut first = [0u8; 1];
    if stream.read(&mut first).await? == 0 {
        return Ok(None);
    }
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;

    let remaining_len = decode_remaining_length_stream(stream).await?;
    if remaining_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: remaining_len,
            limit: max_packet_size,
        });
    }
    let mut buf = vec![0u8; remaining_len];
    stream.read_exact(&mut buf).await.map_err(eof)?;

    decode(packet_type, flags, &buf).map(Some)
}

/// Decode a packet body once the fixed header has been split off.
pub fn decode(packet_type: u8, flags: u8, buf: &[u8]) -> Result<Packet, ProtocolError> {
    check_flags(packet_type, flags)?;
    let packet = match packet_type {
        CONNECT => Packet::Connect(parse_connect(buf)?),
        CONNACK => {
            let mut cursor = 0usize;
            let ack_flags = read_u8(buf, &mut cursor)?;
            let code = ConnectReturnCode::from_u8(read_u8(buf, &mut cursor)?)?;
            Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            }
        }
        PUBLISH => Packet::Publish(parse_publish(flags, buf)?),
        PUBACK => Packet::PubAck(parse_packet_id(buf)?),
        PUBREC => Packet::PubRec(parse_packet_id(buf)?),
        PUBREL => Packet::PubRel(parse_packet_id(buf)?),
        PUBCOMP => Packet::PubComp(parse_packet_id(buf)?),
        SUBSCRIBE => Packet::Subscribe(parse_subscribe(buf)?),
        SUBACK => {
            let mut cursor = 0usize;
            let packet_id = read_u16(buf, &mut cursor)?;
            Packet::SubAck {
                packet_id,
                return_codes: buf[cursor..].to_vec(),
            }
        }
        UNSUBSCRIBE => Packet::Unsubscribe(parse_unsubscribe(buf)?),
        UNSUBACK => Packet::UnsubAck(parse_packet_id(buf)?),
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => return Err(ProtocolError::UnsupportedPacketType(other)),
    };
    Ok(packet)
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let (header, body) = match self {
            Packet::Connect(connect) => (CONNECT << 4, encode_connect(connect)),
            Packet::ConnAck {
                session_present,
                code,
            } => (
                CONNACK << 4,
                vec![u8::from(*session_present), *code as u8],
            ),
            Packet::Publish(publish) => {
                let mut flags = (publish.qos as u8) << 1;
                if publish.dup {
                    flags |= 0b1000;
                }
                if publish.retain {
                    flags |= 0b0001;
                }
                let mut body = Vec::with_capacity(publish.topic.len() + publish.payload.len() + 4);
                write_string(&mut body, &publish.topic);
                if let Some(id) = publish.packet_id {
                    body.extend_from_slice(&id.to_be_bytes());
                }
                body.extend_from_slice(&publish.payload);
                ((PUBLISH << 4) | flags, body)
            }
            Packet::PubAck(id) => (PUBACK << 4, id.to_be_bytes().to_vec()),
            Packet::PubRec(id) => (PUBREC << 4, id.to_be_bytes().to_vec()),
            Packet::PubRel(id) => ((PUBREL << 4) | 0b0010, id.to_be_bytes().to_vec()),
            Packet::PubComp(id) => (PUBCOMP << 4, id.to_be_bytes().to_vec()),
            Packet::Subscribe(subscribe) => {
                let mut body = subscribe.packet_id.to_be_bytes().to_vec();
                for (filter, qos) in &subscribe.filters {
                    write_string(&mut body, filter);
                    body.push(*qos as u8);
                }
                ((SUBSCRIBE << 4) | 0b0010, body)
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                let mut body = packet_id.to_be_bytes().to_vec();
                body.extend_from_slice(return_codes);
                (SUBACK << 4, body)
            }
            Packet::Unsubscribe(unsubscribe) => {
                let mut body = unsubscribe.packet_id.to_be_bytes().to_vec();
                for topic in &unsubscribe.topics {
                    write_string(&mut body, topic);
                }
                ((UNSUBSCRIBE << 4) | 0b0010, body)
            }
            Packet::UnsubAck(id) => (UNSUBACK << 4, id.to_be_bytes().to_vec()),
            Packet::PingReq => (PINGREQ << 4, Vec::new()),
            Packet::PingResp => (PINGRESP << 4, Vec::new()),
            Packet::Disconnect => (DISCONNECT << 4, Vec::new()),
        };

        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(header);
        out.extend(encode_remaining_length(body.len()));
        out.extend(body);
        out
    }
}

fn check_flags(packet_type: u8, flags: u8) -> Result<(), ProtocolError> {
    let expected = match packet_type {
        PUBLISH => return Ok(()),
        PUBREL | SUBSCRIBE | UNSUBSCRIBE => 0b0010,
        _ => 0,
    };
    if flags == expected {
        Ok(())
    } else {
        Err(ProtocolError::InvalidFlags { packet_type, flags })
    }
}

fn parse_connect(buf: &[u8]) -> Result<ConnectPacket, ProtocolError> {
    let mut cursor = 0usize;
    let proto_name = read_string(buf, &mut cursor)?;
    let proto_level = read_u8(buf, &mut cursor)?;

    let protocol = match (proto_name.as_str(), proto_level) {
        ("MQIsdp", 3) => ProtocolVersion::V3_1,
        ("MQTT", 4) => ProtocolVersion::V3_1_1,
        ("MQTT", 5) => ProtocolVersion::V5,
        _ => return Err(ProtocolError::InvalidProtocolName(proto_name)),
    };

    let connect_flags = read_u8(buf, &mut cursor)?;
    let keep_alive = read_u16(buf, &mut cursor)?;

    // v5 carries properties we don't parse; the caller refuses it anyway
    if protocol == ProtocolVersion::V5 {
        return Ok(ConnectPacket {
            protocol,
            client_id: String::new(),
            keep_alive,
            clean_session: connect_flags & 0x02 != 0,
            will: None,
            username: None,
            password: None,
        });
    }

    if connect_flags & 0x01 != 0 {
        return Err(ProtocolError::Malformed("reserved connect flag set"));
    }

    let client_id = read_string(buf, &mut cursor)?;
    let clean_session = connect_flags & 0x02 != 0;
    let will = if connect_flags & 0x04 != 0 {
        let qos = QoS::from_u8((connect_flags >> 3) & 0x03)?;
        let topic = read_string(buf, &mut cursor)?;
        let payload = read_binary(buf, &mut cursor)?;
        Some(Will {
            topic,
            payload,
            qos,
            retain: connect_flags & 0x20 != 0,
        })
    } else {
        None
    };

    let username = if connect_flags & 0x80 != 0 {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        Some(read_binary(buf, &mut cursor)?)
    } else {
        None
    };

    Ok(ConnectPacket {
        protocol,
        client_id,
        keep_alive,
        clean_session,
        will,
        username,
        password,
    })
}

fn parse_publish(flags: u8, buf: &[u8]) -> Result<PublishPacket, ProtocolError> {
    let dup = flags & 0b1000 != 0;
    let retain = flags & 0b0001 != 0;
    let qos = QoS::from_u8((flags & 0b0110) >> 1)?;

    let mut cursor = 0usize;
    let topic = read_string(buf, &mut cursor)?;
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(ProtocolError::InvalidTopic(topic));
    }
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(read_u16(buf, &mut cursor)?),
    };

    Ok(PublishPacket {
        topic,
        payload: buf[cursor..].to_vec(),
        qos,
        packet_id,
        dup,
        retain,
    })
}

fn parse_subscribe(buf: &[u8]) -> Result<SubscribePacket, ProtocolError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        let filter = read_string(buf, &mut cursor)?;
        let qos = QoS::from_u8(read_u8(buf, &mut cursor)? & 0x03)?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(ProtocolError::Malformed("subscribe without topic filters"));
    }
    Ok(SubscribePacket { packet_id, filters })
}

fn parse_unsubscribe(buf: &[u8]) -> Result<UnsubscribePacket, ProtocolError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut topics = Vec::new();
    while cursor < buf.len() {
        topics.push(read_string(buf, &mut cursor)?);
    }
    if topics.is_empty() {
        return Err(ProtocolError::Malformed("unsubscribe without topic filters"));
    }
    Ok(UnsubscribePacket { packet_id, topics })
}

fn encode_connect(connect: &ConnectPacket) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(&mut body, connect.protocol.name());
    body.push(connect.protocol.level());

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    if connect.protocol == ProtocolVersion::V5 {
        // empty property block
        body.push(0);
    }

    write_string(&mut body, &connect.client_id);
    if let Some(will) = &connect.will {
        write_string(&mut body, &will.topic);
        write_binary(&mut body, &will.payload);
    }
    if let Some(username) = &connect.username {
        write_string(&mut body, username);
    }
    if let Some(password) = &connect.password {
        write_binary(&mut body, password);
    }
    body
}

fn parse_packet_id(buf: &[u8]) -> Result<u16, ProtocolError> {
    let mut cursor = 0usize;
    read_u16(buf, &mut cursor)
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, ProtocolError> {
    let v = *buf.get(*cursor).ok_or(ProtocolError::UnexpectedEof)?;
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, ProtocolError> {
    if *cursor + 2 > buf.len() {
        return Err(ProtocolError::UnexpectedEof);
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, ProtocolError> {
    let bytes = read_binary(buf, cursor)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        return Err(ProtocolError::UnexpectedEof);
    }
    let bytes = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_binary(out, value.as_bytes());
}

fn write_binary(out: &mut Vec<u8>, value: &[u8]) {
    let len = value.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&value[..len]);
}

async fn decode_remaining_length_stream<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<usize, ProtocolError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.map_err(eof)?;
        value += (buf[0] & 0x7F) as usize * multiplier;
        if buf[0] & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(ProtocolError::MalformedLength)
}

fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

fn eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(err)
    }
}
