//! Per-connection protocol state machine.
//!
//! A `Connection` is owned by exactly one connection task and sees that
//! connection's packets in arrival order. It never touches the socket; it
//! turns each inbound packet into a [`Reply`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::codec::{
    ConnectPacket, ConnectReturnCode, Packet, ProtocolVersion, PublishPacket, QoS, SUBACK_FAILURE,
};
use crate::persistence::CredentialStore;
use crate::queue::Forwarder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated { device_id: String },
    Closed,
}

/// Packets to write back, in order, and whether to close afterwards.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub packets: Vec<Packet>,
    pub close: bool,
}

impl Reply {
    fn send(packet: Packet) -> Self {
        Self {
            packets: vec![packet],
            close: false,
        }
    }

    fn send_and_close(packet: Packet) -> Self {
        Self {
            packets: vec![packet],
            close: true,
        }
    }

    fn close() -> Self {
        Self {
            packets: Vec::new(),
            close: true,
        }
    }
}

pub struct Connection {
    peer: String,
    state: ConnectionState,
    credentials: Arc<dyn CredentialStore>,
    forwarder: Forwarder,
    keep_alive: u16,
}

impl Connection {
    pub fn new(peer: &str, credentials: Arc<dyn CredentialStore>, forwarder: Forwarder) -> Self {
        Self {
            peer: peer.to_string(),
            state: ConnectionState::Unauthenticated,
            credentials,
            forwarder,
            keep_alive: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Authenticated { device_id } => Some(device_id),
            _ => None,
        }
    }

    /// 1.5 times the negotiated keep-alive; `None` when the device asked
    /// for no keep-alive or has not connected yet.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_millis(u64::from(self.keep_alive) * 1500))
    }

    pub fn handle(&mut self, packet: Packet) -> Reply {
        if self.state == ConnectionState::Closed {
            return Reply::close();
        }

        let reply = match packet {
            Packet::Connect(connect) => self.on_connect(connect),
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::Subscribe(subscribe) => {
                for (filter, qos) in &subscribe.filters {
                    info!("{} subscribe refused: {filter} ({qos:?})", self.peer);
                }
                Reply::send(Packet::SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: vec![SUBACK_FAILURE; subscribe.filters.len()],
                })
            }
            Packet::Unsubscribe(unsubscribe) => Reply::send(Packet::UnsubAck(unsubscribe.packet_id)),
            Packet::PingReq => {
                debug!("PINGREQ from {}", self.peer);
                Reply::send(Packet::PingResp)
            }
            Packet::Disconnect => {
                info!("{} disconnected", self.peer);
                Reply::close()
            }
            Packet::PubAck(id) | Packet::PubRec(id) | Packet::PubRel(id) | Packet::PubComp(id) => {
                debug!("Ignoring acknowledgement {id} from {}", self.peer);
                Reply::default()
            }
            other => {
                warn!("{} sent server-only packet {other:?}", self.peer);
                Reply::close()
            }
        };

        if reply.close {
            self.state = ConnectionState::Closed;
        }
        reply
    }

    fn on_connect(&mut self, connect: ConnectPacket) -> Reply {
        if self.state != ConnectionState::Unauthenticated {
            warn!("Second CONNECT from {}; closing", self.peer);
            return Reply::close();
        }
        info!("Client connecting: {} from {}", connect.client_id, self.peer);

        if connect.protocol == ProtocolVersion::V5 {
            return Reply::send_and_close(connack(ConnectReturnCode::UnacceptableProtocolVersion));
        }

        let (Some(username), Some(password)) = (connect.username, connect.password) else {
            warn!("Authentication failed for client: {}", connect.client_id);
            return Reply::send_and_close(connack(ConnectReturnCode::BadUserNameOrPassword));
        };
        let password = String::from_utf8_lossy(&password);

        match self.credentials.find_by_credentials(&username, &password) {
            Ok(Some(_)) => {
                info!(
                    "Client authenticated: {}, DeviceId: {username}",
                    connect.client_id
                );
                self.keep_alive = connect.keep_alive;
                self.state = ConnectionState::Authenticated {
                    device_id: username,
                };
                Reply::send(connack(ConnectReturnCode::Accepted))
            }
            Ok(None) => {
                warn!("Authentication failed for client: {}", connect.client_id);
                Reply::send_and_close(connack(ConnectReturnCode::BadUserNameOrPassword))
            }
            Err(e) => {
                warn!("Credential lookup failed for {}: {e}", connect.client_id);
                Reply::send_and_close(connack(ConnectReturnCode::ServerUnavailable))
            }
        }
    }

    fn on_publish(&mut self, publish: PublishPacket) -> Reply {
        debug!(
            "PUBLISH from {} on '{}' ({:?}, {} bytes)",
            self.peer,
            publish.topic,
            publish.qos,
            publish.payload.len()
        );

        match self.device_id() {
            Some(device_id) => self
                .forwarder
                .forward(device_id, &publish.topic, &publish.payload),
            None => warn!("Received PUBLISH from unauthenticated device at {}", self.peer),
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => Reply::send(Packet::PubAck(id)),
            _ => Reply::default(),
        }
    }
}

fn connack(code: ConnectReturnCode) -> Packet {
    Packet::ConnAck {
        session_present: false,
        code,
    }
}
