//! Protocol gateway: accepts MQTT devices over TCP, authenticates them and
//! forwards their publishes to the queue bridge.

pub mod codec;
pub mod connection;
pub mod server;

pub use codec::{ConnectPacket, ConnectReturnCode, Packet, PublishPacket, QoS, read_packet};
pub use connection::{Connection, ConnectionState, Reply};
pub use server::Gateway;

#[cfg(test)]
mod tests;
