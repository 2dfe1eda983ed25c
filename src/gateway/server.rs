use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::codec::read_packet;
use super::connection::{Connection, ConnectionState};
use crate::config::GatewaySettings;
use crate::persistence::CredentialStore;
use crate::queue::Forwarder;

/// Everything a connection task needs, shared by all of them.
struct ConnectionContext {
    credentials: Arc<dyn CredentialStore>,
    forwarder: Forwarder,
    max_packet_size: usize,
    connect_timeout: Duration,
}

/// The MQTT listener.
pub struct Gateway {
    listener: TcpListener,
    settings: GatewaySettings,
    context: Arc<ConnectionContext>,
}

impl Gateway {
    /// Bind the listening socket. Failing to bind is fatal for the caller.
    pub async fn bind(
        addr: &str,
        settings: GatewaySettings,
        credentials: Arc<dyn CredentialStore>,
        forwarder: Forwarder,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("MQTT gateway listening on {}", listener.local_addr()?);

        let context = Arc::new(ConnectionContext {
            credentials,
            forwarder,
            max_packet_size: settings.max_packet_size,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        });
        Ok(Self {
            listener,
            settings,
            context,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips to true, then give live
    /// connections the grace period before aborting them.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let Gateway {
            listener,
            settings,
            context,
        } = self;
        let limiter = Arc::new(Semaphore::new(settings.max_connections.max(1)));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    let Ok(permit) = limiter.clone().try_acquire_owned() else {
                        warn!("Connection limit reached; refusing {peer}");
                        continue;
                    };
                    let context = context.clone();
                    connections.spawn(async move {
                        handle_connection(stream, peer, context).await;
                        drop(permit);
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        info!(
            "Gateway shutting down; waiting for {} connection(s)",
            connections.len()
        );

        let grace = Duration::from_secs(settings.shutdown_grace_secs);
        let drained = timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {} connection(s) after shutdown grace period",
                connections.len()
            );
            connections.shutdown().await;
        }
        info!("Gateway stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: Arc<ConnectionContext>) {
    let peer = peer.to_string();
    debug!("Accepted connection from {peer}");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut connection = Connection::new(
        &peer,
        context.credentials.clone(),
        context.forwarder.clone(),
    );
    let connect_deadline = Instant::now() + context.connect_timeout;

    loop {
        let read = read_packet(&mut reader, context.max_packet_size);
        let result = match connection.state() {
            ConnectionState::Unauthenticated => match timeout_at(connect_deadline, read).await {
                Ok(result) => result,
                Err(_) => {
                    info!("{peer} did not connect in time");
                    break;
                }
            },
            _ => match connection.idle_timeout() {
                Some(idle) => match timeout(idle, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        info!("{peer} idle past keep-alive; closing");
                        break;
                    }
                },
                None => read.await,
            },
        };

        let packet = match result {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("{peer} closed the connection");
                break;
            }
            Err(e) => {
                warn!("Protocol error from {peer}: {e}");
                break;
            }
        };

        let reply = connection.handle(packet);
        for packet in &reply.packets {
            if let Err(e) = writer.write_all(&packet.encode()).await {
                warn!("Failed to write to {peer}: {e}");
                return;
            }
        }
        if reply.close {
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!("Connection from {peer} closed");
}
