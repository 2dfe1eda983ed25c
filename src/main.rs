//! CLI for the telemetry gateway
//!
//! Subcommands:
//! - `server`: run the MQTT gateway and the queue consumer
//! - `seed`: register device models and devices from a JSON fixture
//! - `publish`: connect as a device and publish one message (smoke tests)
//! - `query`: print a device's stored telemetry as JSON

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info};

use telemetry_gateway::config::{Settings, load_config};
use telemetry_gateway::gateway::{
    ConnectPacket, ConnectReturnCode, Gateway, Packet, PublishPacket, QoS, read_packet,
};
use telemetry_gateway::persistence::{SledSecretStore, SledStore};
use telemetry_gateway::provision::{Provisioner, SeedFile};
use telemetry_gateway::queue::{BridgeConsumer, Forwarder, SledQueue};
use telemetry_gateway::schema::SchemaValidator;
use telemetry_gateway::telemetry::TelemetryService;
use telemetry_gateway::utils::logging;

#[derive(Parser)]
#[command(name = "telemetry-gateway")]
enum Command {
    /// Run the MQTT gateway and the queue consumer until Ctrl-C
    Server,
    /// Register the models and devices listed in a JSON fixture
    Seed {
        /// Fixture with `models` and `devices` arrays
        file: PathBuf,
    },
    /// Connect as a device and publish a single message
    Publish {
        /// Gateway address (default: the configured server address)
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        device: String,
        /// Secret path issued at registration
        #[arg(long)]
        secret: String,
        #[arg(long, default_value = "iot/any")]
        topic: String,
        #[arg(long)]
        payload: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
    },
    /// Print stored telemetry for a device, newest first
    Query {
        #[arg(long)]
        device: String,
        /// RFC 3339 lower bound (default: 24 hours ago)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound (default: now)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 10)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        page: i64,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.gateway.worker_threads > 0 {
        builder.worker_threads(config.gateway.worker_threads);
    }
    let runtime = match builder.enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        match cmd {
            Command::Server => run_server(config).await,
            Command::Seed { file } => run_seed(&config, &file),
            Command::Publish {
                addr,
                device,
                secret,
                topic,
                payload,
                qos,
            } => {
                let addr =
                    addr.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
                run_publish(&addr, &device, &secret, &topic, &payload, qos).await
            }
            Command::Query {
                device,
                from,
                to,
                limit,
                page,
            } => run_query(&config, &device, from, to, limit, page),
        }
    });

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(SledStore::open(&config.storage.path)?);
    let queue = Arc::new(SledQueue::open(
        &config.queue.path,
        &config.queue.topic,
        config.queue.partitions,
        config.queue.max_records_per_partition,
    )?);
    let service = Arc::new(TelemetryService::new(store.clone(), SchemaValidator::new()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let gateway = Gateway::bind(
        &addr,
        config.gateway.clone(),
        store.clone(),
        Forwarder::new(queue.clone()),
    )
    .await?;
    let consumer = BridgeConsumer::new(
        queue.clone(),
        service.clone(),
        &config.queue.consumer_group,
        config.queue.batch_size,
        Duration::from_millis(config.queue.poll_interval_ms),
    );

    let (shutdown, rx) = watch::channel(false);
    let consumer = tokio::spawn(consumer.run(rx.clone()));
    let gateway = tokio::spawn(gateway.serve(rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    shutdown.send(true)?;
    gateway.await?;
    consumer.await?;

    queue.flush()?;
    store.flush()?;
    let stats = service.stats();
    info!(
        "Stored {} telemetry records, dropped {}",
        stats.stored,
        stats.dropped()
    );
    Ok(())
}

fn run_seed(config: &Settings, file: &Path) -> Result<(), Box<dyn Error>> {
    let seed: SeedFile = serde_json::from_str(&std::fs::read_to_string(file)?)?;
    let store = Arc::new(SledStore::open(&config.storage.path)?);
    let secrets = Arc::new(SledSecretStore::open(store.db())?);
    let provisioner = Provisioner::new(
        store.clone(),
        secrets,
        &config.server.host,
        config.server.port,
    );

    let (models, devices) = provisioner.seed(seed)?;
    store.flush()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "models": models,
            "devices": devices,
        }))?
    );
    Ok(())
}

async fn run_publish(
    addr: &str,
    device: &str,
    secret: &str,
    topic: &str,
    payload: &str,
    qos: u8,
) -> Result<(), Box<dyn Error>> {
    const MAX_PACKET: usize = 64 * 1024;

    let qos = QoS::from_u8(qos)?;
    let mut stream = TcpStream::connect(addr).await?;

    let connect = ConnectPacket::new(&format!("cli-{device}")).with_credentials(device, secret);
    stream.write_all(&Packet::Connect(connect).encode()).await?;
    match read_packet(&mut stream, MAX_PACKET).await? {
        Some(Packet::ConnAck {
            code: ConnectReturnCode::Accepted,
            ..
        }) => info!("Connected to {addr} as {device}"),
        Some(Packet::ConnAck { code, .. }) => {
            return Err(format!("connection refused: {code:?}").into());
        }
        other => return Err(format!("expected CONNACK, got {other:?}").into()),
    }

    let packet_id = (qos != QoS::AtMostOnce).then_some(1);
    let publish = PublishPacket {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
        qos,
        packet_id,
        dup: false,
        retain: false,
    };
    stream.write_all(&Packet::Publish(publish).encode()).await?;

    if qos == QoS::AtLeastOnce {
        match read_packet(&mut stream, MAX_PACKET).await? {
            Some(Packet::PubAck(1)) => info!("Publish acknowledged"),
            other => return Err(format!("expected PUBACK, got {other:?}").into()),
        }
    }

    stream.write_all(&Packet::Disconnect.encode()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn run_query(
    config: &Settings,
    device: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: i64,
    page: i64,
) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(SledStore::open(&config.storage.path)?);
    let service = TelemetryService::new(store, SchemaValidator::new());

    let to = to.unwrap_or_else(Utc::now);
    let from = from.unwrap_or_else(|| to - chrono::Duration::hours(24));
    let records = service.search_data(device, from, to, limit, page)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
