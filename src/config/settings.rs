use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the listener address, gateway limits, the durable queue, the
/// document store and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub gateway: GatewaySettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Address the MQTT gateway binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Connection limits and timeouts for the protocol gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    pub max_connections: usize,
    /// Tokio worker threads; `0` keeps the runtime default.
    pub worker_threads: usize,
    pub connect_timeout_secs: u64,
    pub max_packet_size: usize,
    pub shutdown_grace_secs: u64,
}

/// Durable queue between the gateway and the telemetry consumer.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub path: String,
    pub topic: String,
    pub partitions: usize,
    pub consumer_group: String,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_records_per_partition: Option<usize>,
}

/// Location of the device/model/telemetry document store.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub gateway: Option<PartialGatewaySettings>,
    pub queue: Option<PartialQueueSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialGatewaySettings {
    pub max_connections: Option<usize>,
    pub worker_threads: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub max_packet_size: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialQueueSettings {
    pub path: Option<String>,
    pub topic: Option<String>,
    pub partitions: Option<usize>,
    pub consumer_group: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_records_per_partition: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
            },
            gateway: GatewaySettings {
                max_connections: 1000,
                worker_threads: 0,
                connect_timeout_secs: 10,
                max_packet_size: 1024 * 1024,
                shutdown_grace_secs: 5,
            },
            queue: QueueSettings {
                path: "data/queue".to_string(),
                topic: "iot-device-data".to_string(),
                partitions: 8,
                consumer_group: "iot-data-processor".to_string(),
                poll_interval_ms: 100,
                batch_size: 64,
                max_records_per_partition: None,
            },
            storage: StorageSettings {
                path: "data/store".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
