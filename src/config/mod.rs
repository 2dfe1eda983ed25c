mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    GatewaySettings, LoggingSettings, QueueSettings, ServerSettings, Settings, StorageSettings,
};

/// Loads the configuration from `config/default.*` and `TG__*` environment
/// variables, then merges it onto `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("TG").separator("__"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server.as_ref();
    let gateway = partial.gateway.as_ref();
    let queue = partial.queue.as_ref();

    Settings {
        server: ServerSettings {
            host: server
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server.and_then(|s| s.port).unwrap_or(default.server.port),
        },
        gateway: GatewaySettings {
            max_connections: gateway
                .and_then(|g| g.max_connections)
                .unwrap_or(default.gateway.max_connections),
            worker_threads: gateway
                .and_then(|g| g.worker_threads)
                .unwrap_or(default.gateway.worker_threads),
            connect_timeout_secs: gateway
                .and_then(|g| g.connect_timeout_secs)
                .unwrap_or(default.gateway.connect_timeout_secs),
            max_packet_size: gateway
                .and_then(|g| g.max_packet_size)
                .unwrap_or(default.gateway.max_packet_size),
            shutdown_grace_secs: gateway
                .and_then(|g| g.shutdown_grace_secs)
                .unwrap_or(default.gateway.shutdown_grace_secs),
        },
        queue: QueueSettings {
            path: queue
                .and_then(|q| q.path.clone())
                .unwrap_or(default.queue.path),
            topic: queue
                .and_then(|q| q.topic.clone())
                .unwrap_or(default.queue.topic),
            partitions: queue
                .and_then(|q| q.partitions)
                .unwrap_or(default.queue.partitions),
            consumer_group: queue
                .and_then(|q| q.consumer_group.clone())
                .unwrap_or(default.queue.consumer_group),
            poll_interval_ms: queue
                .and_then(|q| q.poll_interval_ms)
                .unwrap_or(default.queue.poll_interval_ms),
            batch_size: queue
                .and_then(|q| q.batch_size)
                .unwrap_or(default.queue.batch_size),
            max_records_per_partition: queue
                .and_then(|q| q.max_records_per_partition)
                .or(default.queue.max_records_per_partition),
        },
        storage: StorageSettings {
            path: partial
                .storage
                .and_then(|s| s.path)
                .unwrap_or(default.storage.path),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    }
}
