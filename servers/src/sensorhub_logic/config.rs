use clap::Parser;
use clap::builder::RangedU64ValueParser;
use lib_sensorhub::ingestors::BusSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(about = "Sensor telemetry gateway: MQTT ingestion, persistence and live fan-out", version)]
pub struct Config {
    #[clap(long, env = "PORT", default_value_t = 3000, help = "Port for the HTTP API and WebSocket clients.")]
    pub port: u16,

    #[clap(long, env = "MQTT_BROKER", default_value = "mqtt://localhost:1883", help = "MQTT broker URL (mqtt:// or tcp://).")]
    pub mqtt_broker: String,

    #[clap(long, env = "MQTT_TOPIC", default_value = "sensor/data", help = "Topic filter to subscribe to.")]
    pub mqtt_topic: String,

    #[clap(long, env = "MQTT_CLIENT_ID", help = "MQTT client id. Defaults to sensorhub-<pid>.")]
    pub mqtt_client_id: Option<String>,

    #[clap(long, env = "MQTT_USERNAME", help = "MQTT username; overrides credentials in the broker URL.")]
    pub mqtt_username: Option<String>,

    #[clap(long, env = "MQTT_PASSWORD", hide_env_values = true, help = "MQTT password.")]
    pub mqtt_password: Option<String>,

    #[clap(long, env = "MQTT_KEEP_ALIVE_SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(5..), help = "MQTT keep-alive interval in seconds.")]
    pub mqtt_keep_alive_secs: u64,

    #[clap(long, env = "DATABASE_URL", hide_env_values = true, help = "PostgreSQL connection URL. Without it events are kept in memory only.")]
    pub database_url: Option<String>,

    #[clap(long, env = "DB_POOL_SIZE", default_value_t = 8, value_parser = RangedU64ValueParser::<usize>::new().range(1..), help = "Maximum pooled database connections.")]
    pub db_pool_size: usize,

    #[clap(long, env = "PERSIST_TIMEOUT_MS", default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..), help = "Upper bound in milliseconds for one event write.")]
    pub persist_timeout_ms: u64,

    #[clap(long, env = "MAX_PENDING_WRITES", default_value_t = 256, value_parser = RangedU64ValueParser::<usize>::new().range(1..), help = "Background event writes allowed in flight while the database is stalling.")]
    pub max_pending_writes: usize,

    #[clap(long, env = "MEMORY_STORE_MAX_EVENTS", default_value_t = 100_000, value_parser = RangedU64ValueParser::<usize>::new().range(1..), help = "Events kept by the in-memory store before the oldest are evicted.")]
    pub memory_store_max_events: usize,

    #[clap(long, env = "SUBSCRIBER_QUEUE", default_value_t = 64, value_parser = RangedU64ValueParser::<usize>::new().range(1..), help = "Frames buffered per subscriber before it is dropped as lagging.")]
    pub subscriber_queue: usize,

    #[clap(long, env = "BUS_CHANNEL", default_value_t = 1024, value_parser = RangedU64ValueParser::<usize>::new().range(1..), help = "Capacity of the bus to pipeline channel.")]
    pub bus_channel: usize,

    #[clap(long, env = "SSE_KEEP_ALIVE_SECS", default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..), help = "Interval in seconds between SSE keep-alive comments.")]
    pub sse_keep_alive_secs: u64,

    #[clap(long, env = "LOG_LEVEL", default_value = "info", help = "Logging level or filter directive (RUST_LOG takes precedence).")]
    pub log_level: String,

    #[clap(long, env = "LOG_DIR", help = "Directory for rolling log files. Console only when unset.")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn client_id(&self) -> String {
        self.mqtt_client_id
            .clone()
            .unwrap_or_else(|| format!("sensorhub-{}", std::process::id()))
    }

    pub fn bus_settings(&self) -> BusSettings {
        let credentials = self
            .mqtt_username
            .clone()
            .map(|user| (user, self.mqtt_password.clone().unwrap_or_default()));
        BusSettings {
            broker_url: self.mqtt_broker.clone(),
            topic: self.mqtt_topic.clone(),
            client_id: self.client_id(),
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            credentials,
        }
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn sse_keep_alive(&self) -> Duration {
        Duration::from_secs(self.sse_keep_alive_secs)
    }
}
