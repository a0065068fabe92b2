use std::str::FromStr;
use std::time::Duration;

/// Output style of the log subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("unknown log format {other:?}")),
        }
    }
}

/// Runtime configuration, read from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    /// sqlite url for the journal; `None` keeps everything in memory.
    pub database_url: Option<String>,
    pub max_message_len: usize,
    pub outbound_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Messages per room included in a resync snapshot.
    pub resync_history: usize,
    /// Rooms a single connection may bring into existence.
    pub max_rooms_per_connection: usize,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: None,
            max_message_len: 2000,
            outbound_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            resync_history: 50,
            max_rooms_per_connection: 32,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            Ok(parse(&lookup, key)?.map(Duration::from_secs).unwrap_or(default))
        };

        let config = Self {
            bind_addr: lookup("HUDDLE_BIND").unwrap_or(defaults.bind_addr),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_message_len: parse(&lookup, "HUDDLE_MAX_MESSAGE_LEN")?
                .unwrap_or(defaults.max_message_len),
            outbound_queue: parse(&lookup, "HUDDLE_OUTBOUND_QUEUE")?
                .unwrap_or(defaults.outbound_queue),
            heartbeat_interval: secs("HUDDLE_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            heartbeat_timeout: secs("HUDDLE_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?,
            resync_history: parse(&lookup, "HUDDLE_RESYNC_HISTORY")?
                .unwrap_or(defaults.resync_history),
            max_rooms_per_connection: parse(&lookup, "HUDDLE_MAX_ROOMS_PER_CONNECTION")?
                .unwrap_or(defaults.max_rooms_per_connection),
            log_format: parse(&lookup, "HUDDLE_LOG_FORMAT")?.unwrap_or(defaults.log_format),
        };

        anyhow::ensure!(config.max_message_len > 0, "HUDDLE_MAX_MESSAGE_LEN must be positive");
        anyhow::ensure!(config.outbound_queue > 0, "HUDDLE_OUTBOUND_QUEUE must be positive");
        anyhow::ensure!(
            config.heartbeat_timeout > config.heartbeat_interval,
            "heartbeat timeout must exceed the ping interval"
        );

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    lookup(key)
        .map(|raw| match raw.trim().parse::<T>() {
            Ok(value) => Ok(value),
            Err(e) => {
                let e: anyhow::Error = e.into();
                Err(e.context(format!("invalid value for {key}: {raw:?}")))
            }
        })
        .transpose()
}
