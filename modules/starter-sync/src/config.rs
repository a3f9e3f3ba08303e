use event_bus::{ConsumerConfig, InitialOffset, RetryConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Nats,
}

impl FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inmemory" => Ok(BusType::InMemory),
            "nats" => Ok(BusType::Nats),
            other => Err(format!(
                "Invalid BUS_TYPE: {}. Must be 'inmemory' or 'nats'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    InMemory,
    Postgres,
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inmemory" => Ok(StoreType::InMemory),
            "postgres" => Ok(StoreType::Postgres),
            other => Err(format!(
                "Invalid STORE_TYPE: {}. Must be 'inmemory' or 'postgres'",
                other
            )),
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub brokers: Vec<String>,
    pub consumer_group: String,
    pub starter_topic: String,
    pub notification_topic: String,
    pub topic_partitions: u32,
    pub initial_offset: InitialOffset,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryConfig,
    pub dead_letter_topic: Option<String>,
    pub store_type: StoreType,
    pub database_url: Option<String>,
    pub elasticsearch_url: Option<String>,
    pub elasticsearch_index: String,
    pub reindex_batch_size: u32,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Unset and blank are the same thing
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let or_default = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let bus_type: BusType = or_default("BUS_TYPE", "inmemory").parse()?;

        let brokers: Vec<String> = var("BROKERS")
            .or_else(|| var("NATS_URL"))
            .unwrap_or_else(|| "nats://localhost:4222".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if bus_type == BusType::Nats && brokers.is_empty() {
            return Err("BROKERS must list at least one server when BUS_TYPE=nats".to_string());
        }

        let consumer_group = or_default("CONSUMER_GROUP", "starter-sync");
        let starter_topic = or_default("STARTER_TOPIC", "starters");
        let notification_topic = or_default("NOTIFICATION_TOPIC", "notifications");
        if starter_topic == notification_topic {
            return Err("STARTER_TOPIC and NOTIFICATION_TOPIC must differ".to_string());
        }

        let topic_partitions: u32 = parse(&var, "TOPIC_PARTITIONS", "8")?;
        if topic_partitions == 0 {
            return Err("TOPIC_PARTITIONS must be at least 1".to_string());
        }

        let initial_offset: InitialOffset = or_default("CONSUMER_INITIAL_OFFSET", "oldest")
            .parse()
            .map_err(|e| format!("CONSUMER_INITIAL_OFFSET: {}", e))?;

        let session_timeout = millis(&var, "CONSUMER_SESSION_TIMEOUT_MS", "10000")?;
        let heartbeat_interval = millis(&var, "CONSUMER_HEARTBEAT_MS", "3000")?;
        if heartbeat_interval >= session_timeout {
            return Err(
                "CONSUMER_HEARTBEAT_MS must be lower than CONSUMER_SESSION_TIMEOUT_MS".to_string(),
            );
        }

        let retry = RetryConfig {
            max_retries: parse(&var, "RETRY_MAX_RETRIES", "3")?,
            initial_backoff: millis(&var, "RETRY_INITIAL_DELAY_MS", "100")?,
            max_backoff: millis(&var, "RETRY_MAX_DELAY_MS", "10000")?,
            multiplier: parse(&var, "RETRY_MULTIPLIER", "2.0")?,
            jitter: parse(&var, "RETRY_JITTER", "true")?,
        };
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err("RETRY_MULTIPLIER must be a finite number >= 1.0".to_string());
        }
        if retry.initial_backoff > retry.max_backoff {
            return Err("RETRY_INITIAL_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".to_string());
        }

        let dead_letter_topic = var("DEAD_LETTER_TOPIC");
        if let Some(dlq) = &dead_letter_topic {
            if *dlq == starter_topic || *dlq == notification_topic {
                return Err("DEAD_LETTER_TOPIC must not be a consumed topic".to_string());
            }
        }

        let store_type: StoreType = or_default("STORE_TYPE", "inmemory").parse()?;
        let database_url = var("DATABASE_URL");
        if store_type == StoreType::Postgres && database_url.is_none() {
            return Err("DATABASE_URL must be set when STORE_TYPE=postgres".to_string());
        }

        let elasticsearch_url = var("ELASTICSEARCH_URL");
        let elasticsearch_index = or_default("ELASTICSEARCH_INDEX", "starters");

        let reindex_batch_size: u32 = parse(&var, "REINDEX_BATCH_SIZE", "100")?;
        if reindex_batch_size == 0 {
            return Err("REINDEX_BATCH_SIZE must be at least 1".to_string());
        }

        let host = or_default("HOST", "0.0.0.0");
        let port: u16 = var("PORT")
            .unwrap_or_else(|| "8091".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        Ok(Config {
            bus_type,
            brokers,
            consumer_group,
            starter_topic,
            notification_topic,
            topic_partitions,
            initial_offset,
            session_timeout,
            heartbeat_interval,
            retry,
            dead_letter_topic,
            store_type,
            database_url,
            elasticsearch_url,
            elasticsearch_index,
            reindex_batch_size,
            host,
            port,
        })
    }

    /// One runtime consumes both the starter and the notification topic
    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(
            self.consumer_group.clone(),
            vec![self.starter_topic.clone(), self.notification_topic.clone()],
        )
        .with_initial_offset(self.initial_offset)
        .with_retry(self.retry.clone());
        config.session_timeout = self.session_timeout;
        config.heartbeat_interval = self.heartbeat_interval;
        config.dead_letter_topic = self.dead_letter_topic.clone();
        config
    }
}

fn parse<T, V>(var: &V, name: &str, default: &str) -> Result<T, String>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    var(name)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse()
        .map_err(|_| format!("{} has an invalid value", name))
}

fn millis<V>(var: &V, name: &str, default: &str) -> Result<Duration, String>
where
    V: Fn(&str) -> Option<String>,
{
    parse::<u64, V>(var, name, default).map(Duration::from_millis)
}
