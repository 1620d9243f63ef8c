use serde::Deserialize;
use std::time::Duration;

fn default_hash_name() -> String {
    "queue_h".to_string()
}

fn default_list_name() -> String {
    "queue_l".to_string()
}

fn default_sorted_set_name() -> String {
    "queue_s".to_string()
}

fn default_fifo() -> bool {
    true
}

/// Ephemeral-storage policy, identical in shape to
/// `reliqueue_sql::EphemeralConfig` but kept local so this crate has
/// no dependency on `reliqueue-sql`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EphemeralConfig {
    #[serde(default)]
    pub ephemeral_disabled: bool,
    #[serde(default)]
    pub ephemeral_max_size: Option<usize>,
}

impl From<&EphemeralConfig> for reliqueue_core::EphemeralPolicy {
    fn from(cfg: &EphemeralConfig) -> Self {
        reliqueue_core::EphemeralPolicy::new(cfg.ephemeral_disabled, cfg.ephemeral_max_size)
    }
}

/// Configuration for the key-value adapter, one pool per distinct
/// key shared the way `mod_redis::RedisConnKey` scopes one pool per
/// connection key.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisQueueConfig {
    /// `redis://host:port/db`-style connection string.
    pub node: String,
    #[serde(default = "default_fifo")]
    pub fifo: bool,
    #[serde(default = "default_hash_name")]
    pub redis_hash_name: String,
    #[serde(default = "default_list_name")]
    pub redis_list_name: String,
    #[serde(default = "default_sorted_set_name")]
    pub redis_sorted_set_name: String,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default, with = "opt_duration_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "opt_duration_serde")]
    pub response_timeout: Option<Duration>,
    #[serde(default)]
    pub ephemeral: EphemeralConfig,
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = Option::<Repr>::deserialize(deserializer)?;
        Ok(match repr {
            None => None,
            Some(Repr::Millis(ms)) => Some(Duration::from_millis(ms)),
            Some(Repr::Text(s)) => {
                Some(humantime::parse_duration(&s).map_err(serde::de::Error::custom)?)
            }
        })
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_millis()),
            None => serializer.serialize_none(),
        }
    }
}
