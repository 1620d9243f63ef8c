use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_table_name() -> String {
    "queue".to_string()
}

fn default_table_name_ephemeral() -> String {
    "queue_ephemeral".to_string()
}

fn default_busy_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

/// Ephemeral-storage policy shared by both relational variants,
/// following the teacher's pattern (`mod_redis::RedisConnKey`) of a
/// plain `serde::Deserialize` config struct with field-level defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EphemeralConfig {
    #[serde(default)]
    pub ephemeral_disabled: bool,
    #[serde(default)]
    pub ephemeral_max_size: Option<usize>,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            ephemeral_disabled: false,
            ephemeral_max_size: None,
        }
    }
}

impl From<&EphemeralConfig> for reliqueue_core::EphemeralPolicy {
    fn from(cfg: &EphemeralConfig) -> Self {
        reliqueue_core::EphemeralPolicy::new(cfg.ephemeral_disabled, cfg.ephemeral_max_size)
    }
}

/// Configuration for the two-table relational adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlQueueConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub fifo: bool,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_table_name_ephemeral")]
    pub table_name_ephemeral: String,
    #[serde(default = "default_busy_timeout", with = "duration_serde")]
    pub busy_timeout: Duration,
    #[serde(default)]
    pub ephemeral: EphemeralConfig,
}

/// Configuration for the less-locking single-table relational
/// adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlLessLockingQueueConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub fifo: bool,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_busy_timeout", with = "duration_serde")]
    pub busy_timeout: Duration,
    #[serde(default)]
    pub ephemeral: EphemeralConfig,
}

/// `serde(with = "duration_serde")` for plain `Duration` fields: accepts
/// an integer/float number of seconds or a humantime string on the way
/// in, and always writes a humantime string on the way out.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*d).to_string().serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Duration;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("a duration")
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                humantime::parse_duration(v)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        d.deserialize_any(V)
    }

    #[cfg(test)]
    #[derive(Deserialize, Serialize)]
    struct Probe {
        #[serde(with = "self")]
        time: Duration,
    }

    #[cfg(test)]
    mod test {
        use super::Probe;
        use std::time::Duration;

        #[test]
        fn from_string() {
            let probe: Probe = serde_json::from_str(r#"{"time": "15s"}"#).unwrap();
            assert_eq!(probe.time, Duration::from_secs(15));
        }

        #[test]
        fn from_int_seconds() {
            let probe: Probe = serde_json::from_str(r#"{"time": 15}"#).unwrap();
            assert_eq!(probe.time, Duration::from_secs(15));
        }

        #[test]
        fn round_trips_to_humantime_string() {
            let probe = Probe { time: Duration::from_secs(15) };
            let json = serde_json::to_string(&probe).unwrap();
            assert_eq!(json, r#"{"time":"15s"}"#);
        }
    }
}
