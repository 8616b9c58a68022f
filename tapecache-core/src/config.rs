use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COMMIT_RATE_MS, DEFAULT_MAXIMUM_SIZE, DEFAULT_REDUCED_RATE_MULTIPLIER,
    DEFAULT_UPLOAD_PERIOD_MS,
};

/// Tuning shared by every topic cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfiguration {
    /// Delay between the first uncommitted record and the flush that commits it.
    #[serde(rename = "commit_rate_ms", with = "duration_ms")]
    pub commit_rate: Duration,
    /// Upper bound of each cache file in bytes.
    pub maximum_size: u64,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            commit_rate: Duration::from_millis(DEFAULT_COMMIT_RATE_MS),
            maximum_size: DEFAULT_MAXIMUM_SIZE,
        }
    }
}

/// Upload policy of the submission orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Nothing is uploaded until a user id is known.
    pub user_id: Option<String>,
    /// Only upload over unmetered connections.
    pub wifi_only: bool,
    /// On metered connections, still upload high-priority topics.
    pub send_high_priority_over_data: bool,
    pub high_priority_topics: BTreeSet<String>,
    #[serde(rename = "upload_period_ms", with = "duration_ms")]
    pub upload_period: Duration,
    /// Upload period multiplier while the battery is low.
    pub reduced_rate_multiplier: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            wifi_only: false,
            send_high_priority_over_data: false,
            high_priority_topics: BTreeSet::new(),
            upload_period: Duration::from_millis(DEFAULT_UPLOAD_PERIOD_MS),
            reduced_rate_multiplier: DEFAULT_REDUCED_RATE_MULTIPLIER,
        }
    }
}

impl SubmitterConfig {
    #[must_use]
    pub fn is_high_priority(&self, topic: &str) -> bool {
        self.high_priority_topics.contains(topic)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
