//! Decides when cached records may be uploaded.
//!
//! The [`Submitter`] tracks the server status, battery stage and network state, and
//! starts or stops an external [`Uploader`] as those change. Uploading itself
//! (batching, retries, backoff) is the uploader's business.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SubmitterConfig;
use crate::error::Result;
use crate::lock::lock_unpoisoned;
use crate::registry::{CacheGroup, CacheRegistry};

/// Connection status towards the upload server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Disabled,
    Ready,
    Connecting,
    Connected,
    Disconnected,
    Unauthorized,
}

impl ServerStatus {
    /// An upload is starting or running.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "DISABLED",
            Self::Ready => "READY",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Unauthorized => "UNAUTHORIZED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatteryStage {
    Full,
    Reduced,
    Empty,
}

/// Current network link as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    /// Pay-per-byte link, such as mobile data.
    pub metered: bool,
}

impl NetworkState {
    pub const DISCONNECTED: Self = Self {
        connected: false,
        metered: false,
    };
    pub const WIFI: Self = Self {
        connected: true,
        metered: false,
    };
    pub const MOBILE: Self = Self {
        connected: true,
        metered: true,
    };
}

/// Why [`Submitter::start`] did or did not start an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Disabled,
    NoUserId,
    NetworkUnavailable,
    BatteryEmpty,
}

/// Moves cached records to a server. Implementations report back through
/// [`Submitter::on_status`], [`Submitter::on_records_sent`] and
/// [`Submitter::on_upload_failure`], and must not call them from inside these methods.
pub trait Uploader: Send {
    fn start(&mut self, caches: Vec<Arc<CacheGroup>>, period: Duration);
    fn update_period(&mut self, period: Duration);
    fn stop(&mut self);
}

/// Upload counters of one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub records_sent: u64,
    pub failures: u64,
    pub last_failure: Option<String>,
}

struct State<U> {
    status: ServerStatus,
    battery: BatteryStage,
    network: NetworkState,
    config: SubmitterConfig,
    uploader: U,
    stats: HashMap<String, UploadStats>,
}

impl<U: Uploader> State<U> {
    fn network_allowed(&self) -> bool {
        let network = self.network;
        network.connected
            && (!self.config.wifi_only
                || !network.metered
                || self.config.send_high_priority_over_data)
    }

    fn rate_multiplier(&self) -> u32 {
        match self.battery {
            BatteryStage::Reduced => self.config.reduced_rate_multiplier.max(1),
            BatteryStage::Full | BatteryStage::Empty => 1,
        }
    }

    fn upload_period(&self) -> Duration {
        self.config.upload_period * self.rate_multiplier()
    }

    fn blocking_reason(&self) -> Option<StartOutcome> {
        if self.status == ServerStatus::Disabled {
            Some(StartOutcome::Disabled)
        } else if self.config.user_id.as_deref().is_none_or(str::is_empty) {
            Some(StartOutcome::NoUserId)
        } else if !self.network_allowed() {
            Some(StartOutcome::NetworkUnavailable)
        } else if self.battery == BatteryStage::Empty {
            Some(StartOutcome::BatteryEmpty)
        } else {
            None
        }
    }

    fn set_status(&mut self, status: ServerStatus) {
        if self.status != status {
            tracing::info!(from = %self.status, to = %status, "server status changed");
            self.status = status;
        }
    }

    fn stop(&mut self) {
        if self.status.is_active() {
            self.uploader.stop();
            self.set_status(ServerStatus::Ready);
        }
    }
}

/// Gates uploads of every registered cache on status, battery and network.
pub struct Submitter<U> {
    registry: Arc<CacheRegistry>,
    state: Mutex<State<U>>,
}

impl<U: Uploader> Submitter<U> {
    /// Starts in READY, on a full battery without network.
    pub fn new(registry: Arc<CacheRegistry>, config: SubmitterConfig, uploader: U) -> Self {
        Self {
            registry,
            state: Mutex::new(State {
                status: ServerStatus::Ready,
                battery: BatteryStage::Full,
                network: NetworkState::DISCONNECTED,
                config,
                uploader,
                stats: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn status(&self) -> ServerStatus {
        lock_unpoisoned(&self.state).status
    }

    #[must_use]
    pub fn battery_stage(&self) -> BatteryStage {
        lock_unpoisoned(&self.state).battery
    }

    #[must_use]
    pub fn network(&self) -> NetworkState {
        lock_unpoisoned(&self.state).network
    }

    #[must_use]
    pub fn config(&self) -> SubmitterConfig {
        lock_unpoisoned(&self.state).config.clone()
    }

    /// Upload period after applying the battery multiplier.
    #[must_use]
    pub fn upload_period(&self) -> Duration {
        lock_unpoisoned(&self.state).upload_period()
    }

    /// Runs `f` with the uploader, for inspection.
    pub fn with_uploader<R>(&self, f: impl FnOnce(&mut U) -> R) -> R {
        f(&mut lock_unpoisoned(&self.state).uploader)
    }

    /// Starts uploading if nothing blocks it.
    pub fn start(&self) -> StartOutcome {
        let mut state = lock_unpoisoned(&self.state);
        self.start_locked(&mut state)
    }

    fn start_locked(&self, state: &mut State<U>) -> StartOutcome {
        if state.status.is_active() {
            return StartOutcome::AlreadyRunning;
        }
        if let Some(reason) = state.blocking_reason() {
            tracing::debug!(?reason, status = %state.status, "not starting upload");
            return reason;
        }
        state.set_status(ServerStatus::Connecting);
        let caches = self.active_caches_locked(state);
        let period = state.upload_period();
        state.uploader.start(caches, period);
        StartOutcome::Started
    }

    /// Stops a running upload and returns to READY.
    pub fn stop(&self) {
        lock_unpoisoned(&self.state).stop();
    }

    /// Stops any upload and refuses to start until [`enable`](Self::enable).
    pub fn disable(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.stop();
        state.set_status(ServerStatus::Disabled);
    }

    pub fn enable(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if state.status == ServerStatus::Disabled {
            state.set_status(ServerStatus::Ready);
        }
    }

    /// Status reported by the uploader.
    pub fn on_status(&self, status: ServerStatus) {
        let mut state = lock_unpoisoned(&self.state);
        if state.status == ServerStatus::Disabled && status != ServerStatus::Unauthorized {
            tracing::debug!(%status, "ignoring status while disabled");
            return;
        }
        if status == ServerStatus::Unauthorized && state.status.is_active() {
            state.uploader.stop();
        }
        state.set_status(status);
    }

    pub fn on_battery_stage(&self, stage: BatteryStage) {
        let mut state = lock_unpoisoned(&self.state);
        if state.battery == stage {
            return;
        }
        tracing::info!(?stage, "battery stage changed");
        let previous = std::mem::replace(&mut state.battery, stage);
        match stage {
            BatteryStage::Empty => state.stop(),
            BatteryStage::Full | BatteryStage::Reduced => {
                if state.status.is_active() {
                    let period = state.upload_period();
                    state.uploader.update_period(period);
                } else if previous == BatteryStage::Empty && state.status == ServerStatus::Ready {
                    self.start_locked(&mut state);
                }
            }
        }
    }

    pub fn on_network_change(&self, network: NetworkState) {
        let mut state = lock_unpoisoned(&self.state);
        state.network = network;
        if state.network_allowed() {
            if state.status == ServerStatus::Ready {
                self.start_locked(&mut state);
            }
        } else {
            tracing::info!(
                connected = network.connected,
                metered = network.metered,
                "network does not allow uploads"
            );
            state.stop();
        }
    }

    /// Caches the uploader may drain under the current network.
    #[must_use]
    pub fn active_caches(&self) -> Vec<Arc<CacheGroup>> {
        let state = lock_unpoisoned(&self.state);
        self.active_caches_locked(&state)
    }

    fn active_caches_locked(&self, state: &State<U>) -> Vec<Arc<CacheGroup>> {
        let groups = self.registry.groups();
        let priority_only = state.network.metered
            && state.config.wifi_only
            && state.config.send_high_priority_over_data;
        if !priority_only {
            return groups;
        }
        groups
            .into_iter()
            .filter(|group| state.config.is_high_priority(group.topic()))
            .collect()
    }

    pub fn on_records_sent(&self, topic: &str, count: usize) {
        let mut state = lock_unpoisoned(&self.state);
        let stats = state.stats.entry(topic.to_string()).or_default();
        stats.records_sent += count as u64;
        tracing::debug!(topic, count, total = stats.records_sent, "records uploaded");
    }

    pub fn on_upload_failure(&self, topic: &str, reason: &str) {
        let mut state = lock_unpoisoned(&self.state);
        let stats = state.stats.entry(topic.to_string()).or_default();
        stats.failures += 1;
        stats.last_failure = Some(reason.to_string());
        tracing::warn!(topic, reason, failures = stats.failures, "upload failed");
    }

    #[must_use]
    pub fn stats(&self) -> HashMap<String, UploadStats> {
        lock_unpoisoned(&self.state).stats.clone()
    }

    /// Flushes every cache and deletes drained deprecated generations.
    pub fn maintain(&self) -> Result<usize> {
        let mut deleted = 0;
        for group in self.registry.groups() {
            group.flush()?;
            deleted += group.delete_empty_caches()?;
        }
        Ok(deleted)
    }

    /// Replaces the policy, then stops or starts uploads to match it.
    pub fn set_config(&self, config: SubmitterConfig) {
        let mut state = lock_unpoisoned(&self.state);
        state.config = config;
        if state.status.is_active() {
            if state.blocking_reason().is_some() {
                state.stop();
            } else {
                let period = state.upload_period();
                state.uploader.update_period(period);
            }
        } else if state.status == ServerStatus::Ready {
            self.start_locked(&mut state);
        }
    }
}

impl<U> fmt::Debug for Submitter<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfiguration;
    use crate::registry::TopicSchema;
    use crate::schema::Schema;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Recorder {
        running: bool,
        starts: usize,
        topics: Vec<String>,
        period: Option<Duration>,
    }

    impl Uploader for Recorder {
        fn start(&mut self, caches: Vec<Arc<CacheGroup>>, period: Duration) {
            self.running = true;
            self.starts += 1;
            self.topics = caches.iter().map(|g| g.topic().to_string()).collect();
            self.period = Some(period);
        }

        fn update_period(&mut self, period: Duration) {
            self.period = Some(period);
        }

        fn stop(&mut self) {
            self.running = false;
        }
    }

    fn submitter(dir: &TempDir, config: SubmitterConfig) -> Submitter<Recorder> {
        let registry = Arc::new(
            CacheRegistry::new(dir.path(), CacheConfiguration::default()).expect("registry"),
        );
        for topic in ["alerts", "steps"] {
            registry
                .register(TopicSchema::new(topic, Schema::String, Schema::Long))
                .expect("register");
        }
        Submitter::new(registry, config, Recorder::default())
    }

    fn user() -> SubmitterConfig {
        SubmitterConfig {
            user_id: Some("user-1".into()),
            ..SubmitterConfig::default()
        }
    }

    #[test]
    fn start_requires_user_and_network() {
        let dir = TempDir::new().expect("temp dir");
        let submitter = submitter(&dir, SubmitterConfig::default());
        assert_eq!(submitter.start(), StartOutcome::NoUserId);
        submitter.set_config(user());
        assert_eq!(submitter.start(), StartOutcome::NetworkUnavailable);

        submitter.on_network_change(NetworkState::WIFI);
        assert_eq!(submitter.status(), ServerStatus::Connecting);
        assert!(submitter.with_uploader(|u| u.running));
        assert_eq!(submitter.start(), StartOutcome::AlreadyRunning);
    }

    #[test]
    fn reduced_battery_slows_uploads() {
        let dir = TempDir::new().expect("temp dir");
        let submitter = submitter(&dir, user());
        submitter.on_network_change(NetworkState::WIFI);
        submitter.on_battery_stage(BatteryStage::Reduced);
        assert_eq!(
            submitter.with_uploader(|u| u.period),
            Some(Duration::from_secs(50))
        );
        submitter.on_battery_stage(BatteryStage::Full);
        assert_eq!(
            submitter.with_uploader(|u| u.period),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn disabled_ignores_status_except_unauthorized() {
        let dir = TempDir::new().expect("temp dir");
        let submitter = submitter(&dir, user());
        submitter.on_network_change(NetworkState::WIFI);
        submitter.disable();
        assert!(!submitter.with_uploader(|u| u.running));
        assert_eq!(submitter.start(), StartOutcome::Disabled);

        submitter.on_status(ServerStatus::Connected);
        assert_eq!(submitter.status(), ServerStatus::Disabled);
        submitter.on_status(ServerStatus::Unauthorized);
        assert_eq!(submitter.status(), ServerStatus::Unauthorized);
    }

    #[test]
    fn metered_network_limits_to_high_priority_topics() {
        let dir = TempDir::new().expect("temp dir");
        let config = SubmitterConfig {
            wifi_only: true,
            send_high_priority_over_data: true,
            high_priority_topics: ["alerts".to_string()].into(),
            ..user()
        };
        let submitter = submitter(&dir, config);
        submitter.on_network_change(NetworkState::MOBILE);
        assert_eq!(submitter.status(), ServerStatus::Connecting);
        assert_eq!(submitter.with_uploader(|u| u.topics.clone()), vec!["alerts"]);
    }

    #[test]
    fn wifi_only_blocks_metered_network() {
        let dir = TempDir::new().expect("temp dir");
        let config = SubmitterConfig {
            wifi_only: true,
            ..user()
        };
        let submitter = submitter(&dir, config);
        submitter.on_network_change(NetworkState::MOBILE);
        assert_eq!(submitter.status(), ServerStatus::Ready);
        assert_eq!(submitter.start(), StartOutcome::NetworkUnavailable);
    }

    #[test]
    fn upload_callbacks_update_stats() {
        let dir = TempDir::new().expect("temp dir");
        let submitter = submitter(&dir, user());
        submitter.on_records_sent("steps", 20);
        submitter.on_records_sent("steps", 5);
        submitter.on_upload_failure("steps", "timeout");
        let stats = submitter.stats();
        assert_eq!(stats["steps"].records_sent, 25);
        assert_eq!(stats["steps"].failures, 1);
        assert_eq!(stats["steps"].last_failure.as_deref(), Some("timeout"));
    }
}
