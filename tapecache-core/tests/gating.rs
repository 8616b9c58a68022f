use std::sync::{Arc, Mutex};
use std::time::Duration;

use tapecache_core::{
    BatteryStage, CacheConfiguration, CacheGroup, CacheRegistry, Datum, NetworkState, Schema,
    ServerStatus, StartOutcome, Submitter, SubmitterConfig, TopicSchema, Uploader,
};

#[derive(Debug, Default)]
struct Calls {
    started: Vec<Duration>,
    stopped: usize,
    periods: Vec<Duration>,
    topics: Vec<String>,
}

/// Uploader that only records what it was asked to do.
#[derive(Clone, Default)]
struct FakeUploader(Arc<Mutex<Calls>>);

impl FakeUploader {
    fn calls<R>(&self, f: impl FnOnce(&Calls) -> R) -> R {
        let calls = self.0.lock().expect("calls");
        f(&*calls)
    }
}

impl Uploader for FakeUploader {
    fn start(&mut self, caches: Vec<Arc<CacheGroup>>, period: Duration) {
        let mut calls = self.0.lock().expect("calls");
        calls.started.push(period);
        calls.topics = caches.iter().map(|g| g.topic().to_string()).collect();
    }

    fn update_period(&mut self, period: Duration) {
        self.0.lock().expect("calls").periods.push(period);
    }

    fn stop(&mut self) {
        self.0.lock().expect("calls").stopped += 1;
    }
}

type Fixture = (tempfile::TempDir, Submitter<FakeUploader>, FakeUploader);

fn setup(config: SubmitterConfig) -> Fixture {
    let dir = tempfile::tempdir().expect("tmp");
    let registry = Arc::new(
        CacheRegistry::new(
            dir.path(),
            CacheConfiguration {
                commit_rate: Duration::from_secs(3600),
                maximum_size: 1 << 20,
            },
        )
        .expect("registry"),
    );
    for topic in ["questionnaire", "acceleration"] {
        registry
            .register(TopicSchema::new(topic, Schema::String, Schema::Double))
            .expect("register");
    }
    let uploader = FakeUploader::default();
    let submitter = Submitter::new(registry, config, uploader.clone());
    (dir, submitter, uploader)
}

fn with_user() -> SubmitterConfig {
    SubmitterConfig {
        user_id: Some("participant-3".into()),
        upload_period: Duration::from_secs(10),
        reduced_rate_multiplier: 5,
        ..SubmitterConfig::default()
    }
}

#[test]
fn empty_battery_blocks_connecting() {
    let (_dir, submitter, uploader) = setup(with_user());
    submitter.on_battery_stage(BatteryStage::Empty);
    submitter.on_network_change(NetworkState::WIFI);
    assert_eq!(submitter.status(), ServerStatus::Ready);
    assert_eq!(submitter.start(), StartOutcome::BatteryEmpty);
    assert!(uploader.calls(|c| c.started.is_empty()));

    submitter.on_battery_stage(BatteryStage::Full);
    assert_eq!(submitter.status(), ServerStatus::Connecting);
    assert_eq!(submitter.start(), StartOutcome::AlreadyRunning);
}

#[test]
fn recharged_battery_resumes_upload() {
    let (_dir, submitter, uploader) = setup(with_user());
    submitter.on_network_change(NetworkState::WIFI);
    assert_eq!(uploader.calls(|c| c.started.len()), 1);

    submitter.on_battery_stage(BatteryStage::Empty);
    assert_eq!(submitter.status(), ServerStatus::Ready);
    assert_eq!(uploader.calls(|c| c.stopped), 1);

    submitter.on_battery_stage(BatteryStage::Full);
    assert_eq!(submitter.status(), ServerStatus::Connecting);
    assert_eq!(uploader.calls(|c| c.started.len()), 2);
}

#[test]
fn recharging_does_not_start_a_disabled_submitter() {
    let (_dir, submitter, uploader) = setup(with_user());
    submitter.on_network_change(NetworkState::WIFI);
    submitter.on_battery_stage(BatteryStage::Empty);
    submitter.disable();
    submitter.on_battery_stage(BatteryStage::Reduced);
    assert_eq!(submitter.status(), ServerStatus::Disabled);
    assert_eq!(uploader.calls(|c| c.started.len()), 1);
}

#[test]
fn battery_running_out_stops_upload() {
    let (_dir, submitter, uploader) = setup(with_user());
    submitter.on_network_change(NetworkState::WIFI);
    submitter.on_status(ServerStatus::Connected);
    submitter.on_battery_stage(BatteryStage::Empty);
    assert_eq!(submitter.status(), ServerStatus::Ready);
    assert_eq!(uploader.calls(|c| c.stopped), 1);
}

#[test]
fn network_loss_stops_and_blocks_until_reconnect() {
    let (_dir, submitter, uploader) = setup(with_user());
    submitter.on_network_change(NetworkState::WIFI);
    submitter.on_status(ServerStatus::Connected);

    submitter.on_network_change(NetworkState::DISCONNECTED);
    assert_eq!(submitter.status(), ServerStatus::Ready);
    assert_eq!(uploader.calls(|c| c.stopped), 1);
    assert_eq!(submitter.start(), StartOutcome::NetworkUnavailable);

    submitter.on_network_change(NetworkState::WIFI);
    assert_eq!(submitter.status(), ServerStatus::Connecting);
    assert_eq!(uploader.calls(|c| c.started.len()), 2);
}

#[test]
fn reduced_battery_starts_with_slower_period() {
    let (_dir, submitter, uploader) = setup(with_user());
    submitter.on_battery_stage(BatteryStage::Reduced);
    submitter.on_network_change(NetworkState::WIFI);
    assert_eq!(
        uploader.calls(|c| c.started.clone()),
        vec![Duration::from_secs(50)]
    );
    submitter.on_battery_stage(BatteryStage::Full);
    assert_eq!(
        uploader.calls(|c| c.periods.clone()),
        vec![Duration::from_secs(10)]
    );
}

#[test]
fn high_priority_topics_go_over_mobile_data() {
    let config = SubmitterConfig {
        wifi_only: true,
        send_high_priority_over_data: true,
        high_priority_topics: ["questionnaire".to_string()].into(),
        ..with_user()
    };
    let (_dir, submitter, uploader) = setup(config);
    submitter.on_network_change(NetworkState::MOBILE);
    assert_eq!(submitter.status(), ServerStatus::Connecting);
    assert_eq!(uploader.calls(|c| c.topics.clone()), vec!["questionnaire"]);

    submitter.stop();
    submitter.on_network_change(NetworkState::WIFI);
    assert_eq!(
        uploader.calls(|c| c.topics.clone()),
        vec!["acceleration", "questionnaire"]
    );
}

#[test]
fn maintenance_flushes_pending_records() {
    let (_dir, submitter, _uploader) = setup(with_user());
    let group = submitter
        .active_caches()
        .into_iter()
        .find(|g| g.topic() == "acceleration")
        .expect("group");
    group
        .active_cache()
        .add_measurement(Datum::String("phone".into()), Datum::Double(0.25))
        .expect("add");
    assert_eq!(submitter.maintain().expect("maintain"), 0);
    assert_eq!(group.total_records().expect("total"), 1);
}
