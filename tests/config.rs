use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use rodent_sentry::config::{SentryConfig, SourceKind};
use rodent_sentry::detect::{Activation, ClassLabel, NmsPolicy, TensorLayout};
use rodent_sentry::ingest::SamplingPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RODENT_CONFIG",
        "RODENT_RTSP_URL",
        "RODENT_DB_PATH",
        "RODENT_IMAGES_PATH",
        "RODENT_COOLDOWN_MINUTES",
        "RODENT_RETENTION_DAYS",
        "RODENT_CONFIDENCE_THRESHOLD",
        "RODENT_CHANNELS",
        "RODENT_TEST_TWILIO_TOKEN",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SentryConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.source, SourceKind::Rtsp);
    assert_eq!(cfg.camera.url, "stub://backyard");
    assert_eq!(cfg.detection.confidence_threshold, 0.25);
    assert_eq!(cfg.detection.nms_iou_threshold, 0.45);
    assert_eq!(
        cfg.detection.classes,
        vec![ClassLabel::NorwayRat, ClassLabel::RoofRat]
    );
    assert_eq!(cfg.detection.layout, TensorLayout::ChannelsFirst);
    assert_eq!(cfg.detection.nms_policy, NmsPolicy::ClassAware);
    assert_eq!(cfg.alerts.cooldown_minutes, 10.0);
    assert_eq!(cfg.alerts.cooldown_window(), Duration::from_secs(600));
    assert_eq!(cfg.alerts.enabled_channels, vec!["sms".to_string()]);
    assert_eq!(cfg.storage.database_path, PathBuf::from("data/detections.db"));
    assert_eq!(cfg.storage.retention_days, 30);
    assert_eq!(
        cfg.video.sampling_policy(),
        SamplingPolicy::Interval(Duration::from_secs(1))
    );
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".json",
        r#"{
            "camera": { "source": "rtsp", "url": "rtsp://cam.local/stream1" },
            "video": { "frame_skip": 5, "channel_order": "bgr" },
            "detection": {
                "confidence_threshold": 0.4,
                "classes": ["norway_rat", "roof_rat", "mouse"],
                "class_thresholds": { "roof_rat": 0.6 },
                "activation": "sigmoid",
                "layout": "anchors_first",
                "nms_policy": "class_agnostic"
            },
            "alerts": { "cooldown_minutes": 5, "enabled_channels": ["SMS", "push", "sms"] },
            "notifications": {
                "sms": {
                    "account_sid": "AC1",
                    "auth_token": "${RODENT_TEST_TWILIO_TOKEN}",
                    "from_number": "+15550000000",
                    "to_numbers": ["+15551112222"]
                },
                "push": { "api_token": "app", "user_key": "user" }
            },
            "storage": { "retention_days": 14 }
        }"#,
    );

    std::env::set_var("RODENT_CONFIG", file.path());
    std::env::set_var("RODENT_TEST_TWILIO_TOKEN", "secret-token");
    std::env::set_var("RODENT_COOLDOWN_MINUTES", "2.5");
    std::env::set_var("RODENT_DB_PATH", "/var/lib/rodent/detections.db");

    let cfg = SentryConfig::load().expect("load config");

    assert_eq!(cfg.camera.url, "rtsp://cam.local/stream1");
    assert_eq!(cfg.video.sampling_policy(), SamplingPolicy::EveryNth(5));
    assert_eq!(cfg.detection.confidence_threshold, 0.4);
    assert_eq!(cfg.detection.classes.len(), 3);
    assert_eq!(cfg.detection.class_thresholds[&ClassLabel::RoofRat], 0.6);
    assert_eq!(cfg.detection.activation, Activation::Sigmoid);
    assert_eq!(cfg.detection.layout, TensorLayout::AnchorsFirst);
    assert_eq!(cfg.detection.nms_policy, NmsPolicy::ClassAgnostic);
    assert_eq!(cfg.alerts.cooldown_minutes, 2.5);
    assert_eq!(
        cfg.alerts.enabled_channels,
        vec!["sms".to_string(), "push".to_string()]
    );
    let sms = cfg.notifications.sms.as_ref().expect("sms section");
    assert_eq!(sms.auth_token, "secret-token");
    assert_eq!(sms.api_base, "https://api.twilio.com");
    let push = cfg.notifications.push.as_ref().expect("push section");
    assert_eq!(push.priority, 1);
    assert_eq!(
        cfg.storage.database_path,
        PathBuf::from("/var/lib/rodent/detections.db")
    );
    assert_eq!(cfg.storage.retention_days, 14);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".toml",
        r#"
        [camera]
        source = "directory"
        path = "/mnt/sdcard/record"
        poll_interval_secs = 30

        [detection]
        confidence_threshold = 0.3

        [alerts]
        cooldown_minutes = 0
        enabled_channels = []

        [system]
        reconnect_initial_ms = 5000
        reconnect_max_ms = 1000
        "#,
    );
    std::env::set_var("RODENT_CHANNELS", "");

    let cfg = SentryConfig::load_from(file.path()).expect("load toml");
    assert_eq!(cfg.camera.source, SourceKind::Directory);
    assert_eq!(cfg.camera.path, Some(PathBuf::from("/mnt/sdcard/record")));
    assert_eq!(cfg.camera.poll_interval_secs, 30);
    assert_eq!(cfg.detection.confidence_threshold, 0.3);
    assert_eq!(cfg.alerts.cooldown_window(), Duration::ZERO);
    assert!(cfg.alerts.enabled_channels.is_empty());
    // reconnect_max is raised to at least reconnect_initial.
    assert_eq!(cfg.system.reconnect_max, Duration::from_millis(5000));

    clear_env();
}

#[test]
fn rejects_invalid_configs() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        r#"{ "detection": { "confidence_threshold": 1.5 } }"#,
        r#"{ "detection": { "confidence_threshold": 0 } }"#,
        r#"{ "detection": { "classes": [] } }"#,
        r#"{ "detection": { "classes": ["squirrel"] } }"#,
        r#"{ "alerts": { "enabled_channels": ["pager"] } }"#,
        r#"{ "storage": { "retention_days": 0 } }"#,
        r#"{ "video": { "input_width": 0 } }"#,
        r#"{ "video": { "sample_interval_secs": 1e300 } }"#,
        r#"{ "alerts": { "cooldown_minutes": 1e300 } }"#,
        r#"{ "alerts": { "cooldown_minutes": -5 } }"#,
        r#"{ "camera": { "source": "file" } }"#,
        r#"{ "unknown_section": {} }"#,
    ];
    for json in cases {
        let file = write_temp(".json", json);
        assert!(
            SentryConfig::load_from(file.path()).is_err(),
            "expected rejection for {}",
            json
        );
    }

    std::env::set_var("RODENT_RETENTION_DAYS", "soon");
    assert!(SentryConfig::load().is_err());
    clear_env();
}

#[test]
fn unset_placeholder_is_left_in_place() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".json",
        r#"{
            "alerts": { "enabled_channels": ["sms"] },
            "notifications": { "sms": {
                "account_sid": "AC1",
                "auth_token": "${RODENT_TEST_TWILIO_TOKEN}",
                "from_number": "+15550000000",
                "to_numbers": ["+15551112222"]
            } }
        }"#,
    );
    let cfg = SentryConfig::load_from(file.path()).expect("load config");
    let sms = cfg.notifications.sms.as_ref().expect("sms section");
    assert_eq!(sms.auth_token, "${RODENT_TEST_TWILIO_TOKEN}");

    // The literal placeholder fails channel construction.
    let err = rodent_sentry::NotificationDispatcher::from_config(&cfg.alerts, &cfg.notifications);
    assert!(err.is_err());
}
