use std::sync::Mutex;

use tempfile::NamedTempFile;

use ppe_monitor::config::{ConfigStore, PpeConfig, SettingUpdate};
use ppe_monitor::SourceDescriptor;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PPE_CONFIG",
        "PPE_CAMERA_URL",
        "PPE_CAMERA_ID",
        "PPE_MODEL_PATH",
        "PPE_DB_PATH",
        "PPE_MIN_CONFIDENCE",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "paths": { "model": "stub://violation", "database": "site_a.db" },
            "camera": {
                "id": 1,
                "resolution": { "width": 800, "height": 600 },
                "default_settings": { "brightness": 120, "grayscale": true }
            },
            "detection": {
                "min_confidence": 0.4,
                "classes": {
                    "absent": ["sem oculos", "sem capacete", "sem luvas", "sem protetor"],
                    "present": ["oculos", "capacete", "luvas", "protetor"]
                }
            },
            "alerts": { "frequency": 1800, "duration": 500, "delay_time": 3 }
        }"#,
    );

    std::env::set_var("PPE_CONFIG", file.path());
    std::env::set_var("PPE_CAMERA_URL", "http://192.168.0.20:4747/video");
    std::env::set_var("PPE_MIN_CONFIDENCE", "0.65");

    let cfg = PpeConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.paths.model, "stub://violation");
    assert_eq!(cfg.paths.database, "site_a.db");
    assert_eq!(cfg.camera.resolution.width, 800);
    assert_eq!(cfg.camera.default_settings.brightness, 120);
    assert_eq!(cfg.camera.default_settings.contrast, 100);
    assert!(cfg.camera.default_settings.grayscale);
    assert_eq!(cfg.detection.min_confidence, 0.65);
    assert_eq!(cfg.alerts.delay_time, 3.0);
    assert_eq!(
        cfg.camera_source(),
        SourceDescriptor::Stream("http://192.168.0.20:4747/video".to_string())
    );
    let catalog = cfg.catalog().expect("catalog");
    assert_eq!(catalog.name(5), Some("sem capacete"));
}

#[test]
fn invalid_documents_and_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "camera": { "default_settings": { "contrast": 250 } } }"#);
    assert!(PpeConfig::load_from(Some(file.path())).is_err());

    let broken = write_config("{ not json");
    assert!(PpeConfig::load_from(Some(broken.path())).is_err());

    std::env::set_var("PPE_CAMERA_ID", "front");
    assert!(PpeConfig::load_from(None).is_err());
    clear_env();
}

#[test]
fn accepted_updates_are_persisted_and_reloaded() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{}");
    let cfg = PpeConfig::load_from(Some(file.path())).expect("load defaults");
    let store = ConfigStore::new(cfg, Some(file.path().to_path_buf()));

    store
        .apply(&SettingUpdate::parse("contrast", "135.9").expect("parse"))
        .expect("apply contrast");
    store
        .apply(&SettingUpdate::DelayTime(7.5))
        .expect("apply delay");
    store
        .apply(&SettingUpdate::CameraUrl(Some("rtsp://gate/1".into())))
        .expect("apply url");
    assert!(store.apply(&SettingUpdate::MinConfidence(1.5)).is_err());

    let reloaded = PpeConfig::load_from(Some(file.path())).expect("reload");
    assert_eq!(reloaded.camera.default_settings.contrast, 135);
    assert_eq!(reloaded.alerts.delay_time, 7.5);
    assert_eq!(reloaded.detection.min_confidence, 0.5);
    assert_eq!(
        reloaded.camera_source(),
        SourceDescriptor::Stream("rtsp://gate/1".to_string())
    );
    assert_eq!(*store.snapshot(), reloaded);
    assert_eq!(
        store.get("alerts.delay_time").expect("get"),
        serde_json::json!(7.5)
    );
}
