use palclip_client::{
    FileSettingsStore, SettingsStorage,
    settings::{
        CONFIG_DIR_ENV, config_dir, load_settings_from_path, save_settings_to_path,
        save_settings_with_retry,
    },
};

#[test]
fn load_before_any_save_is_absent() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = FileSettingsStore::new(dir.path());

    assert_eq!(store.load().expect("load settings"), None);
}

#[test]
fn save_then_load_round_trips_text() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let mut store = FileSettingsStore::new(dir.path());

    store.save("foo: bar").expect("save settings");

    assert_eq!(
        store.load().expect("load settings").as_deref(),
        Some("foo: bar")
    );
}

#[test]
fn save_overwrites_whole_slot() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let mut store = FileSettingsStore::new(dir.path());

    store
        .save("hotkey: ctrl+shift+v\nhistory: 500\n")
        .expect("save first");
    store.save("").expect("save second");

    assert_eq!(store.load().expect("load settings").as_deref(), Some(""));
}

#[test]
fn save_creates_missing_directories_and_leaves_no_tmp() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("nested").join("palclip").join("settings.txt");

    save_settings_to_path(&path, "a: 1").expect("save settings");

    assert_eq!(
        load_settings_from_path(&path).expect("load").as_deref(),
        Some("a: 1")
    );
    assert!(!path.with_extension("txt.tmp").exists());
}

#[test]
fn retrying_save_reports_persistent_failure() {
    let dir = tempfile::tempdir().expect("create tempdir");
    // A directory where the slot file should be makes every rename fail.
    let path = dir.path().join("settings.txt");
    std::fs::create_dir_all(path.join("occupied")).expect("create blocking dir");

    let err = save_settings_with_retry(&path, "x").expect_err("save should fail");
    assert!(!err.to_string().is_empty());
}

#[test]
fn failed_save_keeps_previous_settings() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("settings.txt");
    save_settings_to_path(&path, "theme: dark").expect("first save");

    // Occupy the temp slot so the next save cannot complete.
    std::fs::create_dir_all(path.with_extension("txt.tmp")).expect("create blocking dir");
    assert!(save_settings_to_path(&path, "theme: light").is_err());

    assert_eq!(
        load_settings_from_path(&path).expect("load settings").as_deref(),
        Some("theme: dark")
    );
}

#[test]
fn config_dir_honours_env_override() {
    let dir = tempfile::tempdir().expect("create tempdir");

    // SAFETY: no other test in this binary reads or writes this variable.
    unsafe {
        std::env::set_var(CONFIG_DIR_ENV, dir.path());
    }
    let resolved = config_dir();
    unsafe {
        std::env::remove_var(CONFIG_DIR_ENV);
    }

    assert_eq!(resolved, dir.path());
}
