use std::io::Write;

use serial_test::serial;

use super::*;

/// Restores an environment variable when dropped.
struct EnvVarGuard {
    key: &'static str,
    original: Option<String>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &str) -> Self {
        let original = std::env::var(key).ok();
        // SAFETY: callers are `#[serial]`, so no other test thread reads the environment.
        unsafe { std::env::set_var(key, value) };
        Self { key, original }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // SAFETY: see `EnvVarGuard::set`.
        unsafe {
            match self.original.as_deref() {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_match_cache_config() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let cache = settings.cache_config();
    let defaults = CacheConfig::default();

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(cache.enabled, defaults.enabled);
    assert_eq!(cache.result_namespace, defaults.result_namespace);
    assert_eq!(cache.salt_namespace, defaults.salt_namespace);
    assert_eq!(cache.store_capacity, defaults.store_capacity);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.cache.enabled = Some(true);

    let overrides = Overrides {
        log_level: Some("debug".to_string()),
        cache_enabled: Some(false),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.cache.enabled);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn zero_store_capacity_is_clamped() {
    let mut raw = RawSettings::default();
    raw.cache.store_capacity = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.store_capacity.get(), 1);
}

#[test]
fn blank_or_shared_namespaces_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.result_namespace = Some("   ".to_string());
    let err = Settings::from_raw(raw).expect_err("blank namespace");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.result_namespace",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.cache.result_namespace = Some("shared".to_string());
    raw.cache.salt_namespace = Some("shared".to_string());
    let err = Settings::from_raw(raw).expect_err("shared namespace");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.salt_namespace",
            ..
        }
    ));
}

#[test]
fn empty_placeholder_markers_are_dropped() {
    let mut raw = RawSettings::default();
    raw.cache.placeholder_markers = Some(vec![String::new(), "{ESC}".to_string()]);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.placeholder_markers, vec!["{ESC}".to_string()]);
}

#[test]
#[serial]
fn config_file_is_layered_under_cli() {
    let file = config_file(
        r#"
[logging]
level = "warn"

[cache]
result_namespace = "tmp_results"
placeholder_markers = ["{abc}"]
store_capacity = 64
"#,
    );

    let args = CliArgs::parse_from([
        "postcache",
        "--config-file",
        file.path().to_str().expect("utf-8 path"),
        "--cache-store-capacity",
        "128",
        "fingerprint",
        "SELECT 1",
    ]);
    let settings = load(&args).expect("settings");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.cache.result_namespace, "tmp_results");
    assert_eq!(settings.cache.placeholder_markers, vec!["{abc}".to_string()]);
    assert_eq!(settings.cache.store_capacity.get(), 128);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = config_file("[cache]\nenabled = true\n");
    let _enabled = EnvVarGuard::set("POSTCACHE__CACHE__ENABLED", "false");
    let _salts = EnvVarGuard::set("POSTCACHE__CACHE__SALT_NAMESPACE", "env_salts");

    let args = CliArgs::parse_from([
        "postcache",
        "--config-file",
        file.path().to_str().expect("utf-8 path"),
        "simulate",
    ]);
    let settings = load(&args).expect("settings");

    assert!(!settings.cache.enabled);
    assert_eq!(settings.cache.salt_namespace, "env_salts");
}

#[test]
#[serial]
fn missing_explicit_config_file_fails() {
    let args = CliArgs::parse_from([
        "postcache",
        "--config-file",
        "/nonexistent/postcache.toml",
        "simulate",
    ]);
    assert!(matches!(load(&args), Err(LoadError::Build(_))));
}

#[test]
fn parse_simulate_arguments() {
    let args = CliArgs::parse_from([
        "postcache",
        "simulate",
        "--items",
        "5",
        "--page-size",
        "3",
        "--log-level",
        "debug",
    ]);

    assert_eq!(args.overrides.log_level.as_deref(), Some("debug"));
    match args.command.expect("simulate command") {
        Command::Simulate(simulate) => {
            assert_eq!(simulate.items, 5);
            assert_eq!(simulate.page_size, 3);
            assert_eq!(simulate.tenant, 1);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_fingerprint_arguments() {
    let args = CliArgs::parse_from(["postcache", "fingerprint", "SELECT * FROM posts"]);

    match args.command.expect("fingerprint command") {
        Command::Fingerprint(fingerprint) => {
            assert_eq!(fingerprint.query, "SELECT * FROM posts");
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn default_to_simulate_command() {
    let args = CliArgs::parse_from(["postcache"]);
    let command = args
        .command
        .unwrap_or(Command::Simulate(SimulateArgs::default()));
    assert!(matches!(command, Command::Simulate(_)));
}
