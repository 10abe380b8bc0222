use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.build.chunk_size = Some(1024);
    raw.logging.level = Some("info".to_string());

    raw.apply_logging_overrides(&LoggingOverrides {
        log_level: Some("debug".to_string()),
        ..Default::default()
    });
    raw.apply_build_overrides(&BuildOverrides {
        chunk_size: Some(4096),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.build.chunk_size.get(), 4096);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.build.payload_dir, PathBuf::from(DEFAULT_PAYLOAD_DIR));
    assert_eq!(
        settings.build.output,
        OutputTarget::Directory(PathBuf::from(DEFAULT_OUT_DIR))
    );
    assert_eq!(settings.build.base_path, "/");
    assert!(settings.build.max_concurrency.is_none());
    assert_eq!(settings.worker.host_condition, Condition::ReactServer);
    assert_eq!(settings.worker.handshake_timeout, Duration::from_secs(10));
    assert_eq!(settings.worker.shutdown_grace, Duration::from_secs(5));
    assert!(!settings.worker.in_process);
    assert_eq!(settings.logging.format, LogFormat::Compact);
}

#[test]
fn inline_output_wins_over_out_dir() {
    let mut raw = RawSettings::default();
    raw.build.out_dir = Some(PathBuf::from("public"));
    raw.apply_build_overrides(&BuildOverrides {
        inline: Some(true),
        ..Default::default()
    });

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.build.output, OutputTarget::Inline);
}

#[test]
fn zero_values_are_rejected_by_key() {
    let mut raw = RawSettings::default();
    raw.build.max_concurrency = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "build.max_concurrency", .. }));

    let mut raw = RawSettings::default();
    raw.worker.handshake_timeout_ms = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "worker.handshake_timeout_ms", .. }));
}

#[test]
fn chunk_size_is_capped() {
    let mut raw = RawSettings::default();
    raw.build.chunk_size = Some(64 * 1024 * 1024);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "build.chunk_size", .. }));
}

#[test]
fn worker_mode_and_condition_are_parsed() {
    let mut raw = RawSettings::default();
    raw.worker.mode = Some("development".to_string());
    raw.worker.host_condition = Some("default".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.worker.mode, ExecutionMode::Development);
    assert_eq!(settings.worker.host_condition, Condition::Default);

    let mut raw = RawSettings::default();
    raw.worker.host_condition = Some("browser".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "worker.host_condition", .. }));
}

#[test]
fn default_to_no_command() {
    let args = CliArgs::parse_from(["prerender"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_build_arguments() {
    let args = CliArgs::parse_from([
        "prerender",
        "build",
        "--route",
        "/",
        "--route",
        "/about",
        "--out-dir",
        "public",
        "--write-payload",
        "--max-concurrency",
        "8",
        "--log-json",
        "true",
    ]);

    assert_eq!(args.logging.log_json, Some(true));
    match args.command.expect("build command") {
        Command::Build(build) => {
            assert_eq!(build.routes, vec!["/", "/about"]);
            assert_eq!(build.overrides.out_dir, Some(PathBuf::from("public")));
            assert_eq!(build.overrides.write_payload, Some(true));
            assert_eq!(build.overrides.max_concurrency, Some(8));
            assert_eq!(build.overrides.inline, None);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_hidden_worker_command() {
    let args = CliArgs::parse_from(["prerender", "worker"]);
    assert!(matches!(args.command, Some(Command::Worker)));
}
