use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.backend.kind = Some(BackendKind::Rest);
    raw.backend.url = Some("https://file.example".to_string());
    raw.backend.api_key = Some("anon".to_string());

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        backend: Some(BackendKind::Memory),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.backend.kind, BackendKind::Memory);
}

#[test]
fn defaults_follow_entity_volatility() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let cache = &settings.cache;

    assert!(cache.enabled);
    assert_eq!(cache.max_entries.get(), DEFAULT_MAX_ENTRIES);
    assert_eq!(cache.services_ttl, Duration::from_secs(300));
    assert!(cache.orders_ttl < cache.products_ttl);
    assert!(cache.products_ttl < cache.services_ttl);
    assert_eq!(cache.fresh_read, Duration::from_secs(10));
    assert_eq!(settings.backend.kind, BackendKind::Memory);
    assert_eq!(settings.backend.timeout, Duration::from_secs(15));
}

#[test]
fn no_cache_flag_disables_reads() {
    let mut raw = RawSettings::default();
    raw.apply_overrides(&GlobalOverrides {
        no_cache: true,
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(!settings.cache.enabled);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn rest_backend_requires_url_and_key() {
    let mut raw = RawSettings::default();
    raw.backend.kind = Some(BackendKind::Rest);
    let err = Settings::from_raw(raw.clone()).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "backend.url", .. }));

    raw.backend.url = Some("https://demo.supabase.co".to_string());
    let err = Settings::from_raw(raw.clone()).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "backend.api_key", .. }));

    raw.backend.api_key = Some("  ".to_string());
    assert!(Settings::from_raw(raw.clone()).is_err());

    raw.backend.api_key = Some("anon".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.backend.url.as_deref(), Some("https://demo.supabase.co"));
}

#[test]
fn zero_durations_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.orders_ttl_ms = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "cache.orders_ttl_ms", .. }));

    let mut raw = RawSettings::default();
    raw.cache.max_entries = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn oversized_durations_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.customers_ttl_ms = Some(u64::MAX);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "cache.customers_ttl_ms", .. }));

    let mut raw = RawSettings::default();
    raw.cache.reconnect_interval_ms = Some(MAX_DURATION_MS + 1);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.services_ttl_ms = Some(MAX_DURATION_MS);
    let settings = Settings::from_raw(raw).expect("upper bound is inclusive");
    assert_eq!(settings.cache.services_ttl, Duration::from_millis(MAX_DURATION_MS));
}

#[test]
fn invalid_log_level_is_reported() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn cache_settings_convert_to_cache_config() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let config = crate::cache::CacheConfig::from(&settings.cache);
    assert_eq!(config.orders_ttl_ms, DEFAULT_ORDERS_TTL_MS);
    assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
    assert_eq!(config.reconnect_interval_ms, DEFAULT_RECONNECT_INTERVAL_MS);
}

#[test]
fn parse_list_arguments() {
    let owner = Uuid::from_u128(7);
    let args = CliArgs::parse_from([
        "kasirpro",
        "list",
        "orders",
        "--owner",
        &owner.to_string(),
        "--business-type",
        "laundry",
        "--force",
    ]);

    match args.command.expect("list command") {
        Command::List(list) => {
            assert_eq!(list.entity, EntityType::Orders);
            assert_eq!(list.scope.owner, owner);
            assert_eq!(list.scope.business_type, Some(BusinessType::Laundry));
            assert!(list.force);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_history_arguments_with_global_flags() {
    let owner = Uuid::from_u128(8);
    let args = CliArgs::parse_from([
        "kasirpro",
        "history",
        "--owner",
        &owner.to_string(),
        "--page",
        "3",
        "--status",
        "completed",
        "--search",
        "sari",
        "--log-level",
        "warn",
    ]);

    assert_eq!(args.overrides.log_level.as_deref(), Some("warn"));
    match args.command.expect("history command") {
        Command::History(history) => {
            assert_eq!(history.page, 3);
            assert_eq!(history.page_size, 20);
            assert_eq!(history.status, Some(OrderStatus::Completed));
            assert_eq!(history.search.as_deref(), Some("sari"));
            assert_eq!(history.scope.business_type, None);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_demo_defaults() {
    let args = CliArgs::parse_from(["kasirpro", "demo"]);
    match args.command.expect("demo command") {
        Command::Demo(demo) => {
            assert_eq!(demo.orders, 3);
            assert_eq!(demo.daily_limit, None);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
#[serial_test::serial]
fn environment_sits_between_files_and_flags() {
    // SAFETY: serialised with every other test touching the environment.
    unsafe {
        std::env::set_var("KASIRPRO__CACHE__ORDERS_TTL_MS", "1234");
        std::env::set_var("KASIRPRO__LOGGING__LEVEL", "error");
    }
    let cli = CliArgs::parse_from(["kasirpro", "--log-level", "warn"]);
    let result = load(&cli);
    unsafe {
        std::env::remove_var("KASIRPRO__CACHE__ORDERS_TTL_MS");
        std::env::remove_var("KASIRPRO__LOGGING__LEVEL");
    }

    let settings = result.expect("environment settings load");
    assert_eq!(settings.cache.orders_ttl, Duration::from_millis(1234));
    assert_eq!(settings.logging.level, LevelFilter::WARN);
}
