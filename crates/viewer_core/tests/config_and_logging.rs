use futures::executor::block_on;
use serde_json::{json, Value};
use viewer_core::{
    logging_status, AppConfig, Application, BootConfig, BootIssue, CommandDefinition,
    ConfigError, ExtensionDescriptor, LoggingError, ModeDescriptor, VersionPolicy,
};

fn platform_config() -> Value {
    json!({
        "routerBasename": "/",
        "showStudyList": true,
        "maxNumberOfWebWorkers": 2,
        "groupEnabledModesFirst": true,
        "defaultDataSourceName": "dicomweb",
        "dataSources": [{
            "friendlyName": "Local archive",
            "namespace": "@viewer/extension-default.dataSourcesModule.dicomweb",
            "sourceName": "dicomweb",
            "configuration": { "qidoRoot": "http://localhost:3001/dicomweb" }
        }],
        "hotkeys": [
            { "commandName": "showHelp", "keys": ["shift+/"], "label": "Help" },
            { "commandName": "nextImage", "keys": ["down", "j"], "context": "viewer" }
        ],
        "customizationService": { "studyList.title": "Research archive" },
        "extensionConfig": { "@viewer/extension-default": { "pageSize": 25 } },
        "maxNumRequests": { "interaction": 50 }
    })
}

#[test]
fn boot_seeds_hotkeys_customizations_and_data_source_configs() {
    let config = AppConfig::from_json_str(&platform_config().to_string()).unwrap();
    assert_eq!(config.max_concurrent_workers, 2);
    assert_eq!(config.max_num_requests.interaction, 50);
    assert_eq!(config.max_num_requests.prefetch, 25);

    let app = Application::boot(BootConfig::new(config)).unwrap();

    assert_eq!(app.hotkeys().len(), 3);
    assert_eq!(app.hotkeys().resolve("DEFAULT", "shift+/"), Some("showHelp"));
    assert_eq!(app.hotkeys().resolve("viewer", "j"), Some("nextImage"));
    let help = app
        .hotkeys()
        .bindings()
        .into_iter()
        .find(|listing| listing.command_name == "showHelp")
        .unwrap();
    assert_eq!(help.label.as_deref(), Some("Help"));

    assert_eq!(
        app.customizations().get("studyList.title"),
        Some(&json!("Research archive"))
    );
    assert_eq!(
        app.data_sources()
            .configs_for("@viewer/extension-default.dataSourcesModule.dicomweb")
            .len(),
        1
    );
    assert!(app.data_sources().is_empty());
}

#[test]
fn factories_see_their_extension_config() {
    let config = AppConfig::from_json_str(&platform_config().to_string()).unwrap();
    let default_ext = ExtensionDescriptor::new("@viewer/extension-default", "3.1.0")
        .with_commands_fn(|ctx| {
            let page_size = ctx
                .extension_config()
                .and_then(|value| value["pageSize"].as_u64())
                .unwrap_or(10);
            Ok(vec![CommandDefinition::new("pageSize", move |_| {
                Ok(json!(page_size))
            })])
        });
    let mut app = Application::boot(
        BootConfig::new(config)
            .with_extension(default_ext)
            .with_mode(
                ModeDescriptor::new("viewer", "viewer")
                    .with_extension("@viewer/extension-default"),
            ),
    )
    .unwrap();

    block_on(app.activate_mode("viewer")).unwrap();
    assert_eq!(
        app.run_command("pageSize", &Value::Null, None).unwrap(),
        json!(25)
    );
}

#[test]
fn enabled_modes_are_grouped_first_when_configured() {
    let config = AppConfig {
        group_enabled_modes_first: true,
        ..AppConfig::default()
    };
    let app = Application::boot(
        BootConfig::new(config)
            .with_extension(ExtensionDescriptor::new("core", "1.0.0"))
            .with_mode(ModeDescriptor::new("microscopy", "microscopy").with_extension("slides"))
            .with_mode(ModeDescriptor::new("viewer", "viewer").with_extension("core")),
    )
    .unwrap();

    let listed: Vec<(&str, bool)> = app
        .available_modes()
        .iter()
        .map(|listing| (listing.mode.id.as_str(), listing.enabled))
        .collect();
    assert_eq!(listed, vec![("viewer", true), ("microscopy", false)]);
}

#[test]
fn invalid_config_is_reported_at_boot() {
    let raw = json!({
        "routerBasename": "viewer",
        "versionPolicy": "fail"
    })
    .to_string();
    let config = AppConfig::from_json_str(&raw).unwrap();
    assert_eq!(config.version_policy, VersionPolicy::Fail);

    let err = Application::boot(BootConfig::new(config)).unwrap_err();
    assert!(matches!(
        err.issues.as_slice(),
        [BootIssue::Config(ConfigError::InvalidRouterBasename(_))]
    ));
    assert!(err.to_string().contains("routerBasename"));
}

#[test]
fn unknown_version_policy_is_a_parse_error() {
    let raw = json!({ "versionPolicy": "sometimes" }).to_string();
    assert!(matches!(
        AppConfig::from_json_str(&raw),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn boot_starts_file_logging_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let dir_str = dir.path().to_str().unwrap().to_string();
    let raw = json!({ "logging": { "level": "debug", "dir": dir_str } }).to_string();
    let config = AppConfig::from_json_str(&raw).unwrap();

    let first = Application::boot(BootConfig::new(config.clone())).unwrap();
    let second = Application::boot(BootConfig::new(config)).unwrap();
    assert_ne!(first.runtime().instance_id(), second.runtime().instance_id());

    let status = logging_status().unwrap();
    assert_eq!(status.level, log::LevelFilter::Debug);
    assert_eq!(status.dir, dir.path());

    let conflicting = json!({ "logging": { "level": "info", "dir": dir_str } }).to_string();
    let err = Application::boot(BootConfig::new(
        AppConfig::from_json_str(&conflicting).unwrap(),
    ))
    .unwrap_err();
    assert!(matches!(
        err.issues.as_slice(),
        [BootIssue::Logging(LoggingError::Conflict { .. })]
    ));
}
