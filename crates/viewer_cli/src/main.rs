//! CLI smoke entry point.
//!
//! # Responsibility
//! - Boot a demo application from an optional JSON config path.
//! - Activate a mode, dispatch a command and a key press, then shut down.
//! - Keep output deterministic for quick local sanity checks.

use futures::executor::block_on;
use futures::stream::{self, StreamExt};
use log::info;
use serde_json::{json, Value};
use std::process::ExitCode;
use std::rc::Rc;
use viewer_core::{
    AppConfig, Application, BootConfig, BoxError, CommandDefinition, DataSourceAdapter,
    DataSourceConfig, DataSourceDefinition, DataStream, ExtensionDescriptor, HotkeyBinding,
    ModeDescriptor, ServiceRegistration,
};

const DEFAULT_EXTENSION: &str = "@viewer/extension-default";
const DEMO_NAMESPACE: &str = "@viewer/extension-default.dataSourcesModule.static";

/// In-memory study list used by the demo data source.
struct StaticArchive {
    studies: Vec<Value>,
}

impl DataSourceAdapter for StaticArchive {
    fn query(&self, _params: Value) -> DataStream<'_> {
        stream::iter(self.studies.iter().cloned().map(Ok)).boxed_local()
    }

    fn retrieve(&self, params: Value) -> DataStream<'_> {
        let wanted = params["studyInstanceUid"].clone();
        stream::iter(
            self.studies
                .iter()
                .filter(move |study| study["studyInstanceUid"] == wanted)
                .cloned()
                .map(Ok),
        )
        .boxed_local()
    }

    fn store(&self, _payload: Value) -> DataStream<'_> {
        stream::empty().boxed_local()
    }
}

fn default_extension() -> ExtensionDescriptor {
    ExtensionDescriptor::new(DEFAULT_EXTENSION, env!("CARGO_PKG_VERSION"))
        .with_services_fn(|_| Ok(vec![ServiceRegistration::new("viewportGrid", 1_u32)]))
        .with_commands_fn(|_| {
            Ok(vec![
                CommandDefinition::new("ping", |_| Ok(json!("pong"))).with_label("Ping"),
                CommandDefinition::new("nextViewport", |call| Ok(json!({ "context": call.context })))
                    .in_context("viewer"),
            ])
        })
        .with_hotkeys_fn(|_| {
            Ok(vec![HotkeyBinding::new("nextViewport", &["right"]).in_context("viewer")])
        })
        .with_data_sources_fn(|_| {
            Ok(vec![DataSourceDefinition::new("static", |config| {
                let studies = config.configuration["studies"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                let adapter: Rc<dyn DataSourceAdapter> = Rc::new(StaticArchive { studies });
                Ok(adapter)
            })])
        })
}

fn demo_config(path: Option<&str>) -> Result<AppConfig, BoxError> {
    let mut config = match path {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::default(),
    };
    if config.data_sources.is_empty() {
        config.data_sources.push(
            DataSourceConfig::new(DEMO_NAMESPACE, "static").with_configuration(json!({
                "studies": [
                    { "studyInstanceUid": "1.2.3", "patientName": "Anonymous" }
                ]
            })),
        );
        config.default_data_source_name = Some("static".to_string());
    }
    Ok(config)
}

fn run(path: Option<&str>) -> Result<(), BoxError> {
    let config = demo_config(path)?;
    let boot = BootConfig::new(config)
        .with_extension(default_extension())
        .with_mode(
            ModeDescriptor::new("viewer", "viewer")
                .with_display_name("Basic Viewer")
                .with_extension(DEFAULT_EXTENSION),
        )
        .with_error_handler(|err| eprintln!("viewer error: {err}"));
    let mut app = Application::boot(boot)?;

    {
        let mut handle = block_on(app.activate_mode("viewer"))?;
        println!("viewer_core mode={}", handle.mode_id());
        println!("viewer_core ping={}", handle.run("ping", &Value::Null)?);
        handle.push_context("viewer");
        let pressed = handle.press("Right")?.unwrap_or(Value::Null);
        println!("viewer_core hotkey right={pressed}");
    }

    let adapter = app.data_sources().active()?;
    let studies: Vec<Value> = block_on(adapter.query(Value::Null).collect::<Vec<_>>())
        .into_iter()
        .collect::<Result<_, _>>()?;
    println!("viewer_core studies={}", studies.len());
    info!(
        "event=cli_demo module=cli status=ok studies={}",
        studies.len()
    );

    app.shutdown()?;
    Ok(())
}

fn main() -> ExitCode {
    println!("viewer_core version={}", viewer_core::core_version());
    let path = std::env::args().nth(1);
    match run(path.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("viewer_cli failed: {err}");
            ExitCode::FAILURE
        }
    }
}
