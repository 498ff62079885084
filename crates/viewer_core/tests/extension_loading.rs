use futures::executor::block_on;
use futures::future::{self, LocalBoxFuture};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use viewer_core::{
    AppConfig, CancellationToken, CommandDefinition, DataSourceAdapter, DataSourceConfig,
    DataSourceDefinition, DataStream, ExtensionCapability, ExtensionDescriptor, ExtensionError,
    ExtensionLoader, RuntimeContext, ServiceHooks, ServiceRegistration, SkipReason,
};

type Trace = Rc<RefCell<Vec<String>>>;

fn traced(id: &str, trace: &Trace) -> ExtensionDescriptor {
    let trace = Rc::clone(trace);
    ExtensionDescriptor::new(id, "1.0.0").with_services_fn(move |ctx| {
        trace.borrow_mut().push(ctx.extension_id().to_string());
        Ok(vec![ServiceRegistration::new(
            format!("{}.service", ctx.extension_id()),
            ctx.extension_id().to_string(),
        )])
    })
}

/// Node `i` depends on node `j < i` when bit `j` of `mask[i]` is set.
fn graph_from_masks(masks: &[u8], trace: &Trace) -> Vec<ExtensionDescriptor> {
    masks
        .iter()
        .enumerate()
        .map(|(i, mask)| {
            let mut descriptor = traced(&format!("ext{i}"), trace);
            for j in 0..i {
                if mask & (1 << j) != 0 {
                    descriptor = descriptor.depends_on(format!("ext{j}"));
                }
            }
            descriptor
        })
        .collect()
}

#[test]
fn acyclic_graphs_load_dependencies_first() {
    let graphs: [&[u8]; 6] = [
        &[0],
        &[0, 1],
        &[0, 0, 3],
        &[0, 1, 2, 4],
        &[0, 1, 1, 6, 9],
        &[0, 0, 3, 3, 12, 31],
    ];
    for masks in graphs {
        let trace: Trace = Rc::default();
        let descriptors = graph_from_masks(masks, &trace);
        // Declaration order reversed so dependents come before dependencies.
        let refs: Vec<&ExtensionDescriptor> = descriptors.iter().rev().collect();

        let mut runtime = RuntimeContext::new(AppConfig::default());
        let set = block_on(ExtensionLoader::default().load(
            &mut runtime,
            &refs,
            &CancellationToken::new(),
        ))
        .unwrap();

        let order = trace.borrow().clone();
        assert_eq!(order.len(), masks.len());
        assert_eq!(set.ids(), order.iter().map(String::as_str).collect::<Vec<_>>());
        for descriptor in &descriptors {
            let position = order.iter().position(|id| *id == descriptor.id).unwrap();
            for dependency in &descriptor.dependencies {
                let dep_position = order.iter().position(|id| *id == dependency.id).unwrap();
                assert!(
                    dep_position < position,
                    "{} loaded before its dependency {}",
                    descriptor.id,
                    dependency.id
                );
            }
        }
    }
}

#[test]
fn cyclic_graph_fails_and_registers_nothing() {
    let trace: Trace = Rc::default();
    let a = traced("a", &trace).depends_on("c");
    let b = traced("b", &trace).depends_on("a");
    let c = traced("c", &trace).depends_on("b");
    let free = traced("free", &trace);

    let mut runtime = RuntimeContext::new(AppConfig::default());
    let failure = block_on(ExtensionLoader::default().load(
        &mut runtime,
        &[&free, &a, &b, &c],
        &CancellationToken::new(),
    ))
    .unwrap_err();

    assert_eq!(failure.errors.len(), 1);
    match &failure.errors[0] {
        ExtensionError::CyclicDependency { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert_eq!(cycle.len(), 4);
        }
        other => panic!("expected cycle, got {other}"),
    }
    assert!(trace.borrow().is_empty());
    assert!(runtime.services().is_empty());
    assert!(runtime.loaded_extensions().is_empty());
}

#[test]
fn graph_errors_are_reported_together() {
    let trace: Trace = Rc::default();
    let a = traced("a", &trace).depends_on("ghost");
    let b = traced("b", &trace).depends_on("phantom");
    let x = traced("x", &trace).depends_on("y");
    let y = traced("y", &trace).depends_on("x");

    let mut runtime = RuntimeContext::new(AppConfig::default());
    let failure = block_on(ExtensionLoader::default().load(
        &mut runtime,
        &[&a, &b, &x, &y],
        &CancellationToken::new(),
    ))
    .unwrap_err();

    let missing = failure
        .errors
        .iter()
        .filter(|error| matches!(error, ExtensionError::MissingDependency { .. }))
        .count();
    let cycles = failure
        .errors
        .iter()
        .filter(|error| matches!(error, ExtensionError::CyclicDependency { .. }))
        .count();
    assert_eq!((missing, cycles), (2, 1));
    assert!(failure.to_string().contains("x -> y -> x"));
    assert!(trace.borrow().is_empty());
}

#[test]
fn failed_dependency_hides_dependent_and_keeps_independents() {
    let a_calls = Rc::new(Cell::new(0_u32));
    let counter = Rc::clone(&a_calls);
    let a = ExtensionDescriptor::new("a", "1.0.0")
        .depends_on("b")
        .with_services_fn(move |_| {
            counter.set(counter.get() + 1);
            Ok(vec![ServiceRegistration::new("a.service", 1_u32)])
        })
        .with_commands_fn(|_| Ok(vec![CommandDefinition::new("a.run", |_| Ok(Value::Null))]));
    let b = ExtensionDescriptor::new("b", "1.0.0")
        .with_services_fn(|_| Ok(vec![ServiceRegistration::new("b.service", 2_u32)]))
        .with_commands_fn(|_| Err("commands module exploded".into()));
    let c = ExtensionDescriptor::new("c", "1.0.0")
        .with_commands_fn(|_| Ok(vec![CommandDefinition::new("c.run", |_| Ok(json!("c")))]));

    let mut runtime = RuntimeContext::new(AppConfig::default());
    let failure = block_on(ExtensionLoader::default().load(
        &mut runtime,
        &[&a, &b, &c],
        &CancellationToken::new(),
    ))
    .unwrap_err();

    assert_eq!(a_calls.get(), 0);
    assert!(matches!(
        &failure.errors[0],
        ExtensionError::ExtensionInit { id, capability: ExtensionCapability::Commands, .. } if id == "b"
    ));
    assert_eq!(failure.partial.ids(), vec!["c"]);
    assert_eq!(failure.partial.skipped.len(), 1);
    assert_eq!(
        failure.partial.skipped[0].reason,
        SkipReason::DependencyFailed {
            dependency: "b".to_string()
        }
    );

    assert!(!runtime.services().contains("a.service"));
    assert!(!runtime.services().contains("b.service"));
    assert!(!runtime.commands().contains("DEFAULT", "a.run"));
    assert_eq!(runtime.run_command("c.run", &Value::Null, None).unwrap(), json!("c"));
}

#[test]
fn already_loaded_extensions_are_not_instantiated_twice() {
    let trace: Trace = Rc::default();
    let core = traced("core", &trace);
    let tools = traced("tools", &trace).depends_on("core");
    let loader = ExtensionLoader::default();
    let mut runtime = RuntimeContext::new(AppConfig::default());

    block_on(loader.load(&mut runtime, &[&core], &CancellationToken::new())).unwrap();
    let set = block_on(loader.load(&mut runtime, &[&core, &tools], &CancellationToken::new()))
        .unwrap();

    assert_eq!(set.ids(), vec!["tools"]);
    assert_eq!(set.already_loaded, vec!["core".to_string()]);
    assert_eq!(trace.borrow().as_slice(), ["core", "tools"]);
}

#[test]
fn service_configure_hooks_run_before_dependent_factories() {
    let configured = Rc::new(Cell::new(false));
    let flag = Rc::clone(&configured);
    let core = ExtensionDescriptor::new("core", "1.0.0").with_services_fn(move |_| {
        let flag = Rc::clone(&flag);
        Ok(vec![ServiceRegistration::new("settings", RefCell::new(0_u32)).with_hooks(
            ServiceHooks::none().with_configure(move |instance| {
                flag.set(true);
                if let Some(cell) = instance.downcast_ref::<RefCell<u32>>() {
                    *cell.borrow_mut() = 42;
                }
                future::ready(Ok(()))
            }),
        )])
    });
    let viewer = ExtensionDescriptor::new("viewer", "1.0.0")
        .depends_on("core")
        .with_commands_fn(|ctx| {
            let settings = ctx.service_as::<RefCell<u32>>("settings")?;
            let value = *settings.borrow();
            Ok(vec![CommandDefinition::new("settings.value", move |_| {
                Ok(json!(value))
            })])
        });

    let mut runtime = RuntimeContext::new(AppConfig::default());
    block_on(ExtensionLoader::default().load(
        &mut runtime,
        &[&viewer, &core],
        &CancellationToken::new(),
    ))
    .unwrap();

    assert!(configured.get());
    assert_eq!(
        runtime.run_command("settings.value", &Value::Null, None).unwrap(),
        json!(42)
    );
}

#[test]
fn registered_service_is_the_same_instance() {
    let shared: Rc<RefCell<Vec<u32>>> = Rc::default();
    let mut runtime = RuntimeContext::new(AppConfig::default());
    runtime
        .services_mut()
        .register(ServiceRegistration::from_shared("journal", shared.clone()));

    let fetched = runtime
        .services()
        .get_as::<RefCell<Vec<u32>>>("journal")
        .unwrap();
    assert!(Rc::ptr_eq(&fetched, &shared));
}

struct EchoArchive {
    initialized: Rc<Cell<bool>>,
    prefix: String,
}

impl DataSourceAdapter for EchoArchive {
    fn initialize(&self) -> LocalBoxFuture<'_, Result<(), viewer_core::BoxError>> {
        self.initialized.set(true);
        Box::pin(future::ready(Ok(())))
    }

    fn query(&self, params: Value) -> DataStream<'_> {
        let prefix = self.prefix.clone();
        stream::iter((1..=2).map(move |n| Ok(json!({ "id": format!("{prefix}{n}"), "params": params.clone() }))))
            .boxed_local()
    }

    fn retrieve(&self, _params: Value) -> DataStream<'_> {
        stream::empty().boxed_local()
    }

    fn store(&self, _payload: Value) -> DataStream<'_> {
        stream::empty().boxed_local()
    }
}

#[test]
fn configured_data_sources_are_instantiated_from_contributed_definitions() {
    let initialized = Rc::new(Cell::new(false));
    let flag = Rc::clone(&initialized);
    let default_ext = ExtensionDescriptor::new("@viewer/extension-default", "1.0.0")
        .with_data_sources_fn(move |_| {
            let flag = Rc::clone(&flag);
            Ok(vec![DataSourceDefinition::new("dicomweb", move |config| {
                let prefix = config.configuration["prefix"]
                    .as_str()
                    .unwrap_or("study-")
                    .to_string();
                let adapter: Rc<dyn DataSourceAdapter> = Rc::new(EchoArchive {
                    initialized: Rc::clone(&flag),
                    prefix,
                });
                Ok(adapter)
            })])
        });

    let config = AppConfig {
        data_sources: vec![DataSourceConfig::new(
            "@viewer/extension-default.dataSourcesModule.dicomweb",
            "archive",
        )
        .with_configuration(json!({ "prefix": "s" }))],
        default_data_source_name: Some("archive".to_string()),
        ..AppConfig::default()
    };
    let mut runtime = RuntimeContext::new(config);
    block_on(ExtensionLoader::default().load(
        &mut runtime,
        &[&default_ext],
        &CancellationToken::new(),
    ))
    .unwrap();

    assert!(initialized.get());
    assert_eq!(runtime.data_sources().active_source_name(), Some("archive"));
    let adapter = runtime.data_sources().active().unwrap();
    let records: Vec<Value> = block_on(
        adapter
            .query(json!({ "patient": "anon" }))
            .map(|record| record.unwrap())
            .collect(),
    );
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], json!("s1"));

    ExtensionLoader::default()
        .unload(&mut runtime, &["@viewer/extension-default".to_string()])
        .unwrap();
    assert!(runtime.data_sources().get("archive").is_err());
}
