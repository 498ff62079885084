//! Data-source adapter definitions and configured instances.
//!
//! # Responsibility
//! - Hold adapter definitions contributed by extensions under
//!   `<extension-id>.dataSourcesModule.<name>` namespaces.
//! - Hold adapter instances created from boot configuration entries and
//!   track which source is active.
//!
//! # Invariants
//! - Source names are unique; the active source always names a registered
//!   instance.
//! - Transport failures stay opaque; the registry never inspects them.

use crate::runtime::RegisterOutcome;
use crate::BoxError;
use futures::future::{self, LocalBoxFuture};
use futures::stream::LocalBoxStream;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

/// Module segment used in data-source namespaces.
pub const DATA_SOURCES_MODULE: &str = "dataSourcesModule";

static NAMESPACE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<ext>@?[a-z0-9][a-z0-9._/-]*)\.dataSourcesModule\.(?P<name>[A-Za-z0-9_-]+)$")
        .expect("valid data source namespace regex")
});

static SOURCE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid data source name regex")
});

/// One record yielded by an adapter. Its shape belongs to the adapter.
pub type DataRecord = Value;

/// Lazy result sequence returned by adapter operations.
pub type DataStream<'a> = LocalBoxStream<'a, Result<DataRecord, DataSourceError>>;

/// Factory turning one configuration entry into an adapter instance.
pub type AdapterFactory =
    Rc<dyn Fn(&DataSourceConfig) -> Result<Rc<dyn DataSourceAdapter>, BoxError>>;

/// Transport boundary to an image archive or similar backend.
pub trait DataSourceAdapter {
    /// Runs once after creation, before the instance becomes visible.
    fn initialize(&self) -> LocalBoxFuture<'_, Result<(), BoxError>> {
        Box::pin(future::ready(Ok(())))
    }

    fn query(&self, params: Value) -> DataStream<'_>;

    fn retrieve(&self, params: Value) -> DataStream<'_>;

    fn store(&self, payload: Value) -> DataStream<'_>;
}

/// Boot configuration entry instantiating one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    /// Full definition namespace, e.g. `default.dataSourcesModule.dicomweb`.
    pub namespace: String,
    pub source_name: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub configuration: Value,
}

impl DataSourceConfig {
    pub fn new(namespace: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            source_name: source_name.into(),
            friendly_name: None,
            configuration: Value::Null,
        }
    }

    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Adapter definition contributed by an extension.
#[derive(Clone)]
pub struct DataSourceDefinition {
    pub name: String,
    create: AdapterFactory,
}

impl DataSourceDefinition {
    pub fn new<F>(name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&DataSourceConfig) -> Result<Rc<dyn DataSourceAdapter>, BoxError> + 'static,
    {
        Self {
            name: name.into(),
            create: Rc::new(create),
        }
    }

    /// Namespace this definition occupies when owned by `extension_id`.
    pub fn namespace(&self, extension_id: &str) -> String {
        format!("{extension_id}.{DATA_SOURCES_MODULE}.{}", self.name)
    }

    /// Builds one adapter instance for `config`.
    pub fn create(&self, config: &DataSourceConfig) -> Result<Rc<dyn DataSourceAdapter>, BoxError> {
        (self.create)(config)
    }
}

impl std::fmt::Debug for DataSourceDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Data-source lookup and transport errors.
#[derive(Debug)]
pub enum DataSourceError {
    NotFound(String),
    UnknownNamespace(String),
    InvalidNamespace(String),
    InvalidSourceName(String),
    /// Adapter factory or `initialize` failed.
    Create {
        namespace: String,
        source_name: String,
        cause: BoxError,
    },
    /// Opaque failure raised by an adapter while streaming.
    Transport(BoxError),
}

impl DataSourceError {
    pub fn transport(cause: impl Into<BoxError>) -> Self {
        Self::Transport(cause.into())
    }
}

impl Display for DataSourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "data source not found: {name}"),
            Self::UnknownNamespace(namespace) => {
                write!(f, "no data source definition for namespace: {namespace}")
            }
            Self::InvalidNamespace(namespace) => {
                write!(f, "data source namespace is invalid: {namespace}")
            }
            Self::InvalidSourceName(name) => write!(f, "data source name is invalid: {name}"),
            Self::Create {
                namespace,
                source_name,
                cause,
            } => write!(
                f,
                "failed to create data source `{source_name}` from `{namespace}`: {cause}"
            ),
            Self::Transport(cause) => write!(f, "data source transport failed: {cause}"),
        }
    }
}

impl Error for DataSourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Create { cause, .. } | Self::Transport(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Source names are ASCII alphanumerics plus `_` and `-`.
pub fn validate_source_name(source_name: &str) -> Result<(), DataSourceError> {
    if SOURCE_NAME_RE.is_match(source_name.trim()) {
        Ok(())
    } else {
        Err(DataSourceError::InvalidSourceName(source_name.to_string()))
    }
}

/// Splits a namespace into `(extension_id, definition_name)`.
pub fn parse_namespace(namespace: &str) -> Result<(&str, &str), DataSourceError> {
    let captures = NAMESPACE_RE
        .captures(namespace.trim())
        .ok_or_else(|| DataSourceError::InvalidNamespace(namespace.to_string()))?;
    match (captures.name("ext"), captures.name("name")) {
        (Some(ext), Some(name)) => Ok((ext.as_str(), name.as_str())),
        _ => Err(DataSourceError::InvalidNamespace(namespace.to_string())),
    }
}

struct DefinitionEntry {
    definition: DataSourceDefinition,
    owner: Option<String>,
}

struct InstanceEntry {
    adapter: Rc<dyn DataSourceAdapter>,
    namespace: String,
    owner: Option<String>,
}

/// Definitions, configured instances and the active selection.
#[derive(Default)]
pub struct DataSourceRegistry {
    definitions: BTreeMap<String, DefinitionEntry>,
    instances: BTreeMap<String, InstanceEntry>,
    configs: Vec<DataSourceConfig>,
    default_source_name: Option<String>,
    active_source_name: Option<String>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs boot configuration entries and the default source name.
    pub fn configure(&mut self, configs: Vec<DataSourceConfig>, default_source_name: Option<String>) {
        self.configs = configs;
        self.default_source_name = default_source_name;
    }

    /// Configuration entries targeting `namespace`.
    pub fn configs_for(&self, namespace: &str) -> Vec<&DataSourceConfig> {
        self.configs
            .iter()
            .filter(|config| config.namespace == namespace)
            .collect()
    }

    pub fn configs(&self) -> &[DataSourceConfig] {
        &self.configs
    }

    /// Registers one definition under `owner`'s namespace.
    pub fn register_definition(
        &mut self,
        owner: &str,
        definition: DataSourceDefinition,
    ) -> Result<RegisterOutcome, DataSourceError> {
        let namespace = definition.namespace(owner);
        parse_namespace(&namespace)?;
        let replaced = self
            .definitions
            .insert(
                namespace.clone(),
                DefinitionEntry {
                    definition,
                    owner: Some(owner.to_string()),
                },
            )
            .is_some();
        if replaced {
            warn!(
                "event=data_source_definition_replaced module=data_sources status=warn namespace={}",
                namespace
            );
            return Ok(RegisterOutcome::Replaced);
        }
        debug!(
            "event=data_source_definition_registered module=data_sources status=ok namespace={}",
            namespace
        );
        Ok(RegisterOutcome::Inserted)
    }

    pub fn definition(&self, namespace: &str) -> Result<&DataSourceDefinition, DataSourceError> {
        self.definitions
            .get(namespace)
            .map(|entry| &entry.definition)
            .ok_or_else(|| DataSourceError::UnknownNamespace(namespace.to_string()))
    }

    /// Sorted definition namespaces.
    pub fn namespaces(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    /// Creates an instance from a registered definition and initializes it.
    pub async fn create_instance(
        &mut self,
        config: &DataSourceConfig,
    ) -> Result<RegisterOutcome, DataSourceError> {
        let entry = self
            .definitions
            .get(config.namespace.as_str())
            .ok_or_else(|| DataSourceError::UnknownNamespace(config.namespace.clone()))?;
        let owner = entry.owner.clone();
        let adapter = instantiate(&entry.definition, config).await?;
        self.insert_instance(config, adapter, owner.as_deref())
    }

    /// Registers an already initialized adapter under `config.source_name`.
    pub fn insert_instance(
        &mut self,
        config: &DataSourceConfig,
        adapter: Rc<dyn DataSourceAdapter>,
        owner: Option<&str>,
    ) -> Result<RegisterOutcome, DataSourceError> {
        let source_name = config.source_name.trim();
        validate_source_name(source_name)?;
        let previous = self.instances.insert(
            source_name.to_string(),
            InstanceEntry {
                adapter,
                namespace: config.namespace.clone(),
                owner: owner.map(str::to_string),
            },
        );
        if previous.is_some() {
            warn!(
                "event=data_source_replaced module=data_sources status=warn source={}",
                source_name
            );
            return Ok(RegisterOutcome::Replaced);
        }
        debug!(
            "event=data_source_registered module=data_sources status=ok source={} namespace={}",
            source_name, config.namespace
        );
        Ok(RegisterOutcome::Inserted)
    }

    pub fn get(&self, source_name: &str) -> Result<Rc<dyn DataSourceAdapter>, DataSourceError> {
        self.instances
            .get(source_name.trim())
            .map(|entry| Rc::clone(&entry.adapter))
            .ok_or_else(|| DataSourceError::NotFound(source_name.trim().to_string()))
    }

    /// Namespace the instance `source_name` was created from.
    pub fn namespace_of(&self, source_name: &str) -> Option<&str> {
        self.instances
            .get(source_name)
            .map(|entry| entry.namespace.as_str())
    }

    /// Sorted instance names.
    pub fn source_names(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Selects one active source.
    pub fn select_active(&mut self, source_name: &str) -> Result<(), DataSourceError> {
        let normalized = source_name.trim();
        if !self.instances.contains_key(normalized) {
            return Err(DataSourceError::NotFound(normalized.to_string()));
        }
        self.active_source_name = Some(normalized.to_string());
        Ok(())
    }

    pub fn clear_active(&mut self) {
        self.active_source_name = None;
    }

    /// Explicit selection, else the configured default when it is registered.
    pub fn active_source_name(&self) -> Option<&str> {
        if let Some(active) = self.active_source_name.as_deref() {
            return Some(active);
        }
        self.default_source_name
            .as_deref()
            .filter(|name| self.instances.contains_key(*name))
    }

    pub fn active(&self) -> Result<Rc<dyn DataSourceAdapter>, DataSourceError> {
        match self.active_source_name() {
            Some(name) => self.get(name),
            None => Err(DataSourceError::NotFound(
                self.default_source_name
                    .clone()
                    .unwrap_or_else(|| "<none selected>".to_string()),
            )),
        }
    }

    /// Drops definitions and instances contributed by `owner`.
    pub fn remove_owned_by(&mut self, owner: &str) -> usize {
        let before = self.definitions.len() + self.instances.len();
        self.definitions
            .retain(|_, entry| entry.owner.as_deref() != Some(owner));
        self.instances
            .retain(|_, entry| entry.owner.as_deref() != Some(owner));
        if let Some(active) = self.active_source_name.as_deref() {
            if !self.instances.contains_key(active) {
                self.active_source_name = None;
            }
        }
        before - self.definitions.len() - self.instances.len()
    }
}

/// Creates and initializes one adapter; nothing is registered.
pub(crate) async fn instantiate(
    definition: &DataSourceDefinition,
    config: &DataSourceConfig,
) -> Result<Rc<dyn DataSourceAdapter>, DataSourceError> {
    let create_error = |cause: BoxError| DataSourceError::Create {
        namespace: config.namespace.clone(),
        source_name: config.source_name.clone(),
        cause,
    };
    let adapter = definition.create(config).map_err(create_error)?;
    adapter.initialize().await.map_err(create_error)?;
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::{
        parse_namespace, DataSourceAdapter, DataSourceConfig, DataSourceDefinition,
        DataSourceError, DataSourceRegistry, DataStream,
    };
    use crate::runtime::RegisterOutcome;
    use futures::executor::block_on;
    use futures::stream::{self, StreamExt};
    use serde_json::{json, Value};
    use std::rc::Rc;

    struct MemoryArchive {
        studies: Vec<Value>,
    }

    impl DataSourceAdapter for MemoryArchive {
        fn query(&self, params: Value) -> DataStream<'_> {
            let patient = params.get("patientId").cloned();
            stream::iter(
                self.studies
                    .iter()
                    .filter(move |study| match &patient {
                        Some(id) => study.get("patientId") == Some(id),
                        None => true,
                    })
                    .cloned()
                    .map(Ok),
            )
            .boxed_local()
        }

        fn retrieve(&self, _params: Value) -> DataStream<'_> {
            stream::iter(vec![Err(DataSourceError::transport("archive offline"))]).boxed_local()
        }

        fn store(&self, payload: Value) -> DataStream<'_> {
            stream::once(async move { Ok(json!({ "stored": payload })) }).boxed_local()
        }
    }

    fn archive_definition() -> DataSourceDefinition {
        DataSourceDefinition::new("memory", |config| {
            let studies = config
                .configuration
                .get("studies")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(Rc::new(MemoryArchive { studies }) as Rc<dyn DataSourceAdapter>)
        })
    }

    #[test]
    fn parses_namespaces() {
        assert_eq!(
            parse_namespace("default.dataSourcesModule.dicomweb").expect("valid namespace"),
            ("default", "dicomweb")
        );
        assert_eq!(
            parse_namespace("@viewer/ext-default.dataSourcesModule.json").expect("scoped id"),
            ("@viewer/ext-default", "json")
        );
        assert!(matches!(
            parse_namespace("default.commandsModule.x"),
            Err(DataSourceError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn creates_configured_instance_and_streams_results() {
        let mut registry = DataSourceRegistry::new();
        registry
            .register_definition("default", archive_definition())
            .expect("definition registers");

        let config = DataSourceConfig::new("default.dataSourcesModule.memory", "local")
            .with_configuration(json!({
                "studies": [
                    { "patientId": "p1", "uid": "1.2.3" },
                    { "patientId": "p2", "uid": "1.2.4" }
                ]
            }));
        let outcome = block_on(registry.create_instance(&config)).expect("instance created");
        assert_eq!(outcome, RegisterOutcome::Inserted);

        let adapter = registry.get("local").expect("instance registered");
        let hits: Vec<_> = block_on(adapter.query(json!({ "patientId": "p2" })).collect());
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].as_ref().expect("record ok")["uid"],
            json!("1.2.4")
        );

        let failures: Vec<_> = block_on(adapter.retrieve(Value::Null).collect());
        assert!(matches!(failures[0], Err(DataSourceError::Transport(_))));
    }

    #[test]
    fn unknown_namespace_is_reported() {
        let mut registry = DataSourceRegistry::new();
        let config = DataSourceConfig::new("missing.dataSourcesModule.x", "remote");
        let err = block_on(registry.create_instance(&config)).expect_err("no definition");
        assert!(matches!(err, DataSourceError::UnknownNamespace(_)));
    }

    #[test]
    fn active_falls_back_to_configured_default() {
        let mut registry = DataSourceRegistry::new();
        registry.configure(
            vec![DataSourceConfig::new("default.dataSourcesModule.memory", "local")],
            Some("local".to_string()),
        );
        assert!(registry.active().is_err());

        registry
            .register_definition("default", archive_definition())
            .expect("definition registers");
        let configs: Vec<_> = registry
            .configs_for("default.dataSourcesModule.memory")
            .into_iter()
            .cloned()
            .collect();
        for config in &configs {
            block_on(registry.create_instance(config)).expect("instance created");
        }
        assert_eq!(registry.active_source_name(), Some("local"));

        registry
            .select_active("nope")
            .expect_err("unknown source cannot be selected");
        assert_eq!(registry.remove_owned_by("default"), 2);
        assert!(registry.active_source_name().is_none());
    }
}
