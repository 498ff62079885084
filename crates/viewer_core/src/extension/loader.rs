//! Extension loader: validation, ordering, staged instantiation, teardown.
//!
//! # Responsibility
//! - Turn a batch of descriptors into registered contributions, one
//!   extension at a time, dependencies first.
//! - Remove an extension's contributions again in reverse load order.
//!
//! # Invariants
//! - Graph and descriptor errors abort the batch before anything is
//!   registered.
//! - An extension's contributions become visible together, after all of its
//!   factories succeeded; a failed extension leaves nothing behind.
//! - Dependents of a failed or skipped extension are never instantiated.

use crate::extension::capability::ExtensionCapability;
use crate::extension::graph::{topological_order, DependencyNode, GraphError};
use crate::extension::manifest::{ExtensionDescriptor, ManifestValidationError};
use crate::extension::provider::FactoryContext;
use crate::extension::version::Version;
use crate::runtime::commands::CommandDefinition;
use crate::runtime::customizations::{Customization, CustomizationScope};
use crate::runtime::data_sources::{
    self, parse_namespace, validate_source_name, DataSourceAdapter, DataSourceConfig,
    DataSourceDefinition,
};
use crate::runtime::hotkeys::HotkeyBinding;
use crate::runtime::services::{DisposeFailures, ServiceRegistration};
use crate::runtime::RuntimeContext;
use crate::BoxError;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

/// What to do when a dependency's version misses its requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Skip the requester and its dependents; keep loading the rest.
    #[default]
    Skip,
    /// Treat mismatches like graph errors; load nothing.
    Fail,
}

/// Cooperative cancellation flag shared between a caller and a load.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Rc<Cell<bool>>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

/// Extension that completed instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedExtension {
    pub id: String,
    pub version: Version,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<ExtensionCapability>,
}

/// Why an extension was not instantiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    VersionMismatch {
        dependency: String,
        required: String,
        found: Version,
    },
    DependencySkipped { dependency: String },
    DependencyFailed { dependency: String },
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionMismatch {
                dependency,
                required,
                found,
            } => write!(f, "dependency `{dependency}` is {found}, required {required}"),
            Self::DependencySkipped { dependency } => {
                write!(f, "dependency `{dependency}` was skipped")
            }
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency `{dependency}` failed to initialize")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedExtension {
    pub id: String,
    pub reason: SkipReason,
}

/// Outcome of one load call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedExtensionSet {
    /// Newly instantiated extensions, in load order.
    pub loaded: Vec<LoadedExtension>,
    pub skipped: Vec<SkippedExtension>,
    /// Requested ids that were loaded before this call.
    pub already_loaded: Vec<String>,
}

impl LoadedExtensionSet {
    pub fn ids(&self) -> Vec<&str> {
        self.loaded.iter().map(|loaded| loaded.id.as_str()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.loaded.iter().any(|loaded| loaded.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }
}

/// Extension loading errors.
#[derive(Debug)]
pub enum ExtensionError {
    InvalidDescriptor {
        id: String,
        cause: ManifestValidationError,
    },
    DuplicateExtension(String),
    CyclicDependency {
        cycle: Vec<String>,
    },
    MissingDependency {
        requester: String,
        missing: String,
    },
    VersionMismatch {
        requester: String,
        dependency: String,
        required: String,
        found: Version,
    },
    ExtensionInit {
        id: String,
        capability: ExtensionCapability,
        cause: BoxError,
    },
    /// Load stopped before these extensions were instantiated.
    Cancelled {
        pending: Vec<String>,
    },
}

impl Display for ExtensionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDescriptor { id, cause } => {
                write!(f, "invalid extension descriptor `{id}`: {cause}")
            }
            Self::DuplicateExtension(id) => write!(f, "extension declared twice: {id}"),
            Self::CyclicDependency { cycle } => {
                write!(f, "dependency cycle: {}", cycle.join(" -> "))
            }
            Self::MissingDependency { requester, missing } => {
                write!(f, "extension `{requester}` depends on missing `{missing}`")
            }
            Self::VersionMismatch {
                requester,
                dependency,
                required,
                found,
            } => write!(
                f,
                "extension `{requester}` requires `{dependency}` {required}, found {found}"
            ),
            Self::ExtensionInit {
                id,
                capability,
                cause,
            } => write!(f, "extension `{id}` failed in {capability}: {cause}"),
            Self::Cancelled { pending } => {
                write!(f, "load cancelled; {} extension(s) not loaded", pending.len())
            }
        }
    }
}

impl Error for ExtensionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidDescriptor { cause, .. } => Some(cause),
            Self::ExtensionInit { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<GraphError> for ExtensionError {
    fn from(value: GraphError) -> Self {
        match value {
            GraphError::MissingDependency { requester, missing } => {
                Self::MissingDependency { requester, missing }
            }
            GraphError::CyclicDependency { cycle } => Self::CyclicDependency { cycle },
        }
    }
}

/// Aggregated load errors plus whatever did load.
#[derive(Debug)]
pub struct LoadFailure {
    pub errors: Vec<ExtensionError>,
    pub partial: LoadedExtensionSet,
}

impl LoadFailure {
    fn before_registration(errors: Vec<ExtensionError>) -> Self {
        Self {
            errors,
            partial: LoadedExtensionSet::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.errors
            .iter()
            .any(|error| matches!(error, ExtensionError::Cancelled { .. }))
    }
}

impl Display for LoadFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "extension load failed with {} error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl Error for LoadFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.errors.first().map(|error| error as &(dyn Error + 'static))
    }
}

/// Contributions of one extension awaiting commit.
#[derive(Default)]
struct StagedExtension {
    services: Vec<ServiceRegistration>,
    commands: Vec<CommandDefinition>,
    hotkeys: Vec<HotkeyBinding>,
    data_source_definitions: Vec<DataSourceDefinition>,
    data_source_instances: Vec<(DataSourceConfig, Rc<dyn DataSourceAdapter>)>,
    customizations: Vec<Customization>,
}

impl StagedExtension {
    /// Drops the stage, running dispose hooks of staged services.
    fn discard(self, extension_id: &str) {
        for registration in self.services.into_iter().rev() {
            let name = registration.name.clone();
            if let Err(err) = registration.dispose() {
                error!(
                    "event=staged_service_dispose module=loader status=error extension={} name={} error={}",
                    extension_id, name, err
                );
            }
        }
    }
}

type StageError = (ExtensionCapability, BoxError);

/// Loads and unloads extensions into a [`RuntimeContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionLoader {
    version_policy: VersionPolicy,
}

impl ExtensionLoader {
    pub fn new(version_policy: VersionPolicy) -> Self {
        Self { version_policy }
    }

    pub fn version_policy(&self) -> VersionPolicy {
        self.version_policy
    }

    /// Instantiates `descriptors` in dependency order.
    ///
    /// Descriptors already loaded into `runtime` are reported in
    /// [`LoadedExtensionSet::already_loaded`] and satisfy dependencies.
    ///
    /// # Errors
    /// - Descriptor, duplicate, graph and (with [`VersionPolicy::Fail`])
    ///   version errors: returned together with an empty partial set.
    /// - Factory or hook failures and cancellation: returned with the
    ///   partial set of extensions that did load.
    pub async fn load(
        &self,
        runtime: &mut RuntimeContext,
        descriptors: &[&ExtensionDescriptor],
        cancel: &CancellationToken,
    ) -> Result<LoadedExtensionSet, LoadFailure> {
        info!(
            "event=extensions_load module=loader status=start instance_id={} requested={}",
            runtime.instance_id(),
            descriptors.len()
        );

        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for descriptor in descriptors {
            if let Err(cause) = descriptor.validate() {
                errors.push(ExtensionError::InvalidDescriptor {
                    id: descriptor.id.clone(),
                    cause,
                });
            } else if !seen.insert(descriptor.id.as_str()) {
                errors.push(ExtensionError::DuplicateExtension(descriptor.id.clone()));
            }
        }
        if !errors.is_empty() {
            return Err(self.reject(errors));
        }

        let mut result = LoadedExtensionSet::default();
        let mut pending: Vec<&ExtensionDescriptor> = Vec::new();
        for descriptor in descriptors {
            if runtime.is_loaded(&descriptor.id) {
                result.already_loaded.push(descriptor.id.clone());
            } else {
                pending.push(*descriptor);
            }
        }

        let nodes: Vec<DependencyNode<'_>> = pending
            .iter()
            .map(|descriptor| DependencyNode::from_descriptor(descriptor))
            .collect();
        let order = topological_order(&nodes, |id| runtime.is_loaded(id)).map_err(|graph| {
            self.reject(graph.into_iter().map(ExtensionError::from).collect())
        })?;
        let ordered: Vec<&ExtensionDescriptor> =
            order.into_iter().map(|position| pending[position]).collect();

        let versions: BTreeMap<&str, Version> = ordered
            .iter()
            .filter_map(|descriptor| {
                descriptor
                    .parsed_version()
                    .ok()
                    .map(|version| (descriptor.id.as_str(), version))
            })
            .collect();
        let mismatches: BTreeMap<&str, ExtensionError> = ordered
            .iter()
            .filter_map(|descriptor| {
                first_version_mismatch(descriptor, &versions, runtime)
                    .map(|mismatch| (descriptor.id.as_str(), mismatch))
            })
            .collect();
        if self.version_policy == VersionPolicy::Fail && !mismatches.is_empty() {
            return Err(self.reject(mismatches.into_values().collect()));
        }

        let mut mismatches = mismatches;
        let mut skipped_ids = BTreeSet::new();
        let mut failed_ids = BTreeSet::new();
        for (position, descriptor) in ordered.iter().enumerate() {
            let id = descriptor.id.as_str();
            if cancel.is_cancelled() {
                let remaining: Vec<String> = ordered[position..]
                    .iter()
                    .map(|descriptor| descriptor.id.clone())
                    .collect();
                warn!(
                    "event=extensions_load module=loader status=cancelled instance_id={} pending={}",
                    runtime.instance_id(),
                    remaining.len()
                );
                errors.push(ExtensionError::Cancelled { pending: remaining });
                break;
            }

            if let Some(reason) = blocked_by(descriptor, &skipped_ids, &failed_ids) {
                info!(
                    "event=extension_skipped module=loader status=skipped extension={} reason=\"{}\"",
                    id, reason
                );
                skipped_ids.insert(id);
                result.skipped.push(SkippedExtension {
                    id: id.to_string(),
                    reason,
                });
                continue;
            }

            if let Some(ExtensionError::VersionMismatch {
                dependency,
                required,
                found,
                ..
            }) = mismatches.remove(id)
            {
                warn!(
                    "event=extension_skipped module=loader status=warn extension={} dependency={} required={} found={}",
                    id, dependency, required, found
                );
                skipped_ids.insert(id);
                result.skipped.push(SkippedExtension {
                    id: id.to_string(),
                    reason: SkipReason::VersionMismatch {
                        dependency,
                        required,
                        found,
                    },
                });
                continue;
            }

            let mut staged = StagedExtension::default();
            let staged_result = stage_extension(runtime, descriptor, &mut staged).await;
            match staged_result {
                Ok(()) => {
                    let loaded = commit(runtime, descriptor, staged);
                    result.loaded.push(loaded);
                }
                Err((capability, cause)) => {
                    error!(
                        "event=extension_init module=loader status=error extension={} capability={} error={}",
                        id, capability, cause
                    );
                    staged.discard(id);
                    failed_ids.insert(id);
                    errors.push(ExtensionError::ExtensionInit {
                        id: id.to_string(),
                        capability,
                        cause,
                    });
                }
            }
        }

        info!(
            "event=extensions_load module=loader status={} instance_id={} loaded={} skipped={} failed={}",
            if errors.is_empty() { "ok" } else { "error" },
            runtime.instance_id(),
            result.loaded.len(),
            result.skipped.len(),
            errors.len()
        );
        if errors.is_empty() {
            Ok(result)
        } else {
            Err(LoadFailure {
                errors,
                partial: result,
            })
        }
    }

    fn reject(&self, errors: Vec<ExtensionError>) -> LoadFailure {
        for error in &errors {
            error!(
                "event=extensions_load module=loader status=rejected error={}",
                error
            );
        }
        LoadFailure::before_registration(errors)
    }

    /// Removes every contribution of `ids`, newest extension first.
    ///
    /// Ids that are not loaded are ignored. Every service dispose hook runs;
    /// failures are returned together.
    pub fn unload(
        &self,
        runtime: &mut RuntimeContext,
        ids: &[String],
    ) -> Result<(), DisposeFailures> {
        let mut targets: Vec<(usize, String)> = ids
            .iter()
            .filter_map(|id| {
                runtime
                    .loaded_extensions()
                    .iter()
                    .position(|loaded| &loaded.id == id)
                    .map(|position| (position, id.clone()))
            })
            .collect();
        targets.sort_by(|(a, _), (b, _)| b.cmp(a));
        targets.dedup();

        let mut failures = DisposeFailures::default();
        for (_, id) in targets {
            let commands = runtime.commands_mut().unregister_owned_by(&id);
            let hotkeys = runtime.hotkeys_mut().unbind_owned_by(&id);
            let data_sources = runtime.data_sources_mut().remove_owned_by(&id);
            let customizations = runtime.customizations_mut().remove_owned_by(&id);
            let disposed = runtime.services_mut().dispose_owned_by(&id);
            let failed = disposed.len();
            failures.extend(disposed);
            runtime.forget_loaded(&id);

            let dependents: Vec<&str> = runtime
                .loaded_extensions()
                .iter()
                .filter(|loaded| loaded.dependencies.iter().any(|dependency| *dependency == id))
                .map(|loaded| loaded.id.as_str())
                .collect();
            if !dependents.is_empty() {
                warn!(
                    "event=extension_unload module=loader status=warn extension={} reason=still_required dependents={}",
                    id,
                    dependents.join(",")
                );
            }
            info!(
                "event=extension_unload module=loader status={} extension={} commands={} hotkeys={} data_sources={} customizations={} dispose_failures={}",
                if failed == 0 { "ok" } else { "error" },
                id,
                commands,
                hotkeys,
                data_sources,
                customizations,
                failed
            );
        }
        failures.into_result()
    }

    /// Unloads every loaded extension.
    pub fn unload_all(&self, runtime: &mut RuntimeContext) -> Result<(), DisposeFailures> {
        let ids: Vec<String> = runtime
            .loaded_extensions()
            .iter()
            .map(|loaded| loaded.id.clone())
            .collect();
        self.unload(runtime, &ids)
    }
}

fn first_version_mismatch(
    descriptor: &ExtensionDescriptor,
    batch_versions: &BTreeMap<&str, Version>,
    runtime: &RuntimeContext,
) -> Option<ExtensionError> {
    descriptor.dependencies.iter().find_map(|dependency| {
        let requirement = dependency.requirement().ok().flatten()?;
        let found = batch_versions
            .get(dependency.id.as_str())
            .copied()
            .or_else(|| {
                runtime
                    .loaded_extension(&dependency.id)
                    .map(|loaded| loaded.version)
            })?;
        if requirement.matches(&found) {
            return None;
        }
        Some(ExtensionError::VersionMismatch {
            requester: descriptor.id.clone(),
            dependency: dependency.id.clone(),
            required: requirement.to_string(),
            found,
        })
    })
}

fn blocked_by(
    descriptor: &ExtensionDescriptor,
    skipped: &BTreeSet<&str>,
    failed: &BTreeSet<&str>,
) -> Option<SkipReason> {
    descriptor.dependencies.iter().find_map(|dependency| {
        let id = dependency.id.as_str();
        if failed.contains(id) {
            Some(SkipReason::DependencyFailed {
                dependency: id.to_string(),
            })
        } else if skipped.contains(id) {
            Some(SkipReason::DependencySkipped {
                dependency: id.to_string(),
            })
        } else {
            None
        }
    })
}

/// Runs every factory of `descriptor` into `staged` without touching
/// registries.
async fn stage_extension(
    runtime: &RuntimeContext,
    descriptor: &ExtensionDescriptor,
    staged: &mut StagedExtension,
) -> Result<(), StageError> {
    let id = descriptor.id.as_str();

    if let Some(provider) = descriptor.services_provider() {
        let ctx = FactoryContext::new(id, runtime, &[]);
        staged.services = provider
            .services(&ctx)
            .await
            .map_err(|cause| (ExtensionCapability::Services, cause))?;
        for registration in staged.services.iter_mut() {
            registration
                .run_configure()
                .await
                .map_err(|cause| (ExtensionCapability::Services, cause))?;
        }
        debug!(
            "event=extension_stage module=loader status=ok extension={} capability={} count={}",
            id,
            ExtensionCapability::Services,
            staged.services.len()
        );
    }

    if let Some(provider) = descriptor.commands_provider() {
        let ctx = FactoryContext::new(id, runtime, &staged.services);
        staged.commands = provider
            .commands(&ctx)
            .await
            .map_err(|cause| (ExtensionCapability::Commands, cause))?;
        debug!(
            "event=extension_stage module=loader status=ok extension={} capability={} count={}",
            id,
            ExtensionCapability::Commands,
            staged.commands.len()
        );
    }

    if let Some(provider) = descriptor.hotkeys_provider() {
        let ctx = FactoryContext::new(id, runtime, &staged.services);
        let bindings = provider
            .hotkeys(&ctx)
            .await
            .map_err(|cause| (ExtensionCapability::Hotkeys, cause))?;
        staged.hotkeys = bindings
            .iter()
            .map(HotkeyBinding::normalized)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|cause| (ExtensionCapability::Hotkeys, BoxError::from(cause)))?;
    }

    if let Some(provider) = descriptor.data_sources_provider() {
        let ctx = FactoryContext::new(id, runtime, &staged.services);
        let definitions = provider
            .data_sources(&ctx)
            .await
            .map_err(|cause| (ExtensionCapability::DataSources, cause))?;
        let stage_error = |cause: data_sources::DataSourceError| {
            (ExtensionCapability::DataSources, BoxError::from(cause))
        };
        for definition in &definitions {
            let namespace = definition.namespace(id);
            parse_namespace(&namespace).map_err(stage_error)?;
            for config in runtime.data_sources().configs_for(&namespace) {
                validate_source_name(&config.source_name).map_err(stage_error)?;
                let adapter = data_sources::instantiate(definition, config)
                    .await
                    .map_err(stage_error)?;
                staged
                    .data_source_instances
                    .push((config.clone(), adapter));
            }
        }
        staged.data_source_definitions = definitions;
    }

    if let Some(provider) = descriptor.customization_provider() {
        let ctx = FactoryContext::new(id, runtime, &staged.services);
        staged.customizations = provider
            .customizations(&ctx)
            .await
            .map_err(|cause| (ExtensionCapability::Customizations, cause))?;
    }

    Ok(())
}

/// Moves a completed stage into the registries.
fn commit(
    runtime: &mut RuntimeContext,
    descriptor: &ExtensionDescriptor,
    staged: StagedExtension,
) -> LoadedExtension {
    let id = descriptor.id.as_str();
    let StagedExtension {
        services,
        commands,
        hotkeys,
        data_source_definitions,
        data_source_instances,
        customizations,
    } = staged;

    for registration in services {
        runtime.services_mut().insert(registration, Some(id));
    }
    for definition in commands {
        runtime.commands_mut().register_definition(definition, Some(id));
    }
    for binding in &hotkeys {
        if let Err(err) = runtime.hotkeys_mut().bind_binding(binding, Some(id)) {
            warn!(
                "event=extension_commit module=loader status=warn extension={} hotkey={} error={}",
                id, binding.command_name, err
            );
        }
    }
    for definition in data_source_definitions {
        if let Err(err) = runtime.data_sources_mut().register_definition(id, definition) {
            warn!(
                "event=extension_commit module=loader status=warn extension={} error={}",
                id, err
            );
        }
    }
    for (config, adapter) in data_source_instances {
        if let Err(err) = runtime
            .data_sources_mut()
            .insert_instance(&config, adapter, Some(id))
        {
            warn!(
                "event=extension_commit module=loader status=warn extension={} error={}",
                id, err
            );
        }
    }
    for customization in customizations {
        runtime
            .customizations_mut()
            .set(CustomizationScope::Default, customization, Some(id));
    }

    let loaded = LoadedExtension {
        id: id.to_string(),
        version: descriptor
            .parsed_version()
            .unwrap_or(Version::new(0, 0, 0)),
        dependencies: descriptor
            .dependencies
            .iter()
            .map(|dependency| dependency.id.clone())
            .collect(),
        capabilities: descriptor.capabilities(),
    };
    runtime.record_loaded(loaded.clone());
    info!(
        "event=extension_loaded module=loader status=ok extension={} version={}",
        loaded.id, loaded.version
    );
    loaded
}
