//! Mode activation, switching and teardown.
//!
//! # Responsibility
//! - Load the extension closure a mode needs and install its overrides.
//! - On a switch, unload only what the previous mode needed exclusively.
//!
//! # Invariants
//! - At most one mode is active.
//! - Activating the active mode again registers nothing.
//! - A failed activation leaves no mode active and none of the attempted
//!   mode's extensions loaded.

use crate::extension::graph::{closure_errors, dependency_closure, GraphError};
use crate::extension::loader::{
    CancellationToken, ExtensionError, ExtensionLoader, SkippedExtension,
};
use crate::extension::manifest::ExtensionDescriptor;
use crate::mode::descriptor::{ModeDescriptor, ModeValidationError};
use crate::runtime::customizations::CustomizationScope;
use crate::runtime::services::DisposeFailures;
use crate::runtime::RuntimeContext;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Snapshot of the active mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveMode {
    pub mode_id: String,
    /// Distinguishes repeated activations of the same mode in logs.
    pub activation_id: Uuid,
    pub route: String,
    pub layout: Value,
    /// Loaded extensions the mode relies on, in load order.
    pub extensions: Vec<String>,
    /// Extensions of the closure that were skipped during loading.
    pub skipped: Vec<SkippedExtension>,
}

/// Mode activation and deactivation errors.
#[derive(Debug)]
pub enum ModeError {
    UnknownMode(String),
    UnknownExtension {
        mode: String,
        extension: String,
    },
    Invalid {
        mode: String,
        cause: ModeValidationError,
    },
    /// The mode's extension closure has missing dependencies or cycles.
    Dependency {
        mode: String,
        errors: Vec<GraphError>,
    },
    Load {
        mode: String,
        errors: Vec<ExtensionError>,
    },
    Cancelled {
        mode: String,
    },
    Deactivation {
        mode: String,
        failures: DisposeFailures,
    },
    /// Mode failed earlier and is no longer selectable.
    Unavailable(String),
    NotActive,
}

impl Display for ModeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMode(mode) => write!(f, "unknown mode: {mode}"),
            Self::UnknownExtension { mode, extension } => {
                write!(f, "mode `{mode}` references unknown extension `{extension}`")
            }
            Self::Invalid { mode, cause } => write!(f, "mode `{mode}` is invalid: {cause}"),
            Self::Dependency { mode, errors } => {
                write!(f, "mode `{mode}` has {} dependency error(s)", errors.len())?;
                for error in errors {
                    write!(f, "; {error}")?;
                }
                Ok(())
            }
            Self::Load { mode, errors } => {
                write!(f, "mode `{mode}` failed to load {} error(s)", errors.len())?;
                for error in errors {
                    write!(f, "; {error}")?;
                }
                Ok(())
            }
            Self::Cancelled { mode } => write!(f, "activation of mode `{mode}` was cancelled"),
            Self::Deactivation { mode, failures } => {
                write!(f, "mode `{mode}` deactivated with errors: {failures}")
            }
            Self::Unavailable(mode) => write!(f, "mode is unavailable: {mode}"),
            Self::NotActive => write!(f, "no mode is active"),
        }
    }
}

impl Error for ModeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invalid { cause, .. } => Some(cause),
            Self::Dependency { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn Error + 'static)),
            Self::Load { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn Error + 'static)),
            Self::Deactivation { failures, .. } => Some(failures),
            _ => None,
        }
    }
}

/// Owns the active-mode state of one application instance.
#[derive(Debug, Default)]
pub struct ModeComposer {
    loader: ExtensionLoader,
    active: Option<ActiveMode>,
    unavailable: BTreeSet<String>,
}

impl ModeComposer {
    pub fn new(loader: ExtensionLoader) -> Self {
        Self {
            loader,
            active: None,
            unavailable: BTreeSet::new(),
        }
    }

    pub fn loader(&self) -> &ExtensionLoader {
        &self.loader
    }

    pub fn active(&self) -> Option<&ActiveMode> {
        self.active.as_ref()
    }

    pub fn active_mode_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.mode_id.as_str())
    }

    pub fn is_unavailable(&self, mode_id: &str) -> bool {
        self.unavailable.contains(mode_id)
    }

    /// Marks a mode as not selectable.
    pub fn mark_unavailable(&mut self, mode_id: &str) {
        if self.unavailable.insert(mode_id.to_string()) {
            warn!(
                "event=mode_unavailable module=composer status=warn mode={}",
                mode_id
            );
        }
    }

    /// Activates `mode`, switching away from the current mode if needed.
    ///
    /// # Errors
    /// - [`ModeError::Unavailable`] for modes that failed before.
    /// - [`ModeError::Invalid`], [`ModeError::UnknownExtension`] and
    ///   [`ModeError::Dependency`] for broken declarations; the mode becomes
    ///   unavailable and the current mode stays active.
    /// - [`ModeError::Load`] when the loader fails; what this call loaded is
    ///   rolled back and the mode becomes unavailable.
    /// - [`ModeError::Cancelled`] when `cancel` fired; everything is rolled
    ///   back and the mode stays selectable.
    pub async fn activate(
        &mut self,
        runtime: &mut RuntimeContext,
        mode: &ModeDescriptor,
        available: &[ExtensionDescriptor],
        cancel: &CancellationToken,
    ) -> Result<ActiveMode, ModeError> {
        if self.is_unavailable(&mode.id) {
            return Err(ModeError::Unavailable(mode.id.clone()));
        }
        if let Some(active) = self.active.as_ref() {
            if active.mode_id == mode.id {
                debug!(
                    "event=mode_activate module=composer status=noop mode={} activation_id={}",
                    mode.id, active.activation_id
                );
                return Ok(active.clone());
            }
        }

        if let Err(cause) = mode.validate() {
            self.mark_unavailable(&mode.id);
            return Err(ModeError::Invalid {
                mode: mode.id.clone(),
                cause,
            });
        }
        let closure = dependency_closure(mode.extensions.iter().map(String::as_str), available)
            .map_err(|extension| {
                self.mark_unavailable(&mode.id);
                ModeError::UnknownExtension {
                    mode: mode.id.clone(),
                    extension,
                }
            })?;
        let graph_errors = closure_errors(&closure);
        if !graph_errors.is_empty() {
            self.mark_unavailable(&mode.id);
            return Err(ModeError::Dependency {
                mode: mode.id.clone(),
                errors: graph_errors,
            });
        }
        let needed: BTreeSet<&str> = closure.iter().map(|descriptor| descriptor.id.as_str()).collect();

        let activation_id = Uuid::new_v4();
        info!(
            "event=mode_activate module=composer status=start mode={} activation_id={} instance_id={} extensions={}",
            mode.id,
            activation_id,
            runtime.instance_id(),
            needed.len()
        );

        if let Some(previous) = self.active.take() {
            self.switch_away(runtime, &previous, &needed);
        }

        let set = match self.loader.load(runtime, &closure, cancel).await {
            Ok(set) => set,
            Err(failure) => {
                let cancelled = failure.is_cancelled();
                self.roll_back(runtime, &needed);
                if cancelled {
                    warn!(
                        "event=mode_activate module=composer status=cancelled mode={} activation_id={}",
                        mode.id, activation_id
                    );
                    return Err(ModeError::Cancelled {
                        mode: mode.id.clone(),
                    });
                }
                error!(
                    "event=mode_activate module=composer status=error mode={} activation_id={} error={}",
                    mode.id, activation_id, failure
                );
                self.mark_unavailable(&mode.id);
                return Err(ModeError::Load {
                    mode: mode.id.clone(),
                    errors: failure.errors,
                });
            }
        };

        self.install_overrides(runtime, mode);

        let extensions: Vec<String> = runtime
            .loaded_extensions()
            .iter()
            .filter(|loaded| needed.contains(loaded.id.as_str()))
            .map(|loaded| loaded.id.clone())
            .collect();
        let active = ActiveMode {
            mode_id: mode.id.clone(),
            activation_id,
            route: mode.route.clone(),
            layout: mode.layout.clone(),
            extensions,
            skipped: set.skipped,
        };
        info!(
            "event=mode_activate module=composer status=ok mode={} activation_id={} loaded={} reused={} skipped={}",
            mode.id,
            activation_id,
            set.loaded.len(),
            set.already_loaded.len(),
            active.skipped.len()
        );
        self.active = Some(active.clone());
        Ok(active)
    }

    /// Clears overrides and unloads every extension of the active mode.
    pub fn deactivate(&mut self, runtime: &mut RuntimeContext) -> Result<(), ModeError> {
        let active = self.active.take().ok_or(ModeError::NotActive)?;
        clear_overrides(runtime);
        runtime.reset_contexts();
        let result = self.loader.unload(runtime, &active.extensions);
        info!(
            "event=mode_deactivate module=composer status={} mode={} activation_id={}",
            if result.is_ok() { "ok" } else { "error" },
            active.mode_id,
            active.activation_id
        );
        result.map_err(|failures| ModeError::Deactivation {
            mode: active.mode_id,
            failures,
        })
    }

    fn switch_away(
        &self,
        runtime: &mut RuntimeContext,
        previous: &ActiveMode,
        needed: &BTreeSet<&str>,
    ) {
        clear_overrides(runtime);
        runtime.reset_contexts();
        let exclusive: Vec<String> = previous
            .extensions
            .iter()
            .filter(|id| !needed.contains(id.as_str()))
            .cloned()
            .collect();
        debug!(
            "event=mode_switch module=composer status=ok from={} exclusive={} shared={}",
            previous.mode_id,
            exclusive.len(),
            previous.extensions.len() - exclusive.len()
        );
        if let Err(failures) = self.loader.unload(runtime, &exclusive) {
            error!(
                "event=mode_switch module=composer status=error from={} error={}",
                previous.mode_id, failures
            );
        }
    }

    fn roll_back(&self, runtime: &mut RuntimeContext, needed: &BTreeSet<&str>) {
        clear_overrides(runtime);
        let loaded: Vec<String> = runtime
            .loaded_extensions()
            .iter()
            .filter(|loaded| needed.contains(loaded.id.as_str()))
            .map(|loaded| loaded.id.clone())
            .collect();
        if let Err(failures) = self.loader.unload(runtime, &loaded) {
            error!(
                "event=mode_rollback module=composer status=error error={}",
                failures
            );
        }
    }

    fn install_overrides(&self, runtime: &mut RuntimeContext, mode: &ModeDescriptor) {
        for definition in &mode.command_overrides {
            runtime.commands_mut().install_override(definition.clone());
        }
        for binding in &mode.hotkey_overrides {
            if let Err(err) = runtime.hotkeys_mut().install_override(binding) {
                warn!(
                    "event=mode_override module=composer status=warn mode={} command={} error={}",
                    mode.id, binding.command_name, err
                );
            }
        }
        for customization in &mode.customizations {
            runtime.customizations_mut().set(
                CustomizationScope::Mode,
                customization.clone(),
                None,
            );
        }
    }
}

fn clear_overrides(runtime: &mut RuntimeContext) {
    let commands = runtime.commands_mut().clear_overrides();
    let hotkeys = runtime.hotkeys_mut().clear_overrides();
    let customizations = runtime
        .customizations_mut()
        .clear_scope(CustomizationScope::Mode);
    debug!(
        "event=mode_overrides_cleared module=composer status=ok commands={} hotkeys={} customizations={}",
        commands, hotkeys, customizations
    );
}
