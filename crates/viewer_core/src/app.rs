//! Application boot and public runtime API.
//!
//! # Responsibility
//! - Validate the boot bundle (config, extensions, modes) as a whole.
//! - Seed application-level state: global hotkeys, global customizations,
//!   data-source configs.
//! - Expose mode activation and command dispatch to the UI layer.
//!
//! # Invariants
//! - Boot either returns a ready application or every problem found.
//! - Mode activation and command failures reach the error handler.

use crate::config::{AppConfig, ConfigError};
use crate::extension::graph::{closure_errors, dependency_closure};
use crate::extension::loader::{CancellationToken, ExtensionLoader};
use crate::extension::manifest::{ExtensionDescriptor, ManifestValidationError};
use crate::logging::{self, LoggingError};
use crate::mode::composer::{ActiveMode, ModeComposer, ModeError};
use crate::mode::descriptor::{ModeDescriptor, ModeValidationError};
use crate::runtime::commands::{CommandError, CommandRegistry};
use crate::runtime::customizations::{CustomizationRegistry, CustomizationScope};
use crate::runtime::data_sources::DataSourceRegistry;
use crate::runtime::hotkeys::{HotkeyError, HotkeyRegistry};
use crate::runtime::services::{DisposeFailures, ServiceRegistry};
use crate::runtime::RuntimeContext;
use log::{error, info, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

/// Notification collaborator for user-facing failures.
pub type ErrorHandler = Rc<dyn Fn(&dyn Error)>;

/// Everything needed to boot one application instance.
#[derive(Default)]
pub struct BootConfig {
    pub config: AppConfig,
    pub extensions: Vec<ExtensionDescriptor>,
    pub modes: Vec<ModeDescriptor>,
    pub error_handler: Option<ErrorHandler>,
}

impl BootConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_extension(mut self, descriptor: ExtensionDescriptor) -> Self {
        self.extensions.push(descriptor);
        self
    }

    pub fn with_mode(mut self, mode: ModeDescriptor) -> Self {
        self.modes.push(mode);
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&dyn Error) + 'static,
    {
        self.error_handler = Some(Rc::new(handler));
        self
    }
}

impl std::fmt::Debug for BootConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootConfig")
            .field("config", &self.config)
            .field("extensions", &self.extensions.len())
            .field("modes", &self.modes.len())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// One boot problem.
#[derive(Debug)]
pub enum BootIssue {
    Config(ConfigError),
    Logging(LoggingError),
    InvalidExtension {
        id: String,
        cause: ManifestValidationError,
    },
    DuplicateExtension(String),
    InvalidMode {
        id: String,
        cause: ModeValidationError,
    },
    DuplicateMode(String),
    GlobalHotkey {
        command: String,
        cause: HotkeyError,
    },
}

impl Display for BootIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Logging(err) => write!(f, "logging init failed: {err}"),
            Self::InvalidExtension { id, cause } => {
                write!(f, "extension `{id}` is invalid: {cause}")
            }
            Self::DuplicateExtension(id) => write!(f, "extension declared twice: {id}"),
            Self::InvalidMode { id, cause } => write!(f, "mode `{id}` is invalid: {cause}"),
            Self::DuplicateMode(id) => write!(f, "mode declared twice: {id}"),
            Self::GlobalHotkey { command, cause } => {
                write!(f, "global hotkey for `{command}` is invalid: {cause}")
            }
        }
    }
}

impl Error for BootIssue {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Logging(err) => Some(err),
            Self::InvalidExtension { cause, .. } => Some(cause),
            Self::InvalidMode { cause, .. } => Some(cause),
            Self::GlobalHotkey { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Aggregated boot failure.
#[derive(Debug)]
pub struct BootError {
    pub issues: Vec<BootIssue>,
}

impl Display for BootError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "boot failed with {} issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "; {issue}")?;
        }
        Ok(())
    }
}

impl Error for BootError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.issues.first().map(|issue| issue as &(dyn Error + 'static))
    }
}

/// Mode entry for a mode picker.
#[derive(Debug, Clone, Copy)]
pub struct ModeListing<'a> {
    pub mode: &'a ModeDescriptor,
    /// Every extension the mode names was supplied at boot.
    pub enabled: bool,
}

/// One booted viewer application.
pub struct Application {
    runtime: RuntimeContext,
    composer: ModeComposer,
    extensions: Vec<ExtensionDescriptor>,
    modes: Vec<ModeDescriptor>,
    error_handler: Option<ErrorHandler>,
    dependency_issues: Vec<ModeError>,
}

impl Application {
    /// Validates `boot` and builds the runtime.
    ///
    /// # Errors
    /// Returns every config, descriptor and global hotkey problem at once.
    pub fn boot(boot: BootConfig) -> Result<Self, BootError> {
        let BootConfig {
            config,
            extensions,
            modes,
            error_handler,
        } = boot;

        let mut issues = Vec::new();
        if let Err(err) = config.validate() {
            issues.push(BootIssue::Config(err));
        } else if let Err(err) = logging::init_from_config(&config.logging) {
            issues.push(BootIssue::Logging(err));
        }

        let mut extension_ids = BTreeSet::new();
        for descriptor in &extensions {
            if let Err(cause) = descriptor.validate() {
                issues.push(BootIssue::InvalidExtension {
                    id: descriptor.id.clone(),
                    cause,
                });
            }
            if !extension_ids.insert(descriptor.id.as_str()) {
                issues.push(BootIssue::DuplicateExtension(descriptor.id.clone()));
            }
        }
        let mut mode_ids = BTreeSet::new();
        for mode in &modes {
            if let Err(cause) = mode.validate() {
                issues.push(BootIssue::InvalidMode {
                    id: mode.id.clone(),
                    cause,
                });
            }
            if !mode_ids.insert(mode.id.as_str()) {
                issues.push(BootIssue::DuplicateMode(mode.id.clone()));
            }
        }
        if !issues.is_empty() {
            error!(
                "event=app_boot module=app status=error issues={}",
                issues.len()
            );
            return Err(BootError { issues });
        }

        let loader = ExtensionLoader::new(config.version_policy);
        let hotkeys = config.hotkeys.clone();
        let customizations = config.customization_service.clone();
        let mut runtime = RuntimeContext::new(config);

        for binding in &hotkeys {
            if let Err(cause) = runtime.hotkeys_mut().bind_binding(binding, None) {
                issues.push(BootIssue::GlobalHotkey {
                    command: binding.command_name.clone(),
                    cause,
                });
            }
        }
        if !issues.is_empty() {
            return Err(BootError { issues });
        }
        let seeded = runtime
            .customizations_mut()
            .seed_from_object(CustomizationScope::Global, &customizations);

        info!(
            "event=app_boot module=app status=ok instance_id={} extensions={} modes={} hotkeys={} customizations={}",
            runtime.instance_id(),
            extensions.len(),
            modes.len(),
            hotkeys.len(),
            seeded
        );
        let mut app = Self {
            runtime,
            composer: ModeComposer::new(loader),
            extensions,
            modes,
            error_handler,
            dependency_issues: Vec::new(),
        };
        app.check_mode_dependencies();
        Ok(app)
    }

    /// Marks modes whose extension closure cannot load as unavailable.
    ///
    /// Modes naming an extension that was not supplied stay listed as
    /// disabled instead.
    fn check_mode_dependencies(&mut self) {
        let mut issues = Vec::new();
        for mode in &self.modes {
            let Ok(closure) =
                dependency_closure(mode.extensions.iter().map(String::as_str), &self.extensions)
            else {
                continue;
            };
            let errors = closure_errors(&closure);
            if !errors.is_empty() {
                issues.push(ModeError::Dependency {
                    mode: mode.id.clone(),
                    errors,
                });
            }
        }
        for issue in &issues {
            if let ModeError::Dependency { mode, .. } = issue {
                self.composer.mark_unavailable(mode);
            }
            self.report(issue);
        }
        self.dependency_issues = issues;
    }

    /// Dependency problems found at boot, one entry per affected mode.
    pub fn dependency_issues(&self) -> &[ModeError] {
        &self.dependency_issues
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeContext {
        &mut self.runtime
    }

    pub fn config(&self) -> &AppConfig {
        self.runtime.config()
    }

    pub fn mode(&self, mode_id: &str) -> Option<&ModeDescriptor> {
        self.modes.iter().find(|mode| mode.id == mode_id)
    }

    pub fn active_mode(&self) -> Option<&ActiveMode> {
        self.composer.active()
    }

    /// Selectable modes; failed modes are left out.
    ///
    /// A mode is enabled when its whole extension closure was supplied and
    /// orders cleanly. With `groupEnabledModesFirst`, enabled modes come
    /// first; otherwise declaration order is kept.
    pub fn available_modes(&self) -> Vec<ModeListing<'_>> {
        let mut listings: Vec<ModeListing<'_>> = self
            .modes
            .iter()
            .filter(|mode| !self.composer.is_unavailable(&mode.id))
            .map(|mode| ModeListing {
                mode,
                enabled: dependency_closure(
                    mode.extensions.iter().map(String::as_str),
                    &self.extensions,
                )
                .map(|closure| closure_errors(&closure).is_empty())
                .unwrap_or(false),
            })
            .collect();
        if self.config().group_enabled_modes_first {
            listings.sort_by_key(|listing| !listing.enabled);
        }
        listings
    }

    /// Activates `mode_id` and returns a handle to it.
    pub async fn activate_mode(&mut self, mode_id: &str) -> Result<ActiveModeHandle<'_>, ModeError> {
        self.activate_mode_with(mode_id, &CancellationToken::new())
            .await
    }

    /// Activates `mode_id`; `cancel` stops loading between extensions.
    pub async fn activate_mode_with(
        &mut self,
        mode_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ActiveModeHandle<'_>, ModeError> {
        let result = match self.modes.iter().find(|mode| mode.id == mode_id) {
            Some(mode) => {
                self.composer
                    .activate(&mut self.runtime, mode, &self.extensions, cancel)
                    .await
            }
            None => Err(ModeError::UnknownMode(mode_id.to_string())),
        };
        match result {
            Ok(active) => Ok(ActiveModeHandle { app: self, active }),
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Deactivates the active mode.
    pub fn deactivate(&mut self) -> Result<(), ModeError> {
        self.composer.deactivate(&mut self.runtime).map_err(|err| {
            self.report(&err);
            err
        })
    }

    /// Runs a command; failures also go to the error handler.
    pub fn run_command(
        &self,
        name: &str,
        args: &Value,
        context: Option<&str>,
    ) -> Result<Value, CommandError> {
        self.runtime
            .run_command(name, args, context)
            .map_err(|err| {
                self.report(&err);
                err
            })
    }

    /// Dispatches a key press; `Ok(None)` when nothing is bound.
    pub fn press(&self, combo: &str) -> Result<Option<Value>, CommandError> {
        self.runtime.press_hotkey(combo).map_err(|err| {
            self.report(&err);
            err
        })
    }

    pub fn push_context(&mut self, context: impl Into<String>) {
        self.runtime.push_context(context);
    }

    pub fn pop_context(&mut self) -> Option<String> {
        self.runtime.pop_context()
    }

    pub fn services(&self) -> &ServiceRegistry {
        self.runtime.services()
    }

    pub fn commands(&self) -> &CommandRegistry {
        self.runtime.commands()
    }

    pub fn hotkeys(&self) -> &HotkeyRegistry {
        self.runtime.hotkeys()
    }

    pub fn hotkeys_mut(&mut self) -> &mut HotkeyRegistry {
        self.runtime.hotkeys_mut()
    }

    pub fn data_sources(&self) -> &DataSourceRegistry {
        self.runtime.data_sources()
    }

    pub fn data_sources_mut(&mut self) -> &mut DataSourceRegistry {
        self.runtime.data_sources_mut()
    }

    pub fn customizations(&self) -> &CustomizationRegistry {
        self.runtime.customizations()
    }

    /// Deactivates the mode, unloads what is left and disposes
    /// application-level services.
    pub fn shutdown(mut self) -> Result<(), DisposeFailures> {
        let mut failures = DisposeFailures::default();
        match self.composer.deactivate(&mut self.runtime) {
            Ok(()) | Err(ModeError::NotActive) => {}
            Err(ModeError::Deactivation { failures: mode, .. }) => failures.extend(mode),
            Err(err) => warn!(
                "event=app_shutdown module=app status=warn error={}",
                err
            ),
        }
        if let Err(remaining) = self.composer.loader().unload_all(&mut self.runtime) {
            failures.extend(remaining);
        }
        if let Err(app_level) = self.runtime.services_mut().dispose_all() {
            failures.extend(app_level);
        }
        info!(
            "event=app_shutdown module=app status={} instance_id={} failures={}",
            if failures.is_empty() { "ok" } else { "error" },
            self.runtime.instance_id(),
            failures.len()
        );
        failures.into_result()
    }

    fn report(&self, err: &dyn Error) {
        error!(
            "event=app_error module=app status=error instance_id={} error={}",
            self.runtime.instance_id(),
            err
        );
        if let Some(handler) = self.error_handler.as_ref() {
            handler(err);
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("runtime", &self.runtime)
            .field("active_mode", &self.composer.active_mode_id())
            .field("extensions", &self.extensions.len())
            .field("modes", &self.modes.len())
            .finish()
    }
}

/// Borrowed view of the active mode.
pub struct ActiveModeHandle<'a> {
    app: &'a mut Application,
    active: ActiveMode,
}

impl<'a> ActiveModeHandle<'a> {
    pub fn info(&self) -> &ActiveMode {
        &self.active
    }

    pub fn mode_id(&self) -> &str {
        &self.active.mode_id
    }

    /// Runs a command resolved through the current context stack.
    pub fn run(&self, name: &str, args: &Value) -> Result<Value, CommandError> {
        self.app.run_command(name, args, None)
    }

    pub fn run_in(&self, name: &str, args: &Value, context: &str) -> Result<Value, CommandError> {
        self.app.run_command(name, args, Some(context))
    }

    pub fn press(&self, combo: &str) -> Result<Option<Value>, CommandError> {
        self.app.press(combo)
    }

    pub fn services(&self) -> &ServiceRegistry {
        self.app.services()
    }

    pub fn hotkeys(&self) -> &HotkeyRegistry {
        self.app.hotkeys()
    }

    pub fn hotkeys_mut(&mut self) -> &mut HotkeyRegistry {
        self.app.hotkeys_mut()
    }

    pub fn push_context(&mut self, context: impl Into<String>) {
        self.app.push_context(context);
    }

    pub fn pop_context(&mut self) -> Option<String> {
        self.app.pop_context()
    }

    pub fn application(&self) -> &Application {
        &*self.app
    }

    /// Deactivates the mode this handle was issued for.
    pub fn deactivate(self) -> Result<(), ModeError> {
        if self.app.composer.active().map(|active| active.activation_id)
            != Some(self.active.activation_id)
        {
            return Err(ModeError::NotActive);
        }
        self.app.deactivate()
    }
}
