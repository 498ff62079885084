//! Per-application runtime state.
//!
//! # Responsibility
//! - Own every registry and the context stack of one application instance.
//! - Route command runs and key presses through the context stack.
//!
//! # Invariants
//! - A `RuntimeContext` is never shared between application instances;
//!   several contexts may coexist in one process.
//! - Only the extension loader and the mode composer mutate registries on
//!   behalf of extensions.

pub mod commands;
pub mod context_stack;
pub mod customizations;
pub mod data_sources;
pub mod hotkeys;
pub mod services;

use crate::config::AppConfig;
use crate::extension::loader::LoadedExtension;
use commands::{CommandError, CommandRegistry};
use context_stack::ContextStack;
use customizations::CustomizationRegistry;
use data_sources::DataSourceRegistry;
use hotkeys::HotkeyRegistry;
use log::{debug, info};
use serde_json::Value;
use services::ServiceRegistry;
use std::fmt::{Debug, Formatter};
use uuid::Uuid;

/// Result of a register call that may replace an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Replaced,
}

impl RegisterOutcome {
    pub fn is_replaced(self) -> bool {
        matches!(self, Self::Replaced)
    }
}

/// Registries, context stack and loaded-extension bookkeeping.
pub struct RuntimeContext {
    instance_id: Uuid,
    config: AppConfig,
    services: ServiceRegistry,
    commands: CommandRegistry,
    hotkeys: HotkeyRegistry,
    data_sources: DataSourceRegistry,
    customizations: CustomizationRegistry,
    context_stack: ContextStack,
    loaded: Vec<LoadedExtension>,
}

impl RuntimeContext {
    /// Creates empty registries; data-source entries come from `config`.
    pub fn new(config: AppConfig) -> Self {
        let instance_id = Uuid::new_v4();
        let mut data_sources = DataSourceRegistry::new();
        data_sources.configure(
            config.data_sources.clone(),
            config.default_data_source_name.clone(),
        );
        info!(
            "event=runtime_created module=runtime status=ok instance_id={} data_sources={}",
            instance_id,
            config.data_sources.len()
        );
        Self {
            instance_id,
            config,
            services: ServiceRegistry::new(),
            commands: CommandRegistry::new(),
            hotkeys: HotkeyRegistry::new(),
            data_sources,
            customizations: CustomizationRegistry::new(),
            context_stack: ContextStack::new(),
            loaded: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandRegistry {
        &mut self.commands
    }

    pub fn hotkeys(&self) -> &HotkeyRegistry {
        &self.hotkeys
    }

    pub fn hotkeys_mut(&mut self) -> &mut HotkeyRegistry {
        &mut self.hotkeys
    }

    pub fn data_sources(&self) -> &DataSourceRegistry {
        &self.data_sources
    }

    pub fn data_sources_mut(&mut self) -> &mut DataSourceRegistry {
        &mut self.data_sources
    }

    pub fn customizations(&self) -> &CustomizationRegistry {
        &self.customizations
    }

    pub fn customizations_mut(&mut self) -> &mut CustomizationRegistry {
        &mut self.customizations
    }

    pub fn context_stack(&self) -> &ContextStack {
        &self.context_stack
    }

    pub fn push_context(&mut self, context: impl Into<String>) {
        self.context_stack.push(context);
    }

    /// Pops the active context; `None` when only the global context remains.
    pub fn pop_context(&mut self) -> Option<String> {
        self.context_stack.pop()
    }

    /// Drops every pushed context, leaving only the global one.
    pub fn reset_contexts(&mut self) {
        self.context_stack.reset();
    }

    /// Runs `name` resolved through `explicit_context` and the stack.
    pub fn run_command(
        &self,
        name: &str,
        args: &Value,
        explicit_context: Option<&str>,
    ) -> Result<Value, CommandError> {
        self.commands
            .run(&self.context_stack, name, args, explicit_context)
    }

    /// Dispatches a key press.
    ///
    /// Returns `Ok(None)` when no binding matches `combo` in the current
    /// stack. A matched binding runs its command in the binding's context.
    pub fn press_hotkey(&self, combo: &str) -> Result<Option<Value>, CommandError> {
        let Some(resolved) = self.hotkeys.resolve_in_stack(&self.context_stack, combo) else {
            debug!(
                "event=hotkey_press module=runtime status=unbound combo={}",
                combo
            );
            return Ok(None);
        };
        self.commands
            .run(
                &self.context_stack,
                &resolved.command_name,
                &resolved.args,
                Some(resolved.context.as_str()),
            )
            .map(Some)
    }

    /// Extensions currently loaded, in load order.
    pub fn loaded_extensions(&self) -> &[LoadedExtension] {
        &self.loaded
    }

    pub fn is_loaded(&self, extension_id: &str) -> bool {
        self.loaded.iter().any(|loaded| loaded.id == extension_id)
    }

    pub fn loaded_extension(&self, extension_id: &str) -> Option<&LoadedExtension> {
        self.loaded.iter().find(|loaded| loaded.id == extension_id)
    }

    pub(crate) fn record_loaded(&mut self, extension: LoadedExtension) {
        self.loaded.push(extension);
    }

    pub(crate) fn forget_loaded(&mut self, extension_id: &str) -> Option<LoadedExtension> {
        let index = self
            .loaded
            .iter()
            .position(|loaded| loaded.id == extension_id)?;
        Some(self.loaded.remove(index))
    }
}

impl Debug for RuntimeContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("instance_id", &self.instance_id)
            .field("services", &self.services.len())
            .field("commands", &self.commands.len())
            .field("hotkeys", &self.hotkeys.len())
            .field("data_sources", &self.data_sources.len())
            .field("context", &self.context_stack.current())
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeContext;
    use crate::config::AppConfig;
    use crate::runtime::commands::CommandOptions;
    use crate::runtime::commands::CommandError;
    use serde_json::{json, Value};

    #[test]
    fn contexts_are_isolated_per_instance() {
        let mut first = RuntimeContext::new(AppConfig::default());
        let second = RuntimeContext::new(AppConfig::default());
        assert_ne!(first.instance_id(), second.instance_id());

        first.commands_mut().register_command(
            "DEFAULT",
            "ping",
            |_| Ok(json!("pong")),
            CommandOptions::default(),
        );
        assert_eq!(
            first
                .run_command("ping", &Value::Null, None)
                .expect("ping registered"),
            json!("pong")
        );
        assert!(matches!(
            second.run_command("ping", &Value::Null, None),
            Err(CommandError::CommandNotFound { .. })
        ));
    }

    #[test]
    fn press_hotkey_runs_command_in_binding_context() {
        let mut runtime = RuntimeContext::new(AppConfig::default());
        runtime.commands_mut().register_command(
            "viewer",
            "zoom",
            |call| Ok(json!({ "context": call.context })),
            CommandOptions::default(),
        );
        runtime
            .hotkeys_mut()
            .bind("viewer", "+", "zoom")
            .expect_err("bare plus is not a key");
        runtime
            .hotkeys_mut()
            .bind("viewer", "z", "zoom")
            .expect("bind zoom");

        assert_eq!(runtime.press_hotkey("z").expect("no binding active"), None);

        runtime.push_context("viewer");
        let result = runtime
            .press_hotkey("Z")
            .expect("zoom runs")
            .expect("binding matched");
        assert_eq!(result, json!({ "context": "viewer" }));
        assert_eq!(runtime.pop_context().as_deref(), Some("viewer"));
        assert_eq!(runtime.pop_context(), None);
    }

    #[test]
    fn press_hotkey_surfaces_missing_command() {
        let mut runtime = RuntimeContext::new(AppConfig::default());
        runtime
            .hotkeys_mut()
            .bind("DEFAULT", "ctrl+s", "saveReport")
            .expect("bind save");
        let err = runtime
            .press_hotkey("ctrl+s")
            .expect_err("command not registered");
        assert!(matches!(err, CommandError::CommandNotFound { .. }));
    }
}
