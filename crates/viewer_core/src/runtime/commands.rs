//! Context-scoped command registry and dispatch.
//!
//! # Responsibility
//! - Map `(context, name)` to a handler plus UI/dispatch options.
//! - Resolve unqualified calls through the context stack.
//! - Convert handler failures (errors and panics) into [`CommandError`].
//!
//! # Invariants
//! - At most one base entry per `(context, name)`; duplicates replace and
//!   are reported as [`RegisterOutcome::Replaced`].
//! - Mode overrides shadow base entries in the same context until cleared.
//! - A handler failure never escapes `run` unconverted.

use crate::runtime::context_stack::{ContextStack, GLOBAL_CONTEXT};
use crate::runtime::RegisterOutcome;
use crate::BoxError;
use log::{debug, error, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Command handler: arguments in, JSON result out.
pub type CommandHandler = Rc<dyn Fn(&CommandCall<'_>) -> Result<Value, BoxError>>;

/// Invocation details passed to a handler.
#[derive(Debug, Clone, Copy)]
pub struct CommandCall<'a> {
    pub name: &'a str,
    /// Context the command was resolved in.
    pub context: &'a str,
    pub args: &'a Value,
}

/// Presentation and dispatch options of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    /// Listed by command palettes and toolbars.
    pub visible_in_ui: bool,
    /// Context that must be active (explicit or on the stack) to run.
    pub required_context: Option<String>,
    pub label: Option<String>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            visible_in_ui: true,
            required_context: None,
            label: None,
        }
    }
}

/// Command contribution from an extension or a mode override.
#[derive(Clone)]
pub struct CommandDefinition {
    pub context: String,
    pub name: String,
    pub handler: CommandHandler,
    pub options: CommandOptions,
}

impl CommandDefinition {
    /// Creates a command in the global context.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CommandCall<'_>) -> Result<Value, BoxError> + 'static,
    {
        Self {
            context: GLOBAL_CONTEXT.to_string(),
            name: name.into(),
            handler: Rc::new(handler),
            options: CommandOptions::default(),
        }
    }

    pub fn in_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.options.label = Some(label.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.options.visible_in_ui = false;
        self
    }

    pub fn requires_context(mut self, context: impl Into<String>) -> Self {
        self.options.required_context = Some(context.into());
        self
    }
}

impl std::fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDefinition")
            .field("context", &self.context)
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Palette-facing summary of one visible command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSummary {
    pub context: String,
    pub name: String,
    pub label: Option<String>,
}

/// Command lookup and execution errors.
#[derive(Debug)]
pub enum CommandError {
    CommandNotFound {
        name: String,
        searched: Vec<String>,
    },
    ContextNotActive {
        name: String,
        required: String,
    },
    Execution {
        name: String,
        context: String,
        cause: BoxError,
    },
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandNotFound { name, searched } => write!(
                f,
                "command not found: {name} (searched: {})",
                searched.join(" -> ")
            ),
            Self::ContextNotActive { name, required } => write!(
                f,
                "command `{name}` requires context `{required}` to be active"
            ),
            Self::Execution {
                name,
                context,
                cause,
            } => write!(f, "command `{name}` failed in context `{context}`: {cause}"),
        }
    }
}

impl Error for CommandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Execution { cause, .. } => Some(cause.as_ref()),
            Self::CommandNotFound { .. } | Self::ContextNotActive { .. } => None,
        }
    }
}

/// Handler panic converted into an ordinary failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerPanic(pub String);

impl Display for HandlerPanic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler panicked: {}", self.0)
    }
}

impl Error for HandlerPanic {}

#[derive(Clone)]
struct CommandEntry {
    handler: CommandHandler,
    options: CommandOptions,
    owner: Option<String>,
}

/// Command resolved for one call.
#[derive(Clone)]
pub struct ResolvedCommand {
    pub context: String,
    pub handler: CommandHandler,
    pub options: CommandOptions,
}

type CommandTable = BTreeMap<String, BTreeMap<String, CommandEntry>>;

/// `(context, name)` keyed command store.
#[derive(Default)]
pub struct CommandRegistry {
    base: CommandTable,
    overrides: CommandTable,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an application-level command.
    pub fn register_command<F>(
        &mut self,
        context: &str,
        name: &str,
        handler: F,
        options: CommandOptions,
    ) -> RegisterOutcome
    where
        F: Fn(&CommandCall<'_>) -> Result<Value, BoxError> + 'static,
    {
        let definition = CommandDefinition::new(name, handler)
            .in_context(context)
            .with_options(options);
        self.register_definition(definition, None)
    }

    /// Registers a command contribution on behalf of `owner`.
    pub fn register_definition(
        &mut self,
        definition: CommandDefinition,
        owner: Option<&str>,
    ) -> RegisterOutcome {
        let CommandDefinition {
            context,
            name,
            handler,
            options,
        } = definition;
        let entry = CommandEntry {
            handler,
            options,
            owner: owner.map(str::to_string),
        };
        let previous = self
            .base
            .entry(context.clone())
            .or_default()
            .insert(name.clone(), entry);

        match previous {
            Some(previous) => {
                warn!(
                    "event=command_replaced module=commands status=warn context={} name={} previous_owner={} owner={}",
                    context,
                    name,
                    previous.owner.as_deref().unwrap_or("app"),
                    owner.unwrap_or("app")
                );
                RegisterOutcome::Replaced
            }
            None => {
                debug!(
                    "event=command_registered module=commands status=ok context={} name={}",
                    context, name
                );
                RegisterOutcome::Inserted
            }
        }
    }

    /// Installs a mode-scoped override that shadows the base entry.
    pub fn install_override(&mut self, definition: CommandDefinition) {
        debug!(
            "event=command_override module=commands status=ok context={} name={}",
            definition.context, definition.name
        );
        self.overrides
            .entry(definition.context)
            .or_default()
            .insert(
                definition.name,
                CommandEntry {
                    handler: definition.handler,
                    options: definition.options,
                    owner: None,
                },
            );
    }

    /// Drops every mode-scoped override.
    pub fn clear_overrides(&mut self) -> usize {
        let count = self.overrides.values().map(BTreeMap::len).sum();
        self.overrides.clear();
        count
    }

    pub fn override_count(&self) -> usize {
        self.overrides.values().map(BTreeMap::len).sum()
    }

    /// Removes one base entry.
    pub fn unregister(&mut self, context: &str, name: &str) -> bool {
        let Some(commands) = self.base.get_mut(context) else {
            return false;
        };
        let removed = commands.remove(name).is_some();
        if commands.is_empty() {
            self.base.remove(context);
        }
        removed
    }

    /// Removes every base entry registered by `owner`.
    pub fn unregister_owned_by(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        for commands in self.base.values_mut() {
            let before = commands.len();
            commands.retain(|_, entry| entry.owner.as_deref() != Some(owner));
            removed += before - commands.len();
        }
        self.base.retain(|_, commands| !commands.is_empty());
        removed
    }

    /// Whether `(context, name)` has an effective entry.
    pub fn contains(&self, context: &str, name: &str) -> bool {
        self.lookup(context, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.base.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    /// Sorted names with an effective entry in `context`.
    pub fn list_commands(&self, context: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .base
            .get(context)
            .into_iter()
            .chain(self.overrides.get(context))
            .flat_map(|commands| commands.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Visible commands across all contexts, for palettes.
    pub fn visible_commands(&self) -> Vec<CommandSummary> {
        let mut contexts: Vec<&String> = self.base.keys().chain(self.overrides.keys()).collect();
        contexts.sort_unstable();
        contexts.dedup();

        let mut summaries = Vec::new();
        for context in contexts {
            for name in self.list_commands(context) {
                if let Some(entry) = self.lookup(context, name) {
                    if entry.options.visible_in_ui {
                        summaries.push(CommandSummary {
                            context: context.clone(),
                            name: name.to_string(),
                            label: entry.options.label.clone(),
                        });
                    }
                }
            }
        }
        summaries
    }

    fn lookup(&self, context: &str, name: &str) -> Option<&CommandEntry> {
        self.overrides
            .get(context)
            .and_then(|commands| commands.get(name))
            .or_else(|| self.base.get(context).and_then(|commands| commands.get(name)))
    }

    /// Resolves `name` through the explicit context and the stack.
    pub fn resolve(
        &self,
        stack: &ContextStack,
        name: &str,
        explicit_context: Option<&str>,
    ) -> Result<ResolvedCommand, CommandError> {
        let chain = stack.resolution_chain(explicit_context);
        let found = chain
            .iter()
            .find_map(|context| self.lookup(context, name).map(|entry| (*context, entry)));

        let Some((context, entry)) = found else {
            return Err(CommandError::CommandNotFound {
                name: name.to_string(),
                searched: chain.iter().map(|context| context.to_string()).collect(),
            });
        };

        if let Some(required) = entry.options.required_context.as_deref() {
            if !chain.contains(&required) {
                return Err(CommandError::ContextNotActive {
                    name: name.to_string(),
                    required: required.to_string(),
                });
            }
        }

        Ok(ResolvedCommand {
            context: context.to_string(),
            handler: Rc::clone(&entry.handler),
            options: entry.options.clone(),
        })
    }

    /// Resolves and executes `name`.
    ///
    /// Handler errors and panics are returned as [`CommandError::Execution`]
    /// carrying the resolved context.
    pub fn run(
        &self,
        stack: &ContextStack,
        name: &str,
        args: &Value,
        explicit_context: Option<&str>,
    ) -> Result<Value, CommandError> {
        let resolved = self.resolve(stack, name, explicit_context)?;
        let call = CommandCall {
            name,
            context: resolved.context.as_str(),
            args,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (resolved.handler)(&call)));
        let cause: BoxError = match outcome {
            Ok(Ok(value)) => {
                debug!(
                    "event=command_run module=commands status=ok context={} name={}",
                    resolved.context, name
                );
                return Ok(value);
            }
            Ok(Err(cause)) => cause,
            Err(payload) => Box::new(HandlerPanic(panic_payload_text(payload.as_ref()))),
        };

        error!(
            "event=command_run module=commands status=error context={} name={} error={}",
            resolved.context, name, cause
        );
        Err(CommandError::Execution {
            name: name.to_string(),
            context: resolved.context,
            cause,
        })
    }
}

fn panic_payload_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
