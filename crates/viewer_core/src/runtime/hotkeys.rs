//! Hotkey bindings scoped by context.
//!
//! # Responsibility
//! - Normalize key combinations into one canonical spelling.
//! - Map `(context, combo)` to a command name and its arguments.
//!
//! # Invariants
//! - At most one effective binding per `(context, combo)`; the last bind
//!   wins and is reported as [`BindOutcome::Rebound`].
//! - Unbinding an owner uncovers the binding it shadowed.
//! - Command names are not validated at bind time; an unresolvable command
//!   surfaces as `CommandNotFound` when the key is pressed.

use crate::runtime::context_stack::{ContextStack, GLOBAL_CONTEXT};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

const MODIFIER_ORDER: [&str; 4] = ["ctrl", "alt", "shift", "meta"];

/// Hotkey declaration as found in extension modules and boot config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotkeyBinding {
    pub command_name: String,
    /// Arguments passed to the command on key press.
    #[serde(default)]
    pub command_options: Value,
    #[serde(default = "default_context")]
    pub context: String,
    /// Alternative key combinations that trigger the command.
    pub keys: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Whether users may remap this binding.
    #[serde(default)]
    pub is_editable: bool,
}

fn default_context() -> String {
    GLOBAL_CONTEXT.to_string()
}

impl HotkeyBinding {
    pub fn new(command_name: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            command_name: command_name.into(),
            command_options: Value::Null,
            context: default_context(),
            keys: keys.iter().map(|key| key.to_string()).collect(),
            label: None,
            is_editable: false,
        }
    }

    pub fn in_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.command_options = args;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns a copy with every key combination normalized.
    pub fn normalized(&self) -> Result<Self, HotkeyError> {
        if self.keys.is_empty() {
            return Err(HotkeyError::NoKeys(self.command_name.clone()));
        }
        let keys = self
            .keys
            .iter()
            .map(|key| normalize_key_combo(key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keys,
            ..self.clone()
        })
    }
}

/// Outcome of one bind call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The pair was already bound; `previous` was the command it invoked.
    Rebound { previous: String },
}

/// Binding that matched a key press.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHotkey {
    pub context: String,
    pub combo: String,
    pub command_name: String,
    pub args: Value,
}

/// Hotkey parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotkeyError {
    EmptyCombo,
    EmptyKey(String),
    DuplicateModifier(String),
    MissingKey(String),
    MultipleKeys(String),
    NoKeys(String),
}

impl Display for HotkeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCombo => write!(f, "key combination must not be empty"),
            Self::EmptyKey(combo) => write!(f, "key combination has an empty segment: {combo}"),
            Self::DuplicateModifier(combo) => {
                write!(f, "key combination repeats a modifier: {combo}")
            }
            Self::MissingKey(combo) => {
                write!(f, "key combination has only modifiers: {combo}")
            }
            Self::MultipleKeys(combo) => {
                write!(f, "key combination has more than one non-modifier key: {combo}")
            }
            Self::NoKeys(command) => write!(f, "hotkey for `{command}` declares no keys"),
        }
    }
}

impl Error for HotkeyError {}

/// Normalizes a `+`-separated key combination.
///
/// Segments are trimmed and lowercased, modifier aliases are folded
/// (`control` to `ctrl`, `option` to `alt`, `cmd`/`command`/`super` to
/// `meta`) and modifiers are emitted in `ctrl+alt+shift+meta` order.
pub fn normalize_key_combo(raw: &str) -> Result<String, HotkeyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(HotkeyError::EmptyCombo);
    }

    let mut modifiers = [false; 4];
    let mut key: Option<String> = None;
    for segment in trimmed.split('+') {
        let segment = segment.trim().to_ascii_lowercase();
        if segment.is_empty() {
            return Err(HotkeyError::EmptyKey(trimmed.to_string()));
        }
        let modifier = match segment.as_str() {
            "ctrl" | "control" => Some(0),
            "alt" | "option" => Some(1),
            "shift" => Some(2),
            "meta" | "cmd" | "command" | "super" => Some(3),
            _ => None,
        };
        match modifier {
            Some(slot) if modifiers[slot] => {
                return Err(HotkeyError::DuplicateModifier(trimmed.to_string()));
            }
            Some(slot) => modifiers[slot] = true,
            None if key.is_some() => {
                return Err(HotkeyError::MultipleKeys(trimmed.to_string()));
            }
            None => key = Some(segment),
        }
    }

    let key = key.ok_or_else(|| HotkeyError::MissingKey(trimmed.to_string()))?;
    let mut parts: Vec<&str> = MODIFIER_ORDER
        .iter()
        .zip(modifiers)
        .filter(|(_, present)| *present)
        .map(|(name, _)| *name)
        .collect();
    parts.push(key.as_str());
    Ok(parts.join("+"))
}

#[derive(Debug, Clone)]
struct HotkeyEntry {
    command_name: String,
    args: Value,
    label: Option<String>,
    is_editable: bool,
    owner: Option<String>,
}

type HotkeyKey = (String, String);

type HotkeyTable = BTreeMap<HotkeyKey, HotkeyEntry>;

/// Bindings of one `(context, combo)`, oldest first; the last one is
/// effective. Each owner holds at most one layer.
type LayeredTable = BTreeMap<HotkeyKey, Vec<HotkeyEntry>>;

/// Effective binding listed for help panels.
#[derive(Debug, Clone, PartialEq)]
pub struct HotkeyListing {
    pub context: String,
    pub combo: String,
    pub command_name: String,
    pub label: Option<String>,
    pub is_editable: bool,
}

/// `(context, combo)` keyed binding store.
#[derive(Debug, Default)]
pub struct HotkeyRegistry {
    base: LayeredTable,
    overrides: HotkeyTable,
}

impl HotkeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `combo` in `context` to `command_name`.
    pub fn bind(
        &mut self,
        context: &str,
        combo: &str,
        command_name: &str,
    ) -> Result<BindOutcome, HotkeyError> {
        let binding = HotkeyBinding::new(command_name, &[combo]).in_context(context);
        let mut outcomes = self.bind_binding(&binding, None)?;
        Ok(outcomes.pop().unwrap_or(BindOutcome::Bound))
    }

    /// Binds every key of `binding` on behalf of `owner`.
    ///
    /// All keys are validated before any of them is inserted. A binding from
    /// another owner is shadowed, not dropped, and comes back when this
    /// owner's bindings are removed.
    pub fn bind_binding(
        &mut self,
        binding: &HotkeyBinding,
        owner: Option<&str>,
    ) -> Result<Vec<BindOutcome>, HotkeyError> {
        let normalized = binding.normalized()?;
        let mut outcomes = Vec::with_capacity(normalized.keys.len());
        for combo in &normalized.keys {
            let entry = HotkeyEntry {
                command_name: normalized.command_name.clone(),
                args: normalized.command_options.clone(),
                label: normalized.label.clone(),
                is_editable: normalized.is_editable,
                owner: owner.map(str::to_string),
            };
            let key = (normalized.context.clone(), combo.clone());
            let layers = self.base.entry(key).or_default();
            let previous = layers.last().map(|top| top.command_name.clone());
            layers.retain(|layer| layer.owner != entry.owner);
            layers.push(entry);
            let outcome = match previous {
                Some(previous) => {
                    warn!(
                        "event=hotkey_conflict module=hotkeys status=warn context={} combo={} previous={} command={}",
                        normalized.context, combo, previous, normalized.command_name
                    );
                    BindOutcome::Rebound { previous }
                }
                None => {
                    debug!(
                        "event=hotkey_bound module=hotkeys status=ok context={} combo={} command={}",
                        normalized.context, combo, normalized.command_name
                    );
                    BindOutcome::Bound
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Installs a mode-scoped binding that shadows the base layer.
    pub fn install_override(&mut self, binding: &HotkeyBinding) -> Result<(), HotkeyError> {
        let normalized = binding.normalized()?;
        for combo in &normalized.keys {
            self.overrides.insert(
                (normalized.context.clone(), combo.clone()),
                HotkeyEntry {
                    command_name: normalized.command_name.clone(),
                    args: normalized.command_options.clone(),
                    label: normalized.label.clone(),
                    is_editable: normalized.is_editable,
                    owner: None,
                },
            );
        }
        Ok(())
    }

    pub fn clear_overrides(&mut self) -> usize {
        let count = self.overrides.len();
        self.overrides.clear();
        count
    }

    fn lookup(&self, context: &str, combo: &str) -> Option<&HotkeyEntry> {
        let key = (context.to_string(), combo.to_string());
        self.overrides
            .get(&key)
            .or_else(|| self.base.get(&key).and_then(|layers| layers.last()))
    }

    /// Command bound to `combo` in exactly `context`.
    pub fn resolve(&self, context: &str, combo: &str) -> Option<&str> {
        let combo = normalize_key_combo(combo).ok()?;
        self.lookup(context, &combo)
            .map(|entry| entry.command_name.as_str())
    }

    /// Binding for `combo`, searching the stack top-down then the global context.
    pub fn resolve_in_stack(&self, stack: &ContextStack, combo: &str) -> Option<ResolvedHotkey> {
        let combo = normalize_key_combo(combo).ok()?;
        stack.resolution_chain(None).into_iter().find_map(|context| {
            self.lookup(context, &combo).map(|entry| ResolvedHotkey {
                context: context.to_string(),
                combo: combo.clone(),
                command_name: entry.command_name.clone(),
                args: entry.args.clone(),
            })
        })
    }

    /// Removes every base binding of `context`.
    pub fn unbind_all(&mut self, context: &str) -> usize {
        let before = self.base.len();
        self.base.retain(|(bound_context, _), _| bound_context != context);
        before - self.base.len()
    }

    /// Removes every base binding contributed by `owner`, uncovering any
    /// binding it shadowed.
    pub fn unbind_owned_by(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        self.base.retain(|_, layers| {
            let before = layers.len();
            layers.retain(|layer| layer.owner.as_deref() != Some(owner));
            removed += before - layers.len();
            !layers.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    /// Effective bindings (overrides applied), sorted by context then combo.
    pub fn bindings(&self) -> Vec<HotkeyListing> {
        let mut merged: BTreeMap<&HotkeyKey, &HotkeyEntry> = self
            .base
            .iter()
            .filter_map(|(key, layers)| layers.last().map(|top| (key, top)))
            .collect();
        merged.extend(self.overrides.iter());
        merged
            .into_iter()
            .map(|((context, combo), entry)| HotkeyListing {
                context: context.clone(),
                combo: combo.clone(),
                command_name: entry.command_name.clone(),
                label: entry.label.clone(),
                is_editable: entry.is_editable,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_key_combo, BindOutcome, HotkeyBinding, HotkeyError, HotkeyRegistry};
    use crate::runtime::context_stack::ContextStack;
    use serde_json::json;

    #[test]
    fn normalizes_case_aliases_and_modifier_order() {
        assert_eq!(normalize_key_combo("Z").expect("single key"), "z");
        assert_eq!(
            normalize_key_combo(" Shift + Control + z ").expect("modifiers"),
            "ctrl+shift+z"
        );
        assert_eq!(
            normalize_key_combo("cmd+option+ArrowUp").expect("aliases"),
            "alt+meta+arrowup"
        );
    }

    #[test]
    fn rejects_malformed_combos() {
        assert_eq!(normalize_key_combo("  "), Err(HotkeyError::EmptyCombo));
        assert!(matches!(
            normalize_key_combo("ctrl++z"),
            Err(HotkeyError::EmptyKey(_))
        ));
        assert!(matches!(
            normalize_key_combo("ctrl+control+z"),
            Err(HotkeyError::DuplicateModifier(_))
        ));
        assert!(matches!(
            normalize_key_combo("ctrl+shift"),
            Err(HotkeyError::MissingKey(_))
        ));
        assert!(matches!(
            normalize_key_combo("a+b"),
            Err(HotkeyError::MultipleKeys(_))
        ));
    }

    #[test]
    fn rebinding_same_pair_is_last_write_wins_with_conflict() {
        let mut registry = HotkeyRegistry::new();
        let first = registry
            .bind("viewer", "ctrl+z", "undo")
            .expect("first bind");
        let second = registry
            .bind("viewer", "Ctrl+Z", "redo")
            .expect("second bind");

        assert_eq!(first, BindOutcome::Bound);
        assert_eq!(
            second,
            BindOutcome::Rebound {
                previous: "undo".to_string()
            }
        );
        assert_eq!(registry.resolve("viewer", "ctrl+z"), Some("redo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_is_scoped_to_context() {
        let mut registry = HotkeyRegistry::new();
        registry
            .bind("viewer", "ctrl+z", "undo")
            .expect("bind viewer");
        assert_eq!(registry.resolve("worklist", "ctrl+z"), None);
        assert_eq!(registry.resolve("viewer", "not a+combo+x"), None);
    }

    #[test]
    fn resolve_in_stack_walks_down_to_global() {
        let mut registry = HotkeyRegistry::new();
        registry
            .bind_binding(
                &HotkeyBinding::new("showHelp", &["?"]).with_args(json!({ "panel": "keys" })),
                None,
            )
            .expect("global bind");
        registry
            .bind("viewer", "r", "rotate")
            .expect("viewer bind");

        let mut stack = ContextStack::new();
        stack.push("viewer");
        stack.push("measurement");

        let rotate = registry
            .resolve_in_stack(&stack, "R")
            .expect("rotate reachable");
        assert_eq!(rotate.context, "viewer");
        assert_eq!(rotate.command_name, "rotate");

        let help = registry
            .resolve_in_stack(&stack, "?")
            .expect("global binding reachable");
        assert_eq!(help.args, json!({ "panel": "keys" }));
    }

    #[test]
    fn bind_binding_validates_all_keys_before_inserting() {
        let mut registry = HotkeyRegistry::new();
        let binding = HotkeyBinding::new("undo", &["ctrl+z", "ctrl+"]).in_context("viewer");
        registry
            .bind_binding(&binding, None)
            .expect_err("second key is malformed");
        assert!(registry.is_empty());
    }

    #[test]
    fn unbind_all_and_owned_by() {
        let mut registry = HotkeyRegistry::new();
        registry
            .bind_binding(
                &HotkeyBinding::new("undo", &["ctrl+z"]).in_context("viewer"),
                Some("ext.a"),
            )
            .expect("bind a");
        registry
            .bind_binding(
                &HotkeyBinding::new("next", &["down"]).in_context("viewer"),
                Some("ext.b"),
            )
            .expect("bind b");
        registry
            .bind("worklist", "enter", "open")
            .expect("bind worklist");

        assert_eq!(registry.unbind_owned_by("ext.a"), 1);
        assert_eq!(registry.unbind_all("viewer"), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("worklist", "enter"), Some("open"));
    }

    #[test]
    fn unbinding_an_owner_restores_the_binding_it_shadowed() {
        let mut registry = HotkeyRegistry::new();
        registry.bind("DEFAULT", "ctrl+s", "save").expect("app binding");
        let outcomes = registry
            .bind_binding(&HotkeyBinding::new("export", &["ctrl+s"]), Some("ext.a"))
            .expect("extension binding");
        assert_eq!(
            outcomes,
            vec![BindOutcome::Rebound {
                previous: "save".to_string()
            }]
        );
        assert_eq!(registry.resolve("DEFAULT", "ctrl+s"), Some("export"));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.unbind_owned_by("ext.a"), 1);
        assert_eq!(registry.resolve("DEFAULT", "ctrl+s"), Some("save"));
        assert_eq!(registry.unbind_owned_by("ext.a"), 0);
    }

    #[test]
    fn overrides_shadow_and_clear() {
        let mut registry = HotkeyRegistry::new();
        registry
            .bind("viewer", "ctrl+z", "undo")
            .expect("base bind");
        registry
            .install_override(&HotkeyBinding::new("undoSegment", &["ctrl+z"]).in_context("viewer"))
            .expect("override");

        assert_eq!(registry.resolve("viewer", "ctrl+z"), Some("undoSegment"));
        assert_eq!(registry.bindings().len(), 1);
        assert_eq!(registry.clear_overrides(), 1);
        assert_eq!(registry.resolve("viewer", "ctrl+z"), Some("undo"));
    }

    #[test]
    fn binding_deserializes_with_defaults() {
        let binding: HotkeyBinding = serde_json::from_value(json!({
            "commandName": "invertViewport",
            "keys": ["i"],
            "label": "Invert"
        }))
        .expect("binding json");
        assert_eq!(binding.context, "DEFAULT");
        assert!(!binding.is_editable);
        assert!(binding.command_options.is_null());
    }
}
