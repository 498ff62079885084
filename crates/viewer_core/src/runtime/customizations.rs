//! Layered customization values.
//!
//! # Responsibility
//! - Store opaque customization values by id in three scopes.
//! - Answer lookups with the highest scope that defines the id.
//!
//! # Invariants
//! - Scope precedence is `Global > Mode > Default`.
//! - The mode scope only holds values of the active mode.

use crate::runtime::RegisterOutcome;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Precedence layer of a customization value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CustomizationScope {
    /// Contributed by extension customization modules.
    Default,
    /// Installed by the active mode.
    Mode,
    /// Supplied by the application configuration.
    Global,
}

impl CustomizationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Mode => "mode",
            Self::Global => "global",
        }
    }
}

/// One customization entry as contributed by an extension or mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customization {
    pub id: String,
    pub value: Value,
}

impl Customization {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

#[derive(Debug, Clone)]
struct CustomizationEntry {
    value: Value,
    owner: Option<String>,
}

#[derive(Debug, Default)]
pub struct CustomizationRegistry {
    layers: BTreeMap<CustomizationScope, BTreeMap<String, CustomizationEntry>>,
}

impl CustomizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        scope: CustomizationScope,
        customization: Customization,
        owner: Option<&str>,
    ) -> RegisterOutcome {
        let Customization { id, value } = customization;
        let layer = self.layers.entry(scope).or_default();
        let previous = layer.insert(
            id.clone(),
            CustomizationEntry {
                value,
                owner: owner.map(str::to_string),
            },
        );
        match previous {
            Some(previous) if previous.owner.as_deref() != owner => {
                warn!(
                    "event=customization_replaced module=customizations status=warn scope={} id={} previous_owner={}",
                    scope.as_str(),
                    id,
                    previous.owner.as_deref().unwrap_or("app")
                );
                RegisterOutcome::Replaced
            }
            Some(_) => RegisterOutcome::Replaced,
            None => {
                debug!(
                    "event=customization_set module=customizations status=ok scope={} id={}",
                    scope.as_str(),
                    id
                );
                RegisterOutcome::Inserted
            }
        }
    }

    /// Seeds `scope` from a JSON object; each key becomes one id.
    ///
    /// Non-object values are ignored and yield zero.
    pub fn seed_from_object(&mut self, scope: CustomizationScope, object: &Value) -> usize {
        let Some(map) = object.as_object() else {
            return 0;
        };
        for (id, value) in map {
            self.set(scope, Customization::new(id.clone(), value.clone()), None);
        }
        map.len()
    }

    /// Effective value: highest scope that defines `id`.
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.layers
            .values()
            .rev()
            .find_map(|layer| layer.get(id))
            .map(|entry| &entry.value)
    }

    pub fn get_scoped(&self, scope: CustomizationScope, id: &str) -> Option<&Value> {
        self.layers
            .get(&scope)
            .and_then(|layer| layer.get(id))
            .map(|entry| &entry.value)
    }

    /// Scope that currently provides the effective value of `id`.
    pub fn effective_scope(&self, id: &str) -> Option<CustomizationScope> {
        self.layers
            .iter()
            .rev()
            .find(|(_, layer)| layer.contains_key(id))
            .map(|(scope, _)| *scope)
    }

    pub fn clear_scope(&mut self, scope: CustomizationScope) -> usize {
        self.layers
            .remove(&scope)
            .map(|layer| layer.len())
            .unwrap_or(0)
    }

    pub fn remove_owned_by(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        for layer in self.layers.values_mut() {
            let before = layer.len();
            layer.retain(|_, entry| entry.owner.as_deref() != Some(owner));
            removed += before - layer.len();
        }
        removed
    }

    /// Sorted ids defined in any scope.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .layers
            .values()
            .flat_map(|layer| layer.keys().map(String::as_str))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
