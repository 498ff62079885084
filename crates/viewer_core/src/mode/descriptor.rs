//! Mode descriptor declaration and validation.

use crate::extension::manifest::is_valid_extension_id;
use crate::runtime::commands::CommandDefinition;
use crate::runtime::customizations::Customization;
use crate::runtime::hotkeys::{HotkeyBinding, HotkeyError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Workflow preset selecting extensions and mode-scoped overrides.
#[derive(Debug, Clone)]
pub struct ModeDescriptor {
    /// Stable mode identifier, e.g. `viewer` or `segmentation`.
    pub id: String,
    /// Route segment the mode is served under.
    pub route: String,
    pub display_name: String,
    /// Extension ids in declaration order.
    pub extensions: Vec<String>,
    /// Opaque layout handed to the UI layer.
    pub layout: Value,
    pub command_overrides: Vec<CommandDefinition>,
    pub hotkey_overrides: Vec<HotkeyBinding>,
    /// Installed in the mode customization scope while active.
    pub customizations: Vec<Customization>,
}

impl ModeDescriptor {
    pub fn new(id: impl Into<String>, route: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            route: route.into(),
            extensions: Vec::new(),
            layout: Value::Null,
            command_overrides: Vec::new(),
            hotkey_overrides: Vec::new(),
            customizations: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_extension(mut self, extension_id: impl Into<String>) -> Self {
        self.extensions.push(extension_id.into());
        self
    }

    pub fn with_extensions<I, S>(mut self, extension_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions
            .extend(extension_ids.into_iter().map(Into::into));
        self
    }

    pub fn with_layout(mut self, layout: Value) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_command_override(mut self, definition: CommandDefinition) -> Self {
        self.command_overrides.push(definition);
        self
    }

    pub fn with_hotkey_override(mut self, binding: HotkeyBinding) -> Self {
        self.hotkey_overrides.push(binding);
        self
    }

    pub fn with_customization(mut self, customization: Customization) -> Self {
        self.customizations.push(customization);
        self
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), ModeValidationError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ModeValidationError::EmptyId);
        }
        if !is_valid_mode_id(id) {
            return Err(ModeValidationError::InvalidId(self.id.clone()));
        }
        if !is_valid_route(self.route.trim()) {
            return Err(ModeValidationError::InvalidRoute(self.route.clone()));
        }
        if self.extensions.is_empty() {
            return Err(ModeValidationError::NoExtensions(self.id.clone()));
        }

        let mut dedup = BTreeSet::new();
        for extension in &self.extensions {
            if !is_valid_extension_id(extension.trim()) {
                return Err(ModeValidationError::InvalidExtensionId(extension.clone()));
            }
            if !dedup.insert(extension.trim()) {
                return Err(ModeValidationError::DuplicateExtension(extension.clone()));
            }
        }

        for definition in &self.command_overrides {
            if definition.name.trim().is_empty() {
                return Err(ModeValidationError::EmptyCommandOverride);
            }
        }
        for binding in &self.hotkey_overrides {
            binding
                .normalized()
                .map_err(ModeValidationError::InvalidHotkeyOverride)?;
        }
        Ok(())
    }
}

fn is_valid_mode_id(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && value
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase())
            .unwrap_or(false)
}

fn is_valid_route(value: &str) -> bool {
    !value.is_empty()
        && value
            .trim_start_matches('/')
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'))
}

/// Mode declaration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeValidationError {
    EmptyId,
    InvalidId(String),
    InvalidRoute(String),
    NoExtensions(String),
    InvalidExtensionId(String),
    DuplicateExtension(String),
    EmptyCommandOverride,
    InvalidHotkeyOverride(HotkeyError),
}

impl Display for ModeValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "mode id must not be empty"),
            Self::InvalidId(value) => write!(f, "mode id is invalid: {value}"),
            Self::InvalidRoute(value) => write!(f, "mode route is invalid: {value}"),
            Self::NoExtensions(value) => write!(f, "mode `{value}` lists no extensions"),
            Self::InvalidExtensionId(value) => {
                write!(f, "mode references invalid extension id: {value}")
            }
            Self::DuplicateExtension(value) => {
                write!(f, "mode lists extension twice: {value}")
            }
            Self::EmptyCommandOverride => write!(f, "command override name must not be empty"),
            Self::InvalidHotkeyOverride(err) => write!(f, "hotkey override is invalid: {err}"),
        }
    }
}

impl Error for ModeValidationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidHotkeyOverride(err) => Some(err),
            _ => None,
        }
    }
}
