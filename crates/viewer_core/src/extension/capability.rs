//! Contribution capabilities an extension may provide.

use std::error::Error;
use std::fmt::{Display, Formatter};

/// One contribution module an extension may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionCapability {
    Services,
    Commands,
    Hotkeys,
    DataSources,
    Customizations,
}

/// Manifest string value for the services module.
pub const CAPABILITY_SERVICES: &str = "servicesModule";
/// Manifest string value for the commands module.
pub const CAPABILITY_COMMANDS: &str = "commandsModule";
/// Manifest string value for the hotkeys module.
pub const CAPABILITY_HOTKEYS: &str = "hotkeysModule";
/// Manifest string value for the data sources module.
pub const CAPABILITY_DATA_SOURCES: &str = "dataSourcesModule";
/// Manifest string value for the customization module.
pub const CAPABILITY_CUSTOMIZATIONS: &str = "customizationModule";

impl ExtensionCapability {
    /// Factory invocation order used by the loader.
    pub const FACTORY_ORDER: [ExtensionCapability; 5] = [
        Self::Services,
        Self::Commands,
        Self::Hotkeys,
        Self::DataSources,
        Self::Customizations,
    ];

    /// Stable module name used in logs and namespaces.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Services => CAPABILITY_SERVICES,
            Self::Commands => CAPABILITY_COMMANDS,
            Self::Hotkeys => CAPABILITY_HOTKEYS,
            Self::DataSources => CAPABILITY_DATA_SOURCES,
            Self::Customizations => CAPABILITY_CUSTOMIZATIONS,
        }
    }

    /// User-facing short description.
    pub fn description(self) -> &'static str {
        match self {
            Self::Services => "Registers shared named services.",
            Self::Commands => "Registers context-scoped command handlers.",
            Self::Hotkeys => "Binds key combinations to commands.",
            Self::DataSources => "Defines data-source adapters for image archives.",
            Self::Customizations => "Contributes default customization values.",
        }
    }

    /// Parses one capability from its module name.
    pub fn parse(value: &str) -> Result<Self, CapabilityParseError> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(CapabilityParseError::Empty);
        }
        Self::FACTORY_ORDER
            .into_iter()
            .find(|capability| capability.as_str() == normalized)
            .ok_or_else(|| CapabilityParseError::Unsupported(normalized.to_string()))
    }
}

impl Display for ExtensionCapability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityParseError {
    Empty,
    Unsupported(String),
}

impl Display for CapabilityParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "capability value must not be empty"),
            Self::Unsupported(value) => write!(f, "capability is unsupported: {value}"),
        }
    }
}

impl Error for CapabilityParseError {}
