//! Extension descriptor declaration and validation.

use crate::extension::capability::ExtensionCapability;
use crate::extension::provider::{
    CommandsProvider, CustomizationProvider, DataSourcesProvider, FactoryContext, FnProvider,
    HotkeysProvider, ServicesProvider,
};
use crate::extension::version::{Version, VersionReq};
use crate::runtime::commands::CommandDefinition;
use crate::runtime::customizations::Customization;
use crate::runtime::data_sources::DataSourceDefinition;
use crate::runtime::hotkeys::HotkeyBinding;
use crate::runtime::services::ServiceRegistration;
use crate::BoxError;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

/// Declared dependency on another extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDependency {
    pub id: String,
    /// Optional npm-style range, e.g. `^3.0.0`.
    pub version_req: Option<String>,
}

impl ExtensionDependency {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version_req: None,
        }
    }

    pub fn with_version_req(mut self, version_req: impl Into<String>) -> Self {
        self.version_req = Some(version_req.into());
        self
    }

    /// Parsed requirement; `None` when the dependency accepts any version.
    pub fn requirement(&self) -> Result<Option<VersionReq>, ManifestValidationError> {
        match self.version_req.as_deref() {
            None => Ok(None),
            Some(raw) => VersionReq::parse(raw).map(Some).map_err(|_| {
                ManifestValidationError::InvalidVersionReq {
                    dependency: self.id.clone(),
                    requirement: raw.to_string(),
                }
            }),
        }
    }
}

/// Extension declaration handed to the loader.
///
/// Providers are shared (`Rc`) so one descriptor can back several
/// application instances.
#[derive(Clone)]
pub struct ExtensionDescriptor {
    /// Stable extension identifier, e.g. `@viewer/extension-cornerstone`.
    pub id: String,
    /// Semantic version string (`major.minor.patch`).
    pub version: String,
    pub dependencies: Vec<ExtensionDependency>,
    services: Option<Rc<dyn ServicesProvider>>,
    commands: Option<Rc<dyn CommandsProvider>>,
    hotkeys: Option<Rc<dyn HotkeysProvider>>,
    data_sources: Option<Rc<dyn DataSourcesProvider>>,
    customizations: Option<Rc<dyn CustomizationProvider>>,
}

impl ExtensionDescriptor {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            dependencies: Vec::new(),
            services: None,
            commands: None,
            hotkeys: None,
            data_sources: None,
            customizations: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(ExtensionDependency::new(id));
        self
    }

    pub fn depends_on_version(
        mut self,
        id: impl Into<String>,
        version_req: impl Into<String>,
    ) -> Self {
        self.dependencies
            .push(ExtensionDependency::new(id).with_version_req(version_req));
        self
    }

    pub fn with_services(mut self, provider: Rc<dyn ServicesProvider>) -> Self {
        self.services = Some(provider);
        self
    }

    pub fn with_commands(mut self, provider: Rc<dyn CommandsProvider>) -> Self {
        self.commands = Some(provider);
        self
    }

    pub fn with_hotkeys(mut self, provider: Rc<dyn HotkeysProvider>) -> Self {
        self.hotkeys = Some(provider);
        self
    }

    pub fn with_data_sources(mut self, provider: Rc<dyn DataSourcesProvider>) -> Self {
        self.data_sources = Some(provider);
        self
    }

    pub fn with_customizations(mut self, provider: Rc<dyn CustomizationProvider>) -> Self {
        self.customizations = Some(provider);
        self
    }

    pub fn with_services_fn<F>(self, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Vec<ServiceRegistration>, BoxError> + 'static,
    {
        self.with_services(Rc::new(FnProvider(factory)))
    }

    pub fn with_commands_fn<F>(self, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Vec<CommandDefinition>, BoxError> + 'static,
    {
        self.with_commands(Rc::new(FnProvider(factory)))
    }

    pub fn with_hotkeys_fn<F>(self, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Vec<HotkeyBinding>, BoxError> + 'static,
    {
        self.with_hotkeys(Rc::new(FnProvider(factory)))
    }

    pub fn with_data_sources_fn<F>(self, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Vec<DataSourceDefinition>, BoxError> + 'static,
    {
        self.with_data_sources(Rc::new(FnProvider(factory)))
    }

    pub fn with_customizations_fn<F>(self, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Vec<Customization>, BoxError> + 'static,
    {
        self.with_customizations(Rc::new(FnProvider(factory)))
    }

    pub fn services_provider(&self) -> Option<&Rc<dyn ServicesProvider>> {
        self.services.as_ref()
    }

    pub fn commands_provider(&self) -> Option<&Rc<dyn CommandsProvider>> {
        self.commands.as_ref()
    }

    pub fn hotkeys_provider(&self) -> Option<&Rc<dyn HotkeysProvider>> {
        self.hotkeys.as_ref()
    }

    pub fn data_sources_provider(&self) -> Option<&Rc<dyn DataSourcesProvider>> {
        self.data_sources.as_ref()
    }

    pub fn customization_provider(&self) -> Option<&Rc<dyn CustomizationProvider>> {
        self.customizations.as_ref()
    }

    /// Declared capabilities in factory order.
    pub fn capabilities(&self) -> Vec<ExtensionCapability> {
        ExtensionCapability::FACTORY_ORDER
            .into_iter()
            .filter(|capability| self.has_capability(*capability))
            .collect()
    }

    pub fn has_capability(&self, capability: ExtensionCapability) -> bool {
        match capability {
            ExtensionCapability::Services => self.services.is_some(),
            ExtensionCapability::Commands => self.commands.is_some(),
            ExtensionCapability::Hotkeys => self.hotkeys.is_some(),
            ExtensionCapability::DataSources => self.data_sources.is_some(),
            ExtensionCapability::Customizations => self.customizations.is_some(),
        }
    }

    /// Parsed version. Call after [`Self::validate`].
    pub fn parsed_version(&self) -> Result<Version, ManifestValidationError> {
        Version::parse(&self.version)
            .map_err(|_| ManifestValidationError::InvalidVersion(self.version.clone()))
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), ManifestValidationError> {
        let id = self.id.as_str();
        if id.trim().is_empty() {
            return Err(ManifestValidationError::EmptyId);
        }
        if !is_valid_extension_id(id) {
            return Err(ManifestValidationError::InvalidId(self.id.clone()));
        }

        if self.version.trim().is_empty() {
            return Err(ManifestValidationError::EmptyVersion);
        }
        self.parsed_version()?;

        let mut dedup = BTreeSet::<&str>::new();
        for dependency in &self.dependencies {
            let dependency_id = dependency.id.as_str();
            if !is_valid_extension_id(dependency_id) {
                return Err(ManifestValidationError::InvalidDependencyId(
                    dependency.id.clone(),
                ));
            }
            if dependency_id == id {
                return Err(ManifestValidationError::SelfDependency(id.to_string()));
            }
            if !dedup.insert(dependency_id) {
                return Err(ManifestValidationError::DuplicateDependency(
                    dependency_id.to_string(),
                ));
            }
            dependency.requirement()?;
        }
        Ok(())
    }
}

impl Debug for ExtensionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionDescriptor")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Lowercase `[a-z0-9]` segments joined by single `.`, `_`, `-` or `/`,
/// with an optional leading `@` for scoped package names.
pub(crate) fn is_valid_extension_id(value: &str) -> bool {
    let value = value.strip_prefix('@').unwrap_or(value);
    let mut chars = value.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_separator = false;
            continue;
        }
        if matches!(c, '.' | '_' | '-' | '/') {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}

/// Descriptor validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestValidationError {
    EmptyId,
    InvalidId(String),
    EmptyVersion,
    InvalidVersion(String),
    InvalidDependencyId(String),
    SelfDependency(String),
    DuplicateDependency(String),
    InvalidVersionReq {
        dependency: String,
        requirement: String,
    },
}

impl Display for ManifestValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "extension id must not be empty"),
            Self::InvalidId(value) => write!(f, "extension id is invalid: {value}"),
            Self::EmptyVersion => write!(f, "extension version must not be empty"),
            Self::InvalidVersion(value) => write!(
                f,
                "extension version is invalid: {value} (expected major.minor.patch)"
            ),
            Self::InvalidDependencyId(value) => {
                write!(f, "dependency id is invalid: {value}")
            }
            Self::SelfDependency(value) => write!(f, "extension depends on itself: {value}"),
            Self::DuplicateDependency(value) => {
                write!(f, "dependency is declared twice: {value}")
            }
            Self::InvalidVersionReq {
                dependency,
                requirement,
            } => write!(
                f,
                "version requirement `{requirement}` for dependency `{dependency}` is invalid"
            ),
        }
    }
}

impl Error for ManifestValidationError {}

#[cfg(test)]
mod tests {
    use super::{ExtensionDescriptor, ManifestValidationError};
    use crate::extension::capability::ExtensionCapability;
    use crate::runtime::commands::CommandDefinition;
    use serde_json::Value;

    fn valid_descriptor() -> ExtensionDescriptor {
        ExtensionDescriptor::new("@viewer/extension-cornerstone", "3.7.0")
            .depends_on_version("@viewer/extension-default", "^3.0.0")
            .with_commands_fn(|_| {
                Ok(vec![CommandDefinition::new("zoomIn", |_| Ok(Value::Null))])
            })
    }

    #[test]
    fn validates_baseline_descriptor() {
        let descriptor = valid_descriptor();
        assert!(descriptor.validate().is_ok());
        assert_eq!(
            descriptor.capabilities(),
            vec![ExtensionCapability::Commands]
        );
    }

    #[test]
    fn rejects_invalid_id_format() {
        let mut descriptor = valid_descriptor();
        descriptor.id = "Viewer Cornerstone".to_string();
        let err = descriptor.validate().expect_err("uppercase id must fail");
        assert!(matches!(err, ManifestValidationError::InvalidId(_)));

        descriptor.id = "viewer//cornerstone".to_string();
        let err = descriptor.validate().expect_err("double separator must fail");
        assert!(matches!(err, ManifestValidationError::InvalidId(_)));
    }

    #[test]
    fn rejects_invalid_version_format() {
        let mut descriptor = valid_descriptor();
        descriptor.version = "v3".to_string();
        let err = descriptor.validate().expect_err("non-triplet must fail");
        assert!(matches!(err, ManifestValidationError::InvalidVersion(_)));
    }

    #[test]
    fn rejects_self_and_duplicate_dependencies() {
        let descriptor = ExtensionDescriptor::new("ext.a", "1.0.0").depends_on("ext.a");
        assert_eq!(
            descriptor.validate(),
            Err(ManifestValidationError::SelfDependency("ext.a".to_string()))
        );

        let descriptor = ExtensionDescriptor::new("ext.a", "1.0.0")
            .depends_on("ext.b")
            .depends_on("ext.b");
        assert_eq!(
            descriptor.validate(),
            Err(ManifestValidationError::DuplicateDependency(
                "ext.b".to_string()
            ))
        );
    }

    #[test]
    fn rejects_malformed_version_requirement() {
        let descriptor =
            ExtensionDescriptor::new("ext.a", "1.0.0").depends_on_version("ext.b", "newest");
        assert!(matches!(
            descriptor.validate(),
            Err(ManifestValidationError::InvalidVersionReq { .. })
        ));
    }

    #[test]
    fn ids_with_surrounding_whitespace_are_rejected() {
        let descriptor = ExtensionDescriptor::new(" ext.a", "1.0.0");
        assert!(matches!(
            descriptor.validate(),
            Err(ManifestValidationError::InvalidId(_))
        ));

        let descriptor = ExtensionDescriptor::new("ext.a", "1.0.0").depends_on("ext.b ");
        assert_eq!(
            descriptor.validate(),
            Err(ManifestValidationError::InvalidDependencyId(
                "ext.b ".to_string()
            ))
        );
    }

    #[test]
    fn overflowing_requirement_bound_is_rejected() {
        let descriptor = ExtensionDescriptor::new("ext.a", "1.0.0")
            .depends_on_version("ext.b", "~18446744073709551615");
        assert!(matches!(
            descriptor.validate(),
            Err(ManifestValidationError::InvalidVersionReq { .. })
        ));
    }
}
