//! Core runtime for the imaging viewer shell.
//! This crate owns extension loading, mode composition and command dispatch.

pub mod app;
pub mod config;
pub mod extension;
pub mod logging;
pub mod mode;
pub mod runtime;

pub use app::{
    ActiveModeHandle, Application, BootConfig, BootError, BootIssue, ErrorHandler, ModeListing,
};
pub use config::{AppConfig, ConfigError, LoggingConfig, MaxNumRequests};
pub use extension::capability::ExtensionCapability;
pub use extension::graph::GraphError;
pub use extension::loader::{
    CancellationToken, ExtensionError, ExtensionLoader, LoadFailure, LoadedExtension,
    LoadedExtensionSet, SkipReason, SkippedExtension, VersionPolicy,
};
pub use extension::manifest::{ExtensionDependency, ExtensionDescriptor, ManifestValidationError};
pub use extension::provider::{
    CommandsProvider, CustomizationProvider, DataSourcesProvider, FactoryContext,
    HotkeysProvider, ServicesProvider,
};
pub use extension::version::{Version, VersionError, VersionReq};
pub use logging::{
    default_log_level, init_from_config, init_logging, logging_status, LoggingError, LoggingStatus,
};
pub use mode::composer::{ActiveMode, ModeComposer, ModeError};
pub use mode::descriptor::{ModeDescriptor, ModeValidationError};
pub use runtime::commands::{
    CommandCall, CommandDefinition, CommandError, CommandOptions, CommandRegistry,
};
pub use runtime::context_stack::{ContextStack, GLOBAL_CONTEXT};
pub use runtime::customizations::{Customization, CustomizationRegistry, CustomizationScope};
pub use runtime::data_sources::{
    DataRecord, DataSourceAdapter, DataSourceConfig, DataSourceDefinition, DataSourceError,
    DataSourceRegistry, DataStream,
};
pub use runtime::hotkeys::{
    normalize_key_combo, BindOutcome, HotkeyBinding, HotkeyError, HotkeyRegistry,
    ResolvedHotkey,
};
pub use runtime::services::{
    DisposeFailure, DisposeFailures, ServiceError, ServiceHooks, ServiceInstance,
    ServiceRegistration, ServiceRegistry,
};
pub use runtime::{RegisterOutcome, RuntimeContext};

/// Opaque failure raised by extension-supplied code (factories, hooks, handlers).
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
