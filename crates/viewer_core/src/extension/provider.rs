//! Contribution provider traits and the factory context.
//!
//! # Responsibility
//! - Define one narrow trait per contribution module.
//! - Give factories read access to committed registries plus the services
//!   their own extension staged earlier in the same load.
//!
//! # Invariants
//! - Factories never mutate registries; the loader commits their output.

use crate::config::AppConfig;
use crate::runtime::commands::{CommandDefinition, CommandRegistry};
use crate::runtime::customizations::Customization;
use crate::runtime::data_sources::DataSourceDefinition;
use crate::runtime::hotkeys::HotkeyBinding;
use crate::runtime::services::{ServiceError, ServiceInstance, ServiceRegistration};
use crate::runtime::RuntimeContext;
use crate::BoxError;
use futures::future::{self, LocalBoxFuture};
use serde_json::Value;
use std::any::{type_name, Any};
use std::rc::Rc;
use uuid::Uuid;

/// Future returned by every contribution factory.
pub type FactoryFuture<'a, T> = LocalBoxFuture<'a, Result<Vec<T>, BoxError>>;

/// Read-only view handed to contribution factories.
pub struct FactoryContext<'a> {
    extension_id: &'a str,
    runtime: &'a RuntimeContext,
    staged_services: &'a [ServiceRegistration],
}

impl<'a> FactoryContext<'a> {
    pub(crate) fn new(
        extension_id: &'a str,
        runtime: &'a RuntimeContext,
        staged_services: &'a [ServiceRegistration],
    ) -> Self {
        Self {
            extension_id,
            runtime,
            staged_services,
        }
    }

    /// Id of the extension whose factory is running.
    pub fn extension_id(&self) -> &str {
        self.extension_id
    }

    pub fn runtime_id(&self) -> Uuid {
        self.runtime.instance_id()
    }

    pub fn config(&self) -> &AppConfig {
        self.runtime.config()
    }

    /// Per-extension configuration block from `extensionConfig`.
    pub fn extension_config(&self) -> Option<&Value> {
        self.runtime.config().extension_config.get(self.extension_id)
    }

    /// Looks up a service, preferring this extension's staged services.
    pub fn service(&self, name: &str) -> Result<ServiceInstance, ServiceError> {
        match self
            .staged_services
            .iter()
            .rev()
            .find(|registration| registration.name == name)
        {
            Some(registration) => Ok(Rc::clone(&registration.instance)),
            None => self.runtime.services().get(name),
        }
    }

    pub fn service_as<T: Any>(&self, name: &str) -> Result<Rc<T>, ServiceError> {
        self.service(name)?
            .downcast::<T>()
            .map_err(|_| ServiceError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Committed commands, for factories that compose existing commands.
    pub fn commands(&self) -> &CommandRegistry {
        self.runtime.commands()
    }
}

pub trait ServicesProvider {
    fn services<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, ServiceRegistration>;
}

pub trait CommandsProvider {
    fn commands<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, CommandDefinition>;
}

pub trait HotkeysProvider {
    fn hotkeys<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, HotkeyBinding>;
}

pub trait DataSourcesProvider {
    fn data_sources<'a>(
        &'a self,
        ctx: &'a FactoryContext<'a>,
    ) -> FactoryFuture<'a, DataSourceDefinition>;
}

pub trait CustomizationProvider {
    fn customizations<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, Customization>;
}

/// Adapts a synchronous closure into any provider trait.
pub struct FnProvider<F>(pub F);

impl<F> ServicesProvider for FnProvider<F>
where
    F: Fn(&FactoryContext<'_>) -> Result<Vec<ServiceRegistration>, BoxError>,
{
    fn services<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, ServiceRegistration> {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

impl<F> CommandsProvider for FnProvider<F>
where
    F: Fn(&FactoryContext<'_>) -> Result<Vec<CommandDefinition>, BoxError>,
{
    fn commands<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, CommandDefinition> {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

impl<F> HotkeysProvider for FnProvider<F>
where
    F: Fn(&FactoryContext<'_>) -> Result<Vec<HotkeyBinding>, BoxError>,
{
    fn hotkeys<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, HotkeyBinding> {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

impl<F> DataSourcesProvider for FnProvider<F>
where
    F: Fn(&FactoryContext<'_>) -> Result<Vec<DataSourceDefinition>, BoxError>,
{
    fn data_sources<'a>(
        &'a self,
        ctx: &'a FactoryContext<'a>,
    ) -> FactoryFuture<'a, DataSourceDefinition> {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

impl<F> CustomizationProvider for FnProvider<F>
where
    F: Fn(&FactoryContext<'_>) -> Result<Vec<Customization>, BoxError>,
{
    fn customizations<'a>(&'a self, ctx: &'a FactoryContext<'a>) -> FactoryFuture<'a, Customization> {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::{FactoryContext, FactoryFuture, FnProvider, ServicesProvider};
    use crate::config::AppConfig;
    use crate::runtime::services::{ServiceError, ServiceRegistration};
    use crate::runtime::RuntimeContext;
    use crate::BoxError;
    use futures::executor::block_on;
    use serde_json::json;
    use std::cell::Cell;

    struct CounterServices;

    impl ServicesProvider for CounterServices {
        fn services<'a>(
            &'a self,
            ctx: &'a FactoryContext<'a>,
        ) -> FactoryFuture<'a, ServiceRegistration> {
            Box::pin(async move {
                let name = format!("{}.counter", ctx.extension_id());
                Ok(vec![ServiceRegistration::new(name, Cell::new(0_u32))])
            })
        }
    }

    #[test]
    fn staged_services_shadow_committed_ones() {
        let mut runtime = RuntimeContext::new(AppConfig::default());
        runtime
            .services_mut()
            .register(ServiceRegistration::new("toolbar", "committed".to_string()));

        let staged = vec![ServiceRegistration::new("toolbar", "staged".to_string())];
        let ctx = FactoryContext::new("ext.tools", &runtime, &staged);

        let toolbar = ctx.service_as::<String>("toolbar").expect("staged toolbar");
        assert_eq!(toolbar.as_str(), "staged");
        assert!(matches!(
            ctx.service_as::<u32>("toolbar"),
            Err(ServiceError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctx.service("missing"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn async_and_closure_providers_produce_contributions() {
        let runtime = RuntimeContext::new(AppConfig::default());
        let ctx = FactoryContext::new("ext.count", &runtime, &[]);

        let produced = block_on(CounterServices.services(&ctx)).expect("async factory");
        assert_eq!(produced[0].name, "ext.count.counter");

        let closure = FnProvider(|ctx: &FactoryContext<'_>| -> Result<_, BoxError> {
            Ok(vec![ServiceRegistration::new(
                "echo",
                ctx.extension_id().to_string(),
            )])
        });
        let produced = block_on(ServicesProvider::services(&closure, &ctx)).expect("closure factory");
        assert_eq!(produced.len(), 1);
    }

    #[test]
    fn extension_config_is_keyed_by_extension_id() {
        let mut config = AppConfig::default();
        config
            .extension_config
            .insert("ext.count".to_string(), json!({ "start": 3 }));
        let runtime = RuntimeContext::new(config);
        let ctx = FactoryContext::new("ext.count", &runtime, &[]);
        assert_eq!(ctx.extension_config(), Some(&json!({ "start": 3 })));
    }
}
