//! Named service registry with lifecycle hooks.
//!
//! # Responsibility
//! - Store one shared instance per service name.
//! - Run `dispose` hooks on replacement, unload and teardown.
//!
//! # Invariants
//! - Service names are unique; registering an existing name replaces it
//!   after running the previous entry's `dispose`.
//! - `dispose_all` runs every hook even when some of them fail.

use crate::BoxError;
use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, error, warn};
use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::rc::Rc;

use super::RegisterOutcome;

/// Shared, type-erased service instance.
pub type ServiceInstance = Rc<dyn Any>;

/// Asynchronous configuration hook, run once before the service is visible.
pub type ConfigureHook =
    Box<dyn FnOnce(ServiceInstance) -> LocalBoxFuture<'static, Result<(), BoxError>>>;

/// Teardown hook, run exactly once when the entry leaves the registry.
pub type DisposeHook = Box<dyn FnOnce(ServiceInstance) -> Result<(), BoxError>>;

/// Optional lifecycle pair attached to a service.
#[derive(Default)]
pub struct ServiceHooks {
    pub configure: Option<ConfigureHook>,
    pub dispose: Option<DisposeHook>,
}

impl ServiceHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_configure<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(ServiceInstance) -> Fut + 'static,
        Fut: Future<Output = Result<(), BoxError>> + 'static,
    {
        self.configure = Some(Box::new(move |instance| hook(instance).boxed_local()));
        self
    }

    pub fn with_dispose<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(ServiceInstance) -> Result<(), BoxError> + 'static,
    {
        self.dispose = Some(Box::new(hook));
        self
    }
}

/// Service contribution: a name, the instance and its hooks.
pub struct ServiceRegistration {
    pub name: String,
    pub instance: ServiceInstance,
    pub hooks: ServiceHooks,
}

impl ServiceRegistration {
    pub fn new<T: Any>(name: impl Into<String>, instance: T) -> Self {
        Self::from_shared(name, Rc::new(instance))
    }

    /// Registers an instance the caller keeps a handle to.
    pub fn from_shared(name: impl Into<String>, instance: ServiceInstance) -> Self {
        Self {
            name: name.into(),
            instance,
            hooks: ServiceHooks::none(),
        }
    }

    pub fn with_hooks(mut self, hooks: ServiceHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Runs the configure hook, if any, consuming it.
    pub(crate) async fn run_configure(&mut self) -> Result<(), BoxError> {
        match self.hooks.configure.take() {
            Some(hook) => hook(Rc::clone(&self.instance)).await,
            None => Ok(()),
        }
    }

    /// Runs the dispose hook, if any, consuming the registration.
    pub(crate) fn dispose(self) -> Result<(), BoxError> {
        match self.hooks.dispose {
            Some(hook) => hook(self.instance),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("name", &self.name)
            .field("has_configure", &self.hooks.configure.is_some())
            .field("has_dispose", &self.hooks.dispose.is_some())
            .finish()
    }
}

struct ServiceEntry {
    instance: ServiceInstance,
    dispose: Option<DisposeHook>,
    owner: Option<String>,
    seq: u64,
}

impl ServiceEntry {
    fn dispose(self) -> Result<(), BoxError> {
        match self.dispose {
            Some(hook) => hook(self.instance),
            None => Ok(()),
        }
    }
}

/// Service lookup and lifecycle errors.
#[derive(Debug)]
pub enum ServiceError {
    NotFound(String),
    TypeMismatch {
        name: String,
        expected: &'static str,
    },
    Hook {
        name: String,
        cause: BoxError,
    },
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "service not found: {name}"),
            Self::TypeMismatch { name, expected } => {
                write!(f, "service `{name}` is not of type {expected}")
            }
            Self::Hook { name, cause } => {
                write!(f, "lifecycle hook of service `{name}` failed: {cause}")
            }
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Hook { cause, .. } => Some(cause.as_ref()),
            Self::NotFound(_) | Self::TypeMismatch { .. } => None,
        }
    }
}

/// One failed `dispose` hook.
#[derive(Debug)]
pub struct DisposeFailure {
    pub service: String,
    pub cause: BoxError,
}

/// Aggregated `dispose` failures from one teardown pass.
#[derive(Debug, Default)]
pub struct DisposeFailures {
    pub failures: Vec<DisposeFailure>,
}

impl DisposeFailures {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn services(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|failure| failure.service.as_str())
            .collect()
    }

    pub(crate) fn push(&mut self, service: impl Into<String>, cause: BoxError) {
        self.failures.push(DisposeFailure {
            service: service.into(),
            cause,
        });
    }

    pub(crate) fn extend(&mut self, other: DisposeFailures) {
        self.failures.extend(other.failures);
    }

    pub(crate) fn into_result(self) -> Result<(), DisposeFailures> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Display for DisposeFailures {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} service dispose hook(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.service, failure.cause)?;
        }
        Ok(())
    }
}

impl Error for DisposeFailures {}

/// Named-instance store shared by every consumer of one runtime.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: BTreeMap<String, ServiceEntry>,
    next_seq: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an application-level service.
    ///
    /// A `configure` hook on the registration is ignored here; use
    /// [`ServiceRegistry::register_configured`] when it must run.
    pub fn register(&mut self, registration: ServiceRegistration) -> RegisterOutcome {
        self.insert(registration, None)
    }

    /// Runs the registration's `configure` hook, then registers it.
    pub async fn register_configured(
        &mut self,
        mut registration: ServiceRegistration,
    ) -> Result<RegisterOutcome, ServiceError> {
        if let Err(cause) = registration.run_configure().await {
            let name = registration.name.clone();
            if let Err(dispose_err) = registration.dispose() {
                error!(
                    "event=service_dispose module=services status=error name={} error={}",
                    name, dispose_err
                );
            }
            return Err(ServiceError::Hook { name, cause });
        }
        Ok(self.insert(registration, None))
    }

    pub(crate) fn insert(
        &mut self,
        registration: ServiceRegistration,
        owner: Option<&str>,
    ) -> RegisterOutcome {
        let ServiceRegistration {
            name,
            instance,
            hooks,
        } = registration;

        let outcome = match self.entries.remove(name.as_str()) {
            Some(previous) => {
                warn!(
                    "event=service_replaced module=services status=warn name={} previous_owner={} owner={}",
                    name,
                    previous.owner.as_deref().unwrap_or("app"),
                    owner.unwrap_or("app")
                );
                if let Err(err) = previous.dispose() {
                    error!(
                        "event=service_dispose module=services status=error name={} error={}",
                        name, err
                    );
                }
                RegisterOutcome::Replaced
            }
            None => {
                debug!(
                    "event=service_registered module=services status=ok name={} owner={}",
                    name,
                    owner.unwrap_or("app")
                );
                RegisterOutcome::Inserted
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            name,
            ServiceEntry {
                instance,
                dispose: hooks.dispose,
                owner: owner.map(str::to_string),
                seq,
            },
        );
        outcome
    }

    /// Returns the shared instance registered under `name`.
    pub fn get(&self, name: &str) -> Result<ServiceInstance, ServiceError> {
        self.entries
            .get(name)
            .map(|entry| Rc::clone(&entry.instance))
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Returns the instance downcast to its concrete type.
    pub fn get_as<T: Any>(&self, name: &str) -> Result<Rc<T>, ServiceError> {
        self.get(name)?
            .downcast::<T>()
            .map_err(|_| ServiceError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Swaps the instance behind `name`, keeping hooks and owner.
    ///
    /// Returns the previous instance.
    pub fn replace(
        &mut self,
        name: &str,
        instance: ServiceInstance,
    ) -> Result<ServiceInstance, ServiceError> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        debug!(
            "event=service_instance_replaced module=services status=ok name={}",
            name
        );
        Ok(std::mem::replace(&mut entry.instance, instance))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Extension that registered `name`, `None` for application-level services.
    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.entries.get(name)?.owner.as_deref()
    }

    /// Removes and disposes every service owned by `owner`, newest first.
    pub(crate) fn dispose_owned_by(&mut self, owner: &str) -> DisposeFailures {
        let names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect();
        let mut removed: Vec<(String, ServiceEntry)> = names
            .into_iter()
            .filter_map(|name| self.entries.remove(&name).map(|entry| (name, entry)))
            .collect();
        dispose_newest_first(&mut removed)
    }

    /// Disposes every registered service, newest first.
    ///
    /// All hooks run; failures are collected and reported together.
    pub fn dispose_all(&mut self) -> Result<(), DisposeFailures> {
        let mut removed: Vec<(String, ServiceEntry)> =
            std::mem::take(&mut self.entries).into_iter().collect();
        let count = removed.len();
        let failures = dispose_newest_first(&mut removed);
        debug!(
            "event=services_disposed module=services status={} count={} failed={}",
            if failures.is_empty() { "ok" } else { "error" },
            count,
            failures.len()
        );
        failures.into_result()
    }
}

fn dispose_newest_first(removed: &mut Vec<(String, ServiceEntry)>) -> DisposeFailures {
    removed.sort_by(|(_, a), (_, b)| b.seq.cmp(&a.seq));
    let mut failures = DisposeFailures::default();
    for (name, entry) in removed.drain(..) {
        if let Err(cause) = entry.dispose() {
            error!(
                "event=service_dispose module=services status=error name={} error={}",
                name, cause
            );
            failures.push(name, cause);
        }
    }
    failures
}
