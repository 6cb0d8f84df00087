// src/registry.rs
//
// Two-phase wiring for services and controllers. Components register
// themselves by name while they are constructed; once every component of a
// kind exists, the matching barrier lets each one look up its peers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info};

use crate::schema::{Field, Fields, OutputType};

#[async_trait]
pub trait Service: Send + Sync {
    /// Runs once, after every service has registered. Peers may only be
    /// fetched from here, never from a constructor.
    async fn on_all_services_registered(&self, registry: &Registry);
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn on_all_controllers_registered(&self, registry: &Registry);

    fn queries(self: Arc<Self>) -> Fields;

    fn mutations(self: Arc<Self>) -> Fields;

    /// A renderer other controllers can embed for this controller's entities.
    fn output_type(self: Arc<Self>, name: &str) -> Option<OutputType>;

    /// A pre-built field other controllers can embed.
    fn field(self: Arc<Self>, name: &str) -> Option<Field>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registering,
    Resolving,
    Ready,
}

#[derive(Clone)]
struct ServiceEntry {
    hook: Arc<dyn Service>,
    handle: Arc<dyn Any + Send + Sync>,
}

struct Slots<V> {
    kind: &'static str,
    inner: RwLock<SlotsInner<V>>,
}

struct SlotsInner<V> {
    phase: Phase,
    entries: HashMap<String, V>,
}

fn fatal(message: String) -> ! {
    error!("{}", message);
    panic!("{}", message);
}

impl<V: Clone> Slots<V> {
    fn new(kind: &'static str) -> Self {
        Slots {
            kind,
            inner: RwLock::new(SlotsInner {
                phase: Phase::Registering,
                entries: HashMap::new(),
            }),
        }
    }

    fn phase(&self) -> Phase {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).phase
    }

    fn insert(&self, name: &str, value: V) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.phase != Phase::Registering {
            fatal(format!(
                "{} {} registered after all {}s were registered",
                self.kind, name, self.kind
            ));
        }
        if inner.entries.contains_key(name) {
            fatal(format!("{} {} is already registered", self.kind, name));
        }
        debug!("Registered {} {}", self.kind, name);
        inner.entries.insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> V {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match inner.entries.get(name) {
            Some(value) => value.clone(),
            None => fatal(format!("{} {} not found in registry", self.kind, name)),
        }
    }

    /// Closes registration and hands back a snapshot for the barrier.
    fn seal(&self) -> Vec<(String, V)> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.phase != Phase::Registering {
            fatal(format!("all {}s were already registered", self.kind));
        }
        inner.phase = Phase::Resolving;
        let mut snapshot: Vec<(String, V)> = inner
            .entries
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    fn mark_ready(&self) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).phase = Phase::Ready;
    }
}

/// Holds every service and controller by name. Built once in the composition
/// root and passed by reference to each component.
pub struct Registry {
    services: Slots<ServiceEntry>,
    controllers: Slots<Arc<dyn Controller>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            services: Slots::new("service"),
            controllers: Slots::new("controller"),
        }
    }

    /// `service` receives the barrier hook; `handle` is what peers get back
    /// from [`Registry::get_service`], usually the service's trait object.
    pub fn register_service<T>(&self, name: &str, service: Arc<dyn Service>, handle: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let handle: Arc<dyn Any + Send + Sync> = Arc::new(handle);
        self.services.insert(name, ServiceEntry { hook: service, handle });
    }

    pub fn register_controller(&self, name: &str, controller: Arc<dyn Controller>) {
        self.controllers.insert(name, controller);
    }

    /// Panics when `name` was never registered or was registered under a
    /// different handle type: both are wiring bugs.
    pub fn get_service<T>(&self, name: &str) -> Arc<T>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        debug!("Looking up service {}", name);
        let entry = self.services.get(name);
        match entry.handle.downcast_ref::<Arc<T>>() {
            Some(handle) => Arc::clone(handle),
            None => fatal(format!(
                "service {} is not a {}",
                name,
                std::any::type_name::<T>()
            )),
        }
    }

    pub fn get_controller(&self, name: &str) -> Arc<dyn Controller> {
        self.controllers.get(name)
    }

    pub fn get_output_type(&self, controller: &str, name: &str) -> OutputType {
        match self.get_controller(controller).output_type(name) {
            Some(output_type) => output_type,
            None => fatal(format!(
                "controller {} has no output type {}",
                controller, name
            )),
        }
    }

    pub fn get_field(&self, controller: &str, name: &str) -> Field {
        match self.get_controller(controller).field(name) {
            Some(field) => field,
            None => fatal(format!("controller {} has no field {}", controller, name)),
        }
    }

    pub async fn all_services_registered(&self) {
        let snapshot = self.services.seal();
        info!("All {} services registered, resolving dependencies", snapshot.len());

        join_all(snapshot.iter().map(|(name, entry)| async move {
            debug!("Resolving dependencies of service {}", name);
            entry.hook.on_all_services_registered(self).await;
        }))
        .await;

        self.services.mark_ready();
        info!("All services ready");
    }

    pub async fn all_controllers_registered(&self) {
        if self.services.phase() != Phase::Ready {
            fatal("controllers cannot be resolved before all services are ready".to_string());
        }
        let snapshot = self.controllers.seal();
        info!("All {} controllers registered, resolving dependencies", snapshot.len());

        join_all(snapshot.iter().map(|(name, controller)| async move {
            debug!("Resolving dependencies of controller {}", name);
            controller.on_all_controllers_registered(self).await;
        }))
        .await;

        self.controllers.mark_ready();
        info!("All controllers ready");
    }

    /// Every controller, ordered by name. Only meaningful once the controller
    /// barrier has completed.
    pub fn controllers(&self) -> Vec<(String, Arc<dyn Controller>)> {
        if self.controllers.phase() != Phase::Ready {
            fatal("controllers requested before they were resolved".to_string());
        }
        let inner = self
            .controllers
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<(String, Arc<dyn Controller>)> = inner
            .entries
            .iter()
            .map(|(name, controller)| (name.clone(), Arc::clone(controller)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
