//! Async service owning live process instances
//!
//! The domain layer is synchronous and unsynchronized by design; this
//! service supplies the single-logical-thread discipline. Each instance
//! sits behind its own `tokio::sync::Mutex`, so exactly one task mutates an
//! instance at a time, and every transition drains the recorded domain
//! events to the configured handler.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::events::ProcessEvent;
use crate::domain::definition::{ProcessDefinition, ProcessId};
use crate::domain::process_instance::{
    ProcessInstance, ProcessInstanceId, ProcessSnapshot, ProcessState,
};
use crate::error::EngineError;
use crate::runtime::ExecutionContext;

/// Handler for domain events drained after each transition
#[async_trait]
pub trait ProcessEventHandler: Send + Sync {
    /// Handle a single domain event
    async fn handle_event(&self, event: Box<dyn ProcessEvent>) -> Result<(), EngineError>;
}

/// Event handler that discards everything
#[derive(Debug, Default)]
pub struct NoopEventHandler;

#[async_trait]
impl ProcessEventHandler for NoopEventHandler {
    async fn handle_event(&self, _event: Box<dyn ProcessEvent>) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Event handler that logs every event through `tracing`
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl ProcessEventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Box<dyn ProcessEvent>) -> Result<(), EngineError> {
        info!(
            event_type = event.event_type(),
            process_instance_id = %event.process_instance_id().0,
            "Process event"
        );
        Ok(())
    }
}

/// Service for executing process instances
pub struct ProcessEngineService {
    /// Registered definitions by id
    definitions: DashMap<ProcessId, Arc<ProcessDefinition>>,

    /// Live instances, each behind its own lock
    instances: DashMap<ProcessInstanceId, Arc<Mutex<ProcessInstance>>>,

    /// Collaborators handed to every instance
    context: Arc<ExecutionContext>,

    /// Event sink
    event_handler: Arc<dyn ProcessEventHandler>,
}

impl ProcessEngineService {
    /// Create a new engine service
    pub fn new(context: Arc<ExecutionContext>, event_handler: Arc<dyn ProcessEventHandler>) -> Self {
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            context,
            event_handler,
        }
    }

    /// Register a process definition
    pub fn register_definition(&self, definition: ProcessDefinition) {
        debug!(process_id = %definition.id.0, "Registering process definition");
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Start a new instance of a registered definition.
    ///
    /// The instance is retained either way; a fatal startup error surfaces
    /// as the returned error with the aborted instance still queryable.
    pub async fn start_process(
        &self,
        process_id: &ProcessId,
        inputs: Map<String, Value>,
    ) -> Result<ProcessInstanceId, EngineError> {
        let definition = self
            .definitions
            .get(process_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::DefinitionNotFound(process_id.0.clone()))?;

        let mut instance = ProcessInstance::new(definition, Arc::clone(&self.context), inputs);
        let instance_id = instance.id.clone();
        let outcome = instance.start();
        self.drain_events(&mut instance).await?;

        self.instances
            .insert(instance_id.clone(), Arc::new(Mutex::new(instance)));
        outcome.map(|_| instance_id)
    }

    /// Deliver an external signal into one instance
    pub async fn signal_process(
        &self,
        instance_id: &ProcessInstanceId,
        event_type: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id)?;
        let mut guard = instance.lock().await;
        let outcome = guard.signal(event_type, payload);
        self.drain_events(&mut guard).await?;
        outcome
    }

    /// Abort one instance
    pub async fn abort_process(&self, instance_id: &ProcessInstanceId) -> Result<(), EngineError> {
        let instance = self.instance(instance_id)?;
        let mut guard = instance.lock().await;
        guard.abort();
        self.drain_events(&mut guard).await
    }

    /// Abort every live instance
    pub async fn abort_all(&self) {
        let instances: Vec<Arc<Mutex<ProcessInstance>>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let aborts = instances.iter().map(|instance| async {
            let mut guard = instance.lock().await;
            guard.abort();
            let _ = self.drain_events(&mut guard).await;
        });
        futures::future::join_all(aborts).await;
    }

    /// Current lifecycle state of one instance
    pub async fn process_state(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<ProcessState, EngineError> {
        let instance = self.instance(instance_id)?;
        let guard = instance.lock().await;
        Ok(guard.state)
    }

    /// Read a root-scope variable of one instance
    pub async fn variable(
        &self,
        instance_id: &ProcessInstanceId,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        let instance = self.instance(instance_id)?;
        let guard = instance.lock().await;
        Ok(guard.variable(name).cloned())
    }

    /// Snapshot one instance for persistence
    pub async fn checkpoint(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<ProcessSnapshot, EngineError> {
        let instance = self.instance(instance_id)?;
        let guard = instance.lock().await;
        Ok(guard.checkpoint())
    }

    /// Rebuild an instance from a snapshot and take ownership of it
    pub async fn restore(&self, snapshot: ProcessSnapshot) -> Result<ProcessInstanceId, EngineError> {
        let definition = self
            .definitions
            .get(&snapshot.definition_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::DefinitionNotFound(snapshot.definition_id.0.clone()))?;

        let instance =
            ProcessInstance::restore(definition, Arc::clone(&self.context), snapshot)?;
        let instance_id = instance.id.clone();
        self.instances
            .insert(instance_id.clone(), Arc::new(Mutex::new(instance)));
        Ok(instance_id)
    }

    /// Drop a terminal instance from the service
    pub fn evict(&self, instance_id: &ProcessInstanceId) {
        self.instances.remove(instance_id);
    }

    fn instance(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Arc<Mutex<ProcessInstance>>, EngineError> {
        self.instances
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.0.clone()))
    }

    async fn drain_events(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        let events = instance.take_events();
        for event in events {
            self.event_handler.handle_event(event).await?;
        }
        Ok(())
    }
}
