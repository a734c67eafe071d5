//! Workflow definitions and the registry the engine is constructed with.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SagaError};
use crate::step::{Idempotency, Step};

/// Static description of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub name: String,
    /// The step may park awaiting an external callback.
    pub is_async: bool,
    /// How long a parked step waits before its timeout fires.
    pub timeout: Option<Duration>,
    pub idempotency: Idempotency,
    /// Whether the step has a compensating action.
    pub compensable: bool,
}

impl StepSpec {
    /// A synchronous, idempotent, compensable step.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_async: false,
            timeout: None,
            idempotency: Idempotency::Idempotent,
            compensable: true,
        }
    }

    /// Marks the step as asynchronous with the given wait timeout.
    pub fn awaits_callback(mut self, timeout: Duration) -> Self {
        self.is_async = true;
        self.timeout = Some(timeout);
        self
    }

    /// Marks the step as unable to dedupe on its own.
    pub fn requires_dedupe(mut self) -> Self {
        self.idempotency = Idempotency::RequiresDedupe;
        self
    }

    /// Marks the step as having nothing to undo.
    pub fn without_compensation(mut self) -> Self {
        self.compensable = false;
        self
    }
}

/// A step spec bound to its implementation.
#[derive(Clone)]
pub struct RegisteredStep {
    pub spec: StepSpec,
    pub step: Arc<dyn Step>,
}

impl fmt::Debug for RegisteredStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredStep")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// An immutable, ordered list of steps forming one saga type.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    id: String,
    version: u32,
    steps: Vec<RegisteredStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, spec: StepSpec, step: impl Step + 'static) -> Self {
        self.steps.push(RegisteredStep {
            spec,
            step: Arc::new(step),
        });
        self
    }

    /// Appends a step whose implementation is already shared.
    pub fn shared_step(mut self, spec: StepSpec, step: Arc<dyn Step>) -> Self {
        self.steps.push(RegisteredStep { spec, step });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[RegisteredStep] {
        &self.steps
    }

    pub fn step_at(&self, index: usize) -> Option<&RegisteredStep> {
        self.steps.get(index)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.spec.name.as_str()).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "{} v{} has no steps",
                self.id, self.version
            )));
        }

        let mut seen = HashSet::new();
        for registered in &self.steps {
            let spec = &registered.spec;
            if !seen.insert(spec.name.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "{} v{} declares step '{}' twice",
                    self.id, self.version, spec.name
                )));
            }
            if spec.is_async && spec.timeout.is_none() {
                return Err(SagaError::InvalidDefinition(format!(
                    "async step '{}' has no timeout",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// Definitions by id and version.
///
/// Built once before the engine is constructed; instances always run
/// against the version they started with.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, rejecting duplicates and malformed step lists.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;

        let versions = self.definitions.entry(definition.id.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(SagaError::InvalidDefinition(format!(
                "{} v{} is already registered",
                definition.id, definition.version
            )));
        }

        tracing::info!(
            definition_id = %definition.id,
            version = definition.version,
            steps = definition.len(),
            "workflow definition registered"
        );
        versions.insert(definition.version, Arc::new(definition));
        Ok(())
    }

    /// Returns the highest registered version of `id`.
    pub fn latest(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .get(id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
    }

    pub fn get(&self, id: &str, version: u32) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .get(id)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }

    /// Returns the latest version of `id`, or an `UnknownDefinition` error.
    pub fn require_latest(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.latest(id)
            .ok_or_else(|| SagaError::UnknownDefinition(id.to_string()))
    }

    /// Returns `id` at `version`, or an `UnknownDefinition` error.
    pub fn require(&self, id: &str, version: u32) -> Result<Arc<WorkflowDefinition>> {
        self.get(id, version)
            .ok_or_else(|| SagaError::UnknownDefinition(format!("{id} v{version}")))
    }

    /// Registered definition ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
