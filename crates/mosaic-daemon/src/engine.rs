//! Engine: the layers wired together from one immutable configuration.
//!
//! A new configuration means a new engine; nothing here is reconfigured in
//! place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mosaic_core::{Config, PatternKind, StrategyKind};

use crate::allocator::{AllocError, Allocator, PlacementPolicy, Recommendation};
use crate::backend::BackendRegistry;
use crate::ledger::{Device, DeviceDiscovery, DeviceLedger, LedgerError};
use crate::model::ModelSpec;
use crate::orchestration::{ExecutionRequest, ExecutionResult, ExecutorError, PatternExecutor};
use crate::session::{ModelSessionManager, Placement, PlacementError, SessionConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Unknown model: {model_id}")]
    UnknownModel { model_id: String },

    #[error("No in-flight request: {request_id}")]
    UnknownRequest { request_id: String },

    #[error("Request already in flight: {request_id}")]
    DuplicateRequest { request_id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] mosaic_core::Error),
}

impl EngineError {
    /// Stable machine-readable name for API responses.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ledger(e) => match e {
                LedgerError::UnknownDevice { .. } => "unknown_device",
                LedgerError::InsufficientCapacity { .. } => "insufficient_capacity",
                LedgerError::Occupied { .. } => "occupied",
                _ => "ledger",
            },
            Self::Placement(e) => match e {
                PlacementError::NoFit { .. } => "no_fit",
                PlacementError::CapacityExhausted { .. } => "capacity_exhausted",
                PlacementError::NotHeld { .. } => "not_held",
                PlacementError::EvictionFailed { .. } => "eviction_failed",
                PlacementError::Ledger(LedgerError::UnknownDevice { .. })
                | PlacementError::Alloc(AllocError::UnknownDevice { .. }) => "unknown_device",
                PlacementError::Ledger(LedgerError::InsufficientCapacity { .. }) => {
                    "insufficient_capacity"
                }
                PlacementError::Ledger(_) => "ledger",
                PlacementError::Alloc(AllocError::NoFit { .. }) => "no_fit",
                PlacementError::Alloc(AllocError::PinRequired { .. }) => "pin_required",
            },
            Self::Executor(e) => match e {
                ExecutorError::InvalidTopology { .. } => "invalid_topology",
                ExecutorError::InvalidExtraction(_) => "invalid_extraction",
            },
            Self::UnknownModel { .. } => "unknown_model",
            Self::UnknownRequest { .. } => "unknown_request",
            Self::DuplicateRequest { .. } => "duplicate_request",
            Self::Validation { .. } => "validation",
            Self::Config(_) => "config",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub strategy: StrategyKind,
    pub devices: Vec<Device>,
    pub placements: Vec<Placement>,
    pub evictions: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub model_id: String,
    pub capacity_requirement: u64,
    #[serde(default)]
    pub preferred_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendModel {
    pub model_id: String,
    pub capacity_requirement: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub pattern: PatternKind,
    pub models: Vec<String>,
    #[serde(default)]
    pub aggregator: Option<String>,
    pub input: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Removes an in-flight entry when the execution ends, however it ends.
struct InFlight<'a> {
    engine: &'a Engine,
    request_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.engine.lock_in_flight().remove(&self.request_id);
    }
}

pub struct Engine {
    config: Config,
    ledger: Arc<DeviceLedger>,
    allocator: Arc<Allocator>,
    sessions: Arc<ModelSessionManager>,
    executor: PatternExecutor,
    catalogue: HashMap<String, ModelSpec>,
    evictions: Arc<AtomicU64>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl Engine {
    /// Build ledger, allocator, session manager and executor, in that order.
    pub async fn from_config(
        config: &Config,
        discovery: &dyn DeviceDiscovery,
        backends: BackendRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let ledger = Arc::new(DeviceLedger::discover(discovery).await?);
        let allocator = Arc::new(Allocator::new(PlacementPolicy::from(&config.placement)));

        let evictions = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&evictions);
        let sessions = Arc::new(
            ModelSessionManager::new(
                Arc::clone(&ledger),
                Arc::clone(&allocator),
                SessionConfig::from(&config.placement),
            )
            .with_eviction_listener(Arc::new(move |_: &Placement| {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        );

        for model in &config.models {
            if !backends.contains(&model.backend) {
                warn!(model_id = %model.id, backend = %model.backend, "Model references an unregistered backend");
            }
        }
        let catalogue = config
            .models
            .iter()
            .map(|m| (m.id.clone(), ModelSpec::from(m)))
            .collect();

        let executor = PatternExecutor::new(
            Arc::clone(&sessions),
            backends,
            config.patterns,
            &config.voting.extraction,
        )?;

        info!(
            devices = ledger.len().await,
            models = config.models.len(),
            strategy = %config.placement.strategy,
            "Engine ready"
        );

        Ok(Self {
            config: config.clone(),
            ledger,
            allocator,
            sessions,
            executor,
            catalogue,
            evictions,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn ledger(&self) -> &Arc<DeviceLedger> {
        &self.ledger
    }

    pub const fn sessions(&self) -> &Arc<ModelSessionManager> {
        &self.sessions
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelSpec> {
        self.catalogue.get(model_id)
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            strategy: self.config.placement.strategy,
            devices: self.ledger.snapshot().await.devices,
            placements: self.sessions.placements(),
            evictions: self.evictions.load(Ordering::Relaxed),
            in_flight: self.lock_in_flight().len(),
        }
    }

    /// Take one reference on a model's placement, creating it if needed.
    /// The reference is held until [`Engine::release`].
    pub async fn allocate(&self, request: AllocateRequest) -> Result<Placement, EngineError> {
        let spec = self.adhoc_spec(
            &request.model_id,
            request.capacity_requirement,
            request.preferred_device,
        )?;
        let handle = self.sessions.acquire(&spec).await?;
        Ok(handle.detach())
    }

    /// Drop one reference. Returns the remaining count.
    pub fn release(&self, model_id: &str) -> Result<usize, EngineError> {
        Ok(self.sessions.release_model(model_id)?)
    }

    /// Dry-run placement of several models. Nothing is committed.
    pub async fn recommend(
        &self,
        models: &[RecommendModel],
    ) -> Result<Vec<Recommendation>, EngineError> {
        let specs = models
            .iter()
            .map(|m| self.adhoc_spec(&m.model_id, m.capacity_requirement, None))
            .collect::<Result<Vec<_>, _>>()?;
        let snapshot = self.ledger.snapshot().await;
        Ok(self
            .allocator
            .recommend_batch(&specs, &snapshot, self.config.placement.strategy))
    }

    /// Run a pattern request. Cancelled by [`Engine::abort`] or by dropping
    /// the returned future.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, EngineError> {
        let models = request
            .models
            .iter()
            .map(|id| self.catalogue_spec(id))
            .collect::<Result<Vec<_>, _>>()?;
        let aggregator = request
            .aggregator
            .as_deref()
            .map(|id| self.catalogue_spec(id))
            .transpose()?;
        let request_id = request
            .request_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let cancel = CancellationToken::new();
        let _in_flight = self.track(&request_id, cancel.clone())?;

        let result = self
            .executor
            .execute(
                ExecutionRequest {
                    request_id,
                    pattern: request.pattern,
                    models,
                    aggregator,
                    input: request.input,
                },
                cancel,
            )
            .await?;
        Ok(result)
    }

    /// Cancel an in-flight execution.
    pub fn abort(&self, request_id: &str) -> Result<(), EngineError> {
        let token = self
            .lock_in_flight()
            .get(request_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRequest {
                request_id: request_id.to_string(),
            })?;
        token.cancel();
        info!(request_id, "Execution aborted");
        Ok(())
    }

    fn track(
        &self,
        request_id: &str,
        cancel: CancellationToken,
    ) -> Result<InFlight<'_>, EngineError> {
        let mut in_flight = self.lock_in_flight();
        if in_flight.contains_key(request_id) {
            return Err(EngineError::DuplicateRequest {
                request_id: request_id.to_string(),
            });
        }
        in_flight.insert(request_id.to_string(), cancel);
        drop(in_flight);
        Ok(InFlight {
            engine: self,
            request_id: request_id.to_string(),
        })
    }

    fn catalogue_spec(&self, model_id: &str) -> Result<ModelSpec, EngineError> {
        self.catalogue
            .get(model_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel {
                model_id: model_id.to_string(),
            })
    }

    /// A spec for a model named by the caller, falling back to the
    /// catalogue for its backend and pin.
    fn adhoc_spec(
        &self,
        model_id: &str,
        capacity: u64,
        preferred_device: Option<String>,
    ) -> Result<ModelSpec, EngineError> {
        if model_id.is_empty() {
            return Err(EngineError::Validation {
                message: "model_id must not be empty".to_string(),
            });
        }
        if capacity == 0 {
            return Err(EngineError::Validation {
                message: format!("{model_id}: capacity_requirement must be positive"),
            });
        }
        let mut spec = self
            .catalogue
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| ModelSpec::new(model_id, capacity, "echo"));
        spec.capacity = capacity;
        if preferred_device.is_some() {
            spec.pinned_device = preferred_device;
        }
        Ok(spec)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
