use crate::core::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::graph::ModelTier;

/// Operational limits for one executor run.
///
/// Concurrency defaults are tier-aware: cheap tiers run wide, the expensive
/// tier runs narrow to bound spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Maximum artifacts per graph. Exceeding fails construction/extension.
    pub max_artifacts: usize,
    /// Maximum dynamic discovery rounds before forced stop.
    pub max_discovery_rounds: usize,
    /// Maximum dependency chain depth.
    pub max_depth: usize,
    /// Concurrent creation calls for small-tier artifacts.
    pub max_concurrent_small: usize,
    /// Concurrent creation calls for medium-tier artifacts.
    pub max_concurrent_medium: usize,
    /// Concurrent creation calls for large-tier artifacts.
    pub max_concurrent_large: usize,
    /// Timeout for a single artifact creation call.
    pub artifact_timeout: Duration,
    /// Timeout for a full graph execution.
    pub execution_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_artifacts: 50,
            max_discovery_rounds: 5,
            max_depth: 10,
            max_concurrent_small: 8,
            max_concurrent_medium: 4,
            max_concurrent_large: 2,
            artifact_timeout: Duration::from_secs(120),
            execution_timeout: Duration::from_secs(1800),
        }
    }
}

impl ExecutionLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_artifacts == 0 {
            return Err(EngineError::configuration(
                "max_artifacts must be greater than 0",
            ));
        }
        if self.max_depth == 0 {
            return Err(EngineError::configuration(
                "max_depth must be greater than 0",
            ));
        }
        if self.max_concurrent_small == 0
            || self.max_concurrent_medium == 0
            || self.max_concurrent_large == 0
        {
            return Err(EngineError::configuration(
                "per-tier concurrency must be greater than 0",
            ));
        }
        if self.artifact_timeout.is_zero() {
            return Err(EngineError::configuration(
                "artifact_timeout must be greater than 0",
            ));
        }
        if self.execution_timeout < self.artifact_timeout {
            return Err(EngineError::configuration(
                "execution_timeout must not be shorter than artifact_timeout",
            ));
        }
        Ok(())
    }

    /// Conservative limits for tests.
    pub fn conservative() -> Self {
        Self {
            max_artifacts: 10,
            max_discovery_rounds: 2,
            max_depth: 5,
            max_concurrent_small: 2,
            max_concurrent_medium: 2,
            max_concurrent_large: 1,
            artifact_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(60),
        }
    }

    /// Concurrency bound for a given tier.
    pub fn concurrency_for(&self, tier: ModelTier) -> usize {
        match tier {
            ModelTier::Small => self.max_concurrent_small,
            ModelTier::Medium => self.max_concurrent_medium,
            ModelTier::Large => self.max_concurrent_large,
        }
    }
}

/// Global ceiling on aggregate model-call rate and memory across all
/// executors and workers, regardless of per-worker concurrency.
#[derive(Debug)]
pub struct ResourceGovernor {
    calls: Arc<Semaphore>,
    max_calls: usize,
    max_memory_bytes: u64,
    memory_usage: AtomicU64,
    peak_memory: AtomicU64,
    total_calls: AtomicU64,
    limit_violations: AtomicU64,
}

impl ResourceGovernor {
    pub fn new(max_concurrent_calls: usize, max_memory_bytes: u64) -> Result<Arc<Self>> {
        if max_concurrent_calls == 0 {
            return Err(EngineError::configuration(
                "max_concurrent_calls must be greater than 0",
            ));
        }
        if max_memory_bytes == 0 {
            return Err(EngineError::configuration(
                "max_memory_bytes must be greater than 0",
            ));
        }
        Ok(Arc::new(Self {
            calls: Arc::new(Semaphore::new(max_concurrent_calls)),
            max_calls: max_concurrent_calls,
            max_memory_bytes,
            memory_usage: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            limit_violations: AtomicU64::new(0),
        }))
    }

    /// Defaults sized for a single-host coordinator run.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(16, 512 * 1024 * 1024).expect("default governor limits are valid")
    }

    /// Acquire a slot for one outbound model call. Waits until a slot frees
    /// up, so the aggregate rate never exceeds the global ceiling.
    pub async fn acquire_call(self: &Arc<Self>) -> Result<CallPermit> {
        let permit = self
            .calls
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::internal("governor semaphore closed"))?;
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(CallPermit { _permit: permit })
    }

    /// Reserve memory for buffered artifact content. The reservation is
    /// released when the returned guard drops. Check and reserve are one
    /// atomic step, so concurrent reservations can never jointly exceed
    /// the ceiling.
    pub fn reserve_memory(self: &Arc<Self>, bytes: u64) -> Result<MemoryReservation> {
        let reserved = self
            .memory_usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current
                    .checked_add(bytes)
                    .filter(|total| *total <= self.max_memory_bytes)
            });

        match reserved {
            Ok(previous) => {
                let new_total = previous + bytes;
                self.peak_memory.fetch_max(new_total, Ordering::SeqCst);
                debug!(bytes, total = new_total, "reserved memory");
                Ok(MemoryReservation {
                    governor: Arc::clone(self),
                    bytes,
                })
            }
            Err(current) => {
                self.limit_violations.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::ResourceExhausted {
                    resource: "memory".to_string(),
                    current: current.saturating_add(bytes),
                    limit: self.max_memory_bytes,
                })
            }
        }
    }

    fn release_memory(&self, bytes: u64) {
        self.memory_usage.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            max_concurrent_calls: self.max_calls,
            available_call_slots: self.calls.available_permits(),
            memory_usage_bytes: self.memory_usage.load(Ordering::Relaxed),
            peak_memory_bytes: self.peak_memory.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            limit_violations: self.limit_violations.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard for one in-flight model call.
pub struct CallPermit {
    _permit: OwnedSemaphorePermit,
}

/// RAII guard for a memory reservation.
pub struct MemoryReservation {
    governor: Arc<ResourceGovernor>,
    bytes: u64,
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.governor.release_memory(self.bytes);
    }
}

/// Snapshot of governor counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorStats {
    pub max_concurrent_calls: usize,
    pub available_call_slots: usize,
    pub memory_usage_bytes: u64,
    pub peak_memory_bytes: u64,
    pub total_calls: u64,
    pub limit_violations: u64,
}
