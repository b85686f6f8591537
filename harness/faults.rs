//! Fault injection lifecycle
//!
//! A [`FaultInjector`] owns every active fault. Injection applies the effect through a
//! [`FaultTarget`] and, for auto-reverting faults, spawns a timer task that releases
//! the fault once its duration elapses. Manual removal takes the entry out of the map
//! before anything else, so a timer and a caller racing to release the same fault
//! revert it exactly once. A release that arrives while the effect is still being
//! applied is deferred until the apply returns.

use crate::{HarnessError, HarnessResult};
use async_trait::async_trait;
use bftlab_sim::utils::duration_ms;
use bftlab_sim::{BehaviorType, NodeId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kind of fault
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    Network,
    Cpu,
    Memory,
    Disk,
    Process,
    Consensus,
}

/// Shape of the fault over time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FaultPattern {
    #[default]
    Constant,
    Intermittent,
    Spike,
    Partition,
}

/// Nodes a fault applies to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FaultScope {
    #[default]
    Cluster,
    Nodes(Vec<NodeId>),
}

/// Fault tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultParameters {
    /// Strength in [0, 1]
    pub intensity: f64,
    pub pattern: FaultPattern,
    pub latency_ms: Option<u64>,
    pub packet_loss: Option<f64>,
    /// Partition groups; the largest keeps participating
    pub groups: Vec<Vec<NodeId>>,
    /// Behavior for consensus faults, `Coordinated` when unset
    pub behavior: Option<BehaviorType>,
}

impl Default for FaultParameters {
    fn default() -> Self {
        Self {
            intensity: 0.5,
            pattern: FaultPattern::Constant,
            latency_ms: None,
            packet_loss: None,
            groups: Vec::new(),
            behavior: None,
        }
    }
}

/// Descriptor of one fault injection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultInjection {
    pub id: String,
    pub fault_type: FaultType,
    pub target: FaultScope,
    pub parameters: FaultParameters,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub auto_revert: bool,
    /// Experiment this fault belongs to; such faults need a passed safety validation
    pub experiment_id: Option<String>,
}

impl FaultInjection {
    pub fn new(id: impl Into<String>, fault_type: FaultType, target: FaultScope) -> Self {
        Self {
            id: id.into(),
            fault_type,
            target,
            parameters: FaultParameters::default(),
            duration: Duration::ZERO,
            auto_revert: true,
            experiment_id: None,
        }
    }

    /// Latency fault adding `latency_ms` to every round
    pub fn latency(id: impl Into<String>, latency_ms: u64) -> Self {
        Self::new(id, FaultType::Network, FaultScope::Cluster).with_parameters(FaultParameters {
            latency_ms: Some(latency_ms),
            ..FaultParameters::default()
        })
    }

    /// Partition fault isolating everything outside the largest of `groups`
    pub fn partition(id: impl Into<String>, groups: Vec<Vec<NodeId>>) -> Self {
        Self::new(id, FaultType::Network, FaultScope::Cluster).with_parameters(FaultParameters {
            pattern: FaultPattern::Partition,
            groups,
            ..FaultParameters::default()
        })
    }

    /// Process fault taking `nodes` offline
    pub fn node_failure(id: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        Self::new(id, FaultType::Process, FaultScope::Nodes(nodes))
    }

    pub fn with_parameters(mut self, parameters: FaultParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_auto_revert(mut self, auto_revert: bool) -> Self {
        self.auto_revert = auto_revert;
        self
    }

    pub fn for_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.id.is_empty() {
            return Err(HarnessError::InvalidConfiguration(
                "Fault id must not be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.parameters.intensity) {
            return Err(HarnessError::InvalidConfiguration(format!(
                "Fault intensity {} is outside [0, 1]",
                self.parameters.intensity
            )));
        }

        if let Some(loss) = self.parameters.packet_loss {
            if !(0.0..=1.0).contains(&loss) {
                return Err(HarnessError::InvalidConfiguration(format!(
                    "Packet loss {} is outside [0, 1]",
                    loss
                )));
            }
        }

        if self.parameters.pattern == FaultPattern::Partition && self.parameters.groups.is_empty() {
            return Err(HarnessError::InvalidConfiguration(
                "Partition faults need at least one group".to_string(),
            ));
        }

        Ok(())
    }
}

/// Outcome of [`FaultInjector::inject_fault`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultInjectionResult {
    pub success: bool,
    pub injection_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl FaultInjectionResult {
    fn failed(injection_id: &str, error: HarnessError) -> Self {
        Self {
            success: false,
            injection_id: injection_id.to_string(),
            started_at: None,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of [`FaultInjector::remove_fault`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultRemovalResult {
    pub success: bool,
    pub injection_id: String,
    pub error: Option<String>,
}

/// What released a fault
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RevertReason {
    Manual,
    Timer,
    Emergency,
}

/// Completed injection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultRecord {
    pub injection: FaultInjection,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reverted_by: RevertReason,
    /// Revert error, if the target failed to undo the effect
    pub revert_error: Option<String>,
}

/// Public view of an active fault
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveFaultInfo {
    pub injection: FaultInjection,
    pub started_at: DateTime<Utc>,
    pub timer_armed: bool,
}

/// Whatever a fault's effect is applied to
#[async_trait]
pub trait FaultTarget: Send + Sync {
    async fn apply(&self, fault: &FaultInjection) -> HarnessResult<()>;

    async fn revert(&self, fault: &FaultInjection) -> HarnessResult<()>;
}

struct ActiveFault {
    injection: FaultInjection,
    started_at: DateTime<Utc>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    /// False while the target is still applying the effect
    applied: bool,
    /// Release requested while the effect was being applied
    pending_release: Option<RevertReason>,
}

struct InjectorState {
    target: Arc<dyn FaultTarget>,
    active: DashMap<String, ActiveFault>,
    cleared_experiments: DashMap<String, DateTime<Utc>>,
    history: RwLock<Vec<FaultRecord>>,
    generation: AtomicU64,
}

impl InjectorState {
    /// Take the fault out of the active map and revert it. `generation` restricts the
    /// release to one specific injection of the id. A fault still being applied is only
    /// marked; its injecting task releases it once the effect is in place.
    async fn release(
        &self,
        id: &str,
        generation: Option<u64>,
        reason: RevertReason,
    ) -> HarnessResult<()> {
        let same_injection = |f: &ActiveFault| generation.map_or(true, |g| f.generation == g);

        if let Some(mut fault) = self.active.get_mut(id) {
            if !fault.applied && same_injection(fault.value()) {
                debug!(fault = id, ?reason, "release deferred until apply completes");
                fault.pending_release.get_or_insert(reason);
                return Ok(());
            }
        }

        let removed = self.active.remove_if(id, |_, f| f.applied && same_injection(f));
        let Some((_, fault)) = removed else {
            return Err(HarnessError::FaultNotFound(id.to_string()));
        };

        if reason != RevertReason::Timer {
            if let Some(timer) = &fault.timer {
                timer.abort();
            }
        }

        let revert_error = match self.target.revert(&fault.injection).await {
            Ok(()) => None,
            Err(e) => {
                warn!(fault = id, error = %e, "fault revert failed");
                Some(e.to_string())
            }
        };

        info!(fault = id, ?reason, "fault released");
        self.history.write().await.push(FaultRecord {
            injection: fault.injection,
            started_at: fault.started_at,
            ended_at: Utc::now(),
            reverted_by: reason,
            revert_error,
        });
        Ok(())
    }
}

/// Registry of active faults with timed auto-revert
#[derive(Clone)]
pub struct FaultInjector {
    state: Arc<InjectorState>,
}

impl FaultInjector {
    pub fn new(target: Arc<dyn FaultTarget>) -> Self {
        Self {
            state: Arc::new(InjectorState {
                target,
                active: DashMap::new(),
                cleared_experiments: DashMap::new(),
                history: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Apply a fault and arm its revert timer
    pub async fn inject_fault(&self, injection: FaultInjection) -> FaultInjectionResult {
        let id = injection.id.clone();

        if let Err(e) = injection.validate() {
            return FaultInjectionResult::failed(&id, e);
        }

        if let Some(experiment_id) = &injection.experiment_id {
            if !self.state.cleared_experiments.contains_key(experiment_id) {
                warn!(fault = %id, experiment = %experiment_id, "injection refused by safety gate");
                return FaultInjectionResult::failed(
                    &id,
                    HarnessError::SafetyNotValidated(experiment_id.clone()),
                );
            }
        }

        let started_at = Utc::now();
        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed);

        // Reserve the id before applying so a concurrent duplicate is refused
        match self.state.active.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return FaultInjectionResult::failed(&id, HarnessError::FaultAlreadyActive(id.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ActiveFault {
                    injection: injection.clone(),
                    started_at,
                    generation,
                    timer: None,
                    applied: false,
                    pending_release: None,
                });
            }
        }

        if let Err(e) = self.state.target.apply(&injection).await {
            self.state.active.remove_if(&id, |_, f| f.generation == generation);
            warn!(fault = %id, error = %e, "fault apply failed");
            return FaultInjectionResult::failed(&id, e);
        }

        let pending = match self.state.active.get_mut(&id) {
            Some(mut fault) if fault.generation == generation => {
                fault.applied = true;
                fault.pending_release.take()
            }
            _ => None,
        };
        if let Some(reason) = pending {
            info!(fault = %id, ?reason, "fault released right after apply");
            if let Err(e) = self.state.release(&id, Some(generation), reason).await {
                warn!(fault = %id, error = %e, "deferred release failed");
            }
            return FaultInjectionResult {
                success: true,
                injection_id: id,
                started_at: Some(started_at),
                error: None,
            };
        }

        if injection.auto_revert && !injection.duration.is_zero() {
            let timer = self.spawn_revert_timer(id.clone(), generation, injection.duration);
            match self.state.active.get_mut(&id) {
                Some(mut fault) if fault.generation == generation => fault.timer = Some(timer),
                _ => timer.abort(),
            }
        }

        info!(
            fault = %id,
            fault_type = ?injection.fault_type,
            duration_ms = injection.duration.as_millis() as u64,
            "fault injected"
        );

        FaultInjectionResult {
            success: true,
            injection_id: id,
            started_at: Some(started_at),
            error: None,
        }
    }

    /// Release a fault before its timer; unknown ids yield `success = false`
    pub async fn remove_fault(&self, id: &str) -> FaultRemovalResult {
        match self.state.release(id, None, RevertReason::Manual).await {
            Ok(()) => FaultRemovalResult {
                success: true,
                injection_id: id.to_string(),
                error: None,
            },
            Err(e) => FaultRemovalResult {
                success: false,
                injection_id: id.to_string(),
                error: Some(e.to_string()),
            },
        }
    }

    /// Release every fault of an experiment; returns the removed ids
    pub async fn remove_faults_for_experiment(&self, experiment_id: &str) -> Vec<String> {
        self.release_matching(|f| f.experiment_id.as_deref() == Some(experiment_id), RevertReason::Manual)
            .await
    }

    /// Release every fault of an experiment after a failure
    pub async fn emergency_recovery(&self, experiment_id: &str) -> Vec<String> {
        let removed = self
            .release_matching(
                |f| f.experiment_id.as_deref() == Some(experiment_id),
                RevertReason::Emergency,
            )
            .await;
        if !removed.is_empty() {
            warn!(experiment = experiment_id, count = removed.len(), "emergency recovery");
        }
        removed
    }

    /// Release all active faults
    pub async fn clear_all(&self) -> usize {
        self.release_matching(|_| true, RevertReason::Manual).await.len()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.state.active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.state.active.len()
    }

    pub fn active_faults(&self) -> Vec<ActiveFaultInfo> {
        let mut faults: Vec<ActiveFaultInfo> = self
            .state
            .active
            .iter()
            .map(|entry| ActiveFaultInfo {
                injection: entry.injection.clone(),
                started_at: entry.started_at,
                timer_armed: entry.timer.is_some(),
            })
            .collect();
        faults.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.injection.id.cmp(&b.injection.id)));
        faults
    }

    pub async fn history(&self) -> Vec<FaultRecord> {
        self.state.history.read().await.clone()
    }

    /// Allow injections scoped to `experiment_id`
    pub fn clear_experiment(&self, experiment_id: &str) {
        self.state
            .cleared_experiments
            .insert(experiment_id.to_string(), Utc::now());
    }

    pub fn revoke_experiment(&self, experiment_id: &str) {
        self.state.cleared_experiments.remove(experiment_id);
    }

    pub fn is_cleared(&self, experiment_id: &str) -> bool {
        self.state.cleared_experiments.contains_key(experiment_id)
    }

    async fn release_matching(
        &self,
        predicate: impl Fn(&FaultInjection) -> bool,
        reason: RevertReason,
    ) -> Vec<String> {
        let ids: Vec<String> = self
            .state
            .active
            .iter()
            .filter(|entry| predicate(&entry.injection))
            .map(|entry| entry.key().clone())
            .collect();

        let releases = ids.iter().map(|id| self.state.release(id, None, reason));
        let outcomes = join_all(releases).await;

        ids.into_iter()
            .zip(outcomes)
            .filter_map(|(id, outcome)| outcome.is_ok().then_some(id))
            .collect()
    }

    fn spawn_revert_timer(&self, id: String, generation: u64, duration: Duration) -> JoinHandle<()> {
        let state: Weak<InjectorState> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            debug!(fault = %id, "revert timer fired");
            if let Err(e) = state.release(&id, Some(generation), RevertReason::Timer).await {
                debug!(fault = %id, error = %e, "timer found fault already released");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records apply/revert calls
    #[derive(Default)]
    struct RecordingTarget {
        applied: Mutex<Vec<String>>,
        reverted: Mutex<Vec<String>>,
        fail_apply: bool,
        apply_delay: Duration,
    }

    #[async_trait]
    impl FaultTarget for RecordingTarget {
        async fn apply(&self, fault: &FaultInjection) -> HarnessResult<()> {
            if !self.apply_delay.is_zero() {
                tokio::time::sleep(self.apply_delay).await;
            }
            if self.fail_apply {
                return Err(HarnessError::InvalidConfiguration("apply refused".to_string()));
            }
            self.applied.lock().unwrap().push(fault.id.clone());
            Ok(())
        }

        async fn revert(&self, fault: &FaultInjection) -> HarnessResult<()> {
            self.reverted.lock().unwrap().push(fault.id.clone());
            Ok(())
        }
    }

    fn injector() -> (Arc<RecordingTarget>, FaultInjector) {
        let target = Arc::new(RecordingTarget::default());
        (target.clone(), FaultInjector::new(target))
    }

    #[tokio::test(start_paused = true)]
    async fn test_inject_and_remove() {
        let (target, injector) = injector();
        let result = injector.inject_fault(FaultInjection::latency("lat", 200)).await;
        assert!(result.success);
        assert!(result.started_at.is_some());
        assert!(injector.is_active("lat"));

        let removal = injector.remove_fault("lat").await;
        assert!(removal.success);
        assert!(!injector.is_active("lat"));
        assert_eq!(*target.reverted.lock().unwrap(), vec!["lat".to_string()]);

        let history = injector.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reverted_by, RevertReason::Manual);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_unknown_fault() {
        let (_, injector) = injector();
        let removal = injector.remove_fault("missing").await;
        assert!(!removal.success);
        assert!(removal.error.unwrap().contains("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_rejected() {
        let (target, injector) = injector();
        assert!(injector.inject_fault(FaultInjection::latency("dup", 10)).await.success);
        let second = injector.inject_fault(FaultInjection::latency("dup", 10)).await;
        assert!(!second.success);
        assert!(second.error.unwrap().contains("already active"));
        assert_eq!(target.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_intensity_rejected() {
        let (target, injector) = injector();
        let fault = FaultInjection::latency("bad", 10).with_parameters(FaultParameters {
            intensity: 1.5,
            ..FaultParameters::default()
        });
        assert!(!injector.inject_fault(fault).await.success);
        assert!(target.applied.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_experiment_fault_requires_clearance() {
        let (_, injector) = injector();
        let fault = FaultInjection::latency("exp-lat", 10).for_experiment("exp-1");

        let refused = injector.inject_fault(fault.clone()).await;
        assert!(!refused.success);
        assert!(refused.error.unwrap().contains("safety validation"));

        injector.clear_experiment("exp-1");
        assert!(injector.inject_fault(fault).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_apply_frees_id() {
        let target = Arc::new(RecordingTarget {
            fail_apply: true,
            ..RecordingTarget::default()
        });
        let injector = FaultInjector::new(target);
        assert!(!injector.inject_fault(FaultInjection::latency("x", 1)).await.success);
        assert!(!injector.is_active("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_during_apply_reverts_after_apply() {
        let target = Arc::new(RecordingTarget {
            apply_delay: Duration::from_secs(1),
            ..RecordingTarget::default()
        });
        let injector = FaultInjector::new(target.clone());

        let slow = injector.clone();
        let injecting = tokio::spawn(async move {
            let fault = FaultInjection::latency("slow", 10).with_duration(Duration::from_secs(30));
            slow.inject_fault(fault).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(injector.is_active("slow"));
        assert!(target.applied.lock().unwrap().is_empty());

        assert!(injector.remove_fault("slow").await.success);
        assert!(target.reverted.lock().unwrap().is_empty());

        assert!(injecting.await.unwrap().success);
        assert!(!injector.is_active("slow"));
        assert_eq!(*target.applied.lock().unwrap(), vec!["slow".to_string()]);
        assert_eq!(*target.reverted.lock().unwrap(), vec!["slow".to_string()]);

        let history = injector.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reverted_by, RevertReason::Manual);

        // No timer was armed for the released fault
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(injector.history().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_faults_for_experiment() {
        let (_, injector) = injector();
        injector.clear_experiment("e");
        for id in ["a", "b"] {
            let fault = FaultInjection::latency(id, 10).for_experiment("e");
            assert!(injector.inject_fault(fault).await.success);
        }
        assert!(injector.inject_fault(FaultInjection::latency("other", 10)).await.success);

        let mut removed = injector.remove_faults_for_experiment("e").await;
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(injector.active_count(), 1);
        assert_eq!(injector.clear_all().await, 1);
    }
}
