//! Experiment monitoring
//!
//! Samples cluster health at a fixed interval while an experiment's faults are live,
//! evaluates the experiment's abort conditions against every sample and broadcasts
//! alerts to any subscriber.
//!
//! ## Alerts
//!
//! - **Warning**: a sample crossed a soft threshold (health below 50, error rate above 5%)
//! - **Critical**: an abort condition fired; the watch ends immediately

use crate::cluster::{ClusterHealth, SimulatedCluster};
use crate::HarnessConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Condition under which a running experiment is aborted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "threshold", rename_all = "snake_case")]
pub enum AbortCondition {
    /// Health score below the threshold
    HealthBelow(f64),
    /// Error rate (0-1) above the threshold
    ErrorRateAbove(f64),
    /// Expected round latency above the threshold (milliseconds)
    LatencyAbove(u64),
    /// The protocol can no longer tolerate the current split
    ConsensusLost,
}

impl AbortCondition {
    pub fn is_met(&self, sample: &MonitorSample) -> bool {
        match *self {
            AbortCondition::HealthBelow(threshold) => sample.health_score < threshold,
            AbortCondition::ErrorRateAbove(threshold) => sample.error_rate > threshold,
            AbortCondition::LatencyAbove(threshold) => sample.latency_ms > threshold,
            AbortCondition::ConsensusLost => !sample.consensus_capable,
        }
    }
}

impl fmt::Display for AbortCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCondition::HealthBelow(t) => write!(f, "health below {:.1}", t),
            AbortCondition::ErrorRateAbove(t) => write!(f, "error rate above {:.3}", t),
            AbortCondition::LatencyAbove(t) => write!(f, "latency above {} ms", t),
            AbortCondition::ConsensusLost => write!(f, "consensus lost"),
        }
    }
}

/// One health observation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSample {
    pub timestamp: DateTime<Utc>,
    pub health_score: f64,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub consensus_capable: bool,
    pub participating_nodes: usize,
    pub byzantine_nodes: usize,
}

impl From<ClusterHealth> for MonitorSample {
    fn from(health: ClusterHealth) -> Self {
        Self {
            timestamp: health.timestamp,
            health_score: health.health_score,
            latency_ms: health.latency_ms,
            error_rate: health.error_rate,
            consensus_capable: health.consensus_capable,
            participating_nodes: health.participating_nodes,
            byzantine_nodes: health.byzantine_nodes,
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Alert broadcast by the monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorAlert {
    pub experiment_id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub condition: Option<AbortCondition>,
    pub timestamp: DateTime<Utc>,
}

/// Result of one [`ExperimentMonitor::watch`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorOutcome {
    pub samples: Vec<MonitorSample>,
    /// Abort condition that ended the watch early
    pub triggered: Option<AbortCondition>,
    /// The watch was cancelled through its token
    pub cancelled: bool,
    #[serde(with = "bftlab_sim::utils::duration_ms")]
    pub elapsed: Duration,
}

impl MonitorOutcome {
    /// Mean health over the samples, `None` without samples
    pub fn mean_health(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|s| s.health_score).sum::<f64>() / self.samples.len() as f64)
    }

    pub fn consensus_continuous(&self) -> bool {
        self.samples.iter().all(|s| s.consensus_capable)
    }

    pub fn max_latency_ms(&self) -> u64 {
        self.samples.iter().map(|s| s.latency_ms).max().unwrap_or(0)
    }
}

/// Soft thresholds producing warnings
const WARN_HEALTH: f64 = 50.0;
const WARN_ERROR_RATE: f64 = 0.05;

/// Health sampler used while experiments run
#[derive(Clone)]
pub struct ExperimentMonitor {
    cluster: Arc<SimulatedCluster>,
    interval: Duration,
    alerts: broadcast::Sender<MonitorAlert>,
}

impl ExperimentMonitor {
    pub fn new(config: &HarnessConfig, cluster: Arc<SimulatedCluster>) -> Self {
        let (alerts, _) = broadcast::channel(config.alert_channel_capacity);
        Self {
            cluster,
            interval: config.monitor_interval(),
            alerts,
        }
    }

    /// Subscribe to monitor alerts
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<MonitorAlert> {
        self.alerts.subscribe()
    }

    pub async fn sample(&self) -> MonitorSample {
        self.cluster.health().await.into()
    }

    /// First condition met by `sample`
    pub fn evaluate(conditions: &[AbortCondition], sample: &MonitorSample) -> Option<AbortCondition> {
        conditions.iter().copied().find(|c| c.is_met(sample))
    }

    /// Sample until `duration` elapses, an abort condition fires or `cancel` is triggered
    pub async fn watch(
        &self,
        experiment_id: &str,
        conditions: &[AbortCondition],
        duration: Duration,
        cancel: CancellationToken,
    ) -> MonitorOutcome {
        let started = Instant::now();
        let deadline = started + duration;
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut samples = Vec::new();
        let mut triggered = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    let sample = self.sample().await;
                    self.warn_on_soft_thresholds(experiment_id, &sample);

                    if let Some(condition) = Self::evaluate(conditions, &sample) {
                        warn!(experiment = experiment_id, %condition, "abort condition met");
                        self.publish(MonitorAlert {
                            experiment_id: experiment_id.to_string(),
                            severity: AlertSeverity::Critical,
                            message: format!("Abort condition met: {}", condition),
                            condition: Some(condition),
                            timestamp: Utc::now(),
                        });
                        samples.push(sample);
                        triggered = Some(condition);
                        break;
                    }
                    samples.push(sample);
                }
            }
        }

        debug!(
            experiment = experiment_id,
            samples = samples.len(),
            cancelled,
            "monitoring finished"
        );

        MonitorOutcome {
            samples,
            triggered,
            cancelled,
            elapsed: started.elapsed(),
        }
    }

    fn warn_on_soft_thresholds(&self, experiment_id: &str, sample: &MonitorSample) {
        if sample.health_score < WARN_HEALTH {
            self.publish(MonitorAlert {
                experiment_id: experiment_id.to_string(),
                severity: AlertSeverity::Warning,
                message: format!("Cluster health degraded to {:.1}", sample.health_score),
                condition: None,
                timestamp: Utc::now(),
            });
        }
        if sample.error_rate > WARN_ERROR_RATE {
            self.publish(MonitorAlert {
                experiment_id: experiment_id.to_string(),
                severity: AlertSeverity::Warning,
                message: format!("Error rate at {:.1}%", sample.error_rate * 100.0),
                condition: None,
                timestamp: Utc::now(),
            });
        }
    }

    fn publish(&self, alert: MonitorAlert) {
        // No subscribers is not an error
        let _ = self.alerts.send(alert);
    }
}
