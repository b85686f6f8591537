//! Resilience reports
//!
//! Aggregates stored scenario and experiment results over a time window. Both report
//! kinds default to the last 24 hours and filter on each result's start time.

use crate::experiment::{ExperimentResult, ExperimentStatus, ExperimentType};
use crate::scenario::ByzantineTestResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::BTreeMap;

/// Byzantine share a BFT protocol is expected to survive, percent
pub const THEORETICAL_TOLERANCE: f64 = 33.33;

const ONE_THIRD: f64 = 100.0 / 3.0;
const DETECTION_TARGET: f64 = 80.0;
const COVERAGE_TARGET: usize = 5;

/// Inclusive time window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` ending now
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - ChronoDuration::hours(hours),
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::last_hours(24)
    }
}

/// Tier of a finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToleranceAnalysis {
    pub theoretical_tolerance: f64,
    /// Highest tested Byzantine share, if a test at that share succeeded
    pub actual_tolerance_achieved: f64,
    pub max_tested_percentage: f64,
}

/// Findings bucketed by tier
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecommendationTiers {
    pub immediate: Vec<String>,
    pub short_term: Vec<String>,
    pub long_term: Vec<String>,
}

/// BFT report over scenario results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BftReport {
    pub generated_at: DateTime<Utc>,
    pub time_range: TimeRange,
    pub total_tests: usize,
    pub successful_tests: usize,
    /// Mean of the per-test 4x25 rubric
    pub average_resilience_score: f64,
    /// Percent of tests with safety maintained
    pub overall_safety_score: f64,
    /// Percent of tests with liveness maintained
    pub overall_liveness_score: f64,
    pub tolerance: ToleranceAnalysis,
    pub risks: RiskAssessment,
    pub recommendations: RecommendationTiers,
}

/// Chaos report over experiment results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChaosReport {
    pub generated_at: DateTime<Utc>,
    pub time_range: TimeRange,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub partial: usize,
    pub aborted: usize,
    pub success_rate: f64,
    pub recovery_rate: f64,
    pub average_recovery_time_ms: Option<f64>,
    pub p95_recovery_time_ms: Option<f64>,
    pub resilience_score: f64,
    pub by_type: BTreeMap<ExperimentType, usize>,
    pub recommendations: Vec<String>,
}

/// Stateless report builder
pub struct ResilienceAggregator;

impl ResilienceAggregator {
    /// 25 points each for safety, liveness, consensus and detection above 80%
    pub fn resilience_score(result: &ByzantineTestResult) -> f64 {
        let resilience = &result.system_resilience;
        [
            resilience.safety_maintained,
            resilience.liveness_maintained,
            resilience.consensus_achieved,
            resilience.byzantine_detection_rate > DETECTION_TARGET,
        ]
        .iter()
        .filter(|passed| **passed)
        .count() as f64
            * 25.0
    }

    /// Findings for one test, with their tier
    pub fn risk_findings(result: &ByzantineTestResult) -> Vec<(RiskLevel, String)> {
        let id = &result.scenario_id;
        let share = result.byzantine_percentage;
        let resilience = &result.system_resilience;
        let mut findings = Vec::new();

        if !result.success && share <= ONE_THIRD + 1e-9 {
            findings.push((
                RiskLevel::High,
                format!("{}: failed with {:.1}% Byzantine nodes, within BFT tolerance", id, share),
            ));
        }
        if !resilience.safety_maintained && result.error.is_none() {
            findings.push((RiskLevel::High, format!("{}: safety violated", id)));
        }
        if result.performance_impact.latency_increase > 100.0 {
            findings.push((
                RiskLevel::Medium,
                format!(
                    "{}: latency increased by {:.0}%",
                    id, result.performance_impact.latency_increase
                ),
            ));
        }
        if !result.byzantine_nodes.is_empty()
            && result.error.is_none()
            && resilience.byzantine_detection_rate < DETECTION_TARGET
        {
            findings.push((
                RiskLevel::Medium,
                format!(
                    "{}: detection rate {:.1}% below {:.0}%",
                    id, resilience.byzantine_detection_rate, DETECTION_TARGET
                ),
            ));
        }
        if !resilience.liveness_maintained && result.error.is_none() {
            findings.push((RiskLevel::Medium, format!("{}: liveness not maintained", id)));
        }
        if !result.success && share > ONE_THIRD + 1e-9 {
            findings.push((
                RiskLevel::Low,
                format!("{}: failed beyond tolerance at {:.1}% (expected)", id, share),
            ));
        }

        findings
    }

    /// Highest tier among a test's findings
    pub fn risk_tier(result: &ByzantineTestResult) -> Option<RiskLevel> {
        Self::risk_findings(result)
            .into_iter()
            .map(|(level, _)| level)
            .max()
    }

    pub fn generate_bft_report(results: &[ByzantineTestResult], range: Option<TimeRange>) -> BftReport {
        let time_range = range.unwrap_or_default();
        let tests: Vec<&ByzantineTestResult> = results
            .iter()
            .filter(|r| time_range.contains(r.start_time))
            .collect();
        let total = tests.len();

        let mean = |f: &dyn Fn(&ByzantineTestResult) -> f64| {
            if total == 0 {
                0.0
            } else {
                tests.iter().map(|r| f(*r)).sum::<f64>() / total as f64
            }
        };
        let pass_rate = |f: &dyn Fn(&ByzantineTestResult) -> bool| {
            bftlab_sim::utils::percentage(tests.iter().filter(|r| f(**r)).count(), total)
        };

        let average_resilience_score = mean(&Self::resilience_score);
        let overall_safety_score = pass_rate(&|r| r.system_resilience.safety_maintained);
        let overall_liveness_score = pass_rate(&|r| r.system_resilience.liveness_maintained);

        let max_tested = tests
            .iter()
            .map(|r| r.byzantine_percentage)
            .fold(0.0_f64, f64::max);
        let held_at_max = tests
            .iter()
            .any(|r| r.success && (r.byzantine_percentage - max_tested).abs() < 1e-9);
        let tolerance = ToleranceAnalysis {
            theoretical_tolerance: THEORETICAL_TOLERANCE,
            actual_tolerance_achieved: if total > 0 && held_at_max { max_tested } else { 0.0 },
            max_tested_percentage: max_tested,
        };

        let mut risks = RiskAssessment::default();
        let mut immediate = IndexSet::new();
        let mut short_term = IndexSet::new();
        for result in &tests {
            for (level, finding) in Self::risk_findings(result) {
                match level {
                    RiskLevel::High => {
                        immediate.insert(remedy(&finding));
                        risks.high.push(finding);
                    }
                    RiskLevel::Medium => {
                        short_term.insert(remedy(&finding));
                        risks.medium.push(finding);
                    }
                    RiskLevel::Low => risks.low.push(finding),
                }
            }
        }

        let mut long_term = vec![
            "Run Byzantine scenarios continuously as part of release validation".to_string(),
            "Track detection confidence and trust scores over time".to_string(),
        ];
        if total < COVERAGE_TARGET {
            long_term.push(format!(
                "Extend coverage to at least {} scenarios across protocols and behaviors",
                COVERAGE_TARGET
            ));
        }

        BftReport {
            generated_at: Utc::now(),
            time_range,
            total_tests: total,
            successful_tests: tests.iter().filter(|r| r.success).count(),
            average_resilience_score,
            overall_safety_score,
            overall_liveness_score,
            tolerance,
            risks,
            recommendations: RecommendationTiers {
                immediate: immediate.into_iter().collect(),
                short_term: short_term.into_iter().collect(),
                long_term,
            },
        }
    }

    pub fn generate_chaos_report(results: &[ExperimentResult], range: Option<TimeRange>) -> ChaosReport {
        let time_range = range.unwrap_or_default();
        let experiments: Vec<&ExperimentResult> = results
            .iter()
            .filter(|r| time_range.contains(r.start_time))
            .collect();
        let total = experiments.len();

        let count = |status: ExperimentStatus| experiments.iter().filter(|r| r.status == status).count();
        let successful = count(ExperimentStatus::Success);
        let failed = count(ExperimentStatus::Failure);
        let partial = count(ExperimentStatus::Partial);
        let aborted = count(ExperimentStatus::Aborted);
        let recovered = experiments
            .iter()
            .filter(|r| r.actual_behavior.recovered)
            .count();

        let recovery_times: Vec<f64> = experiments
            .iter()
            .filter_map(|r| r.actual_behavior.recovery_time)
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let average_recovery_time_ms = if recovery_times.is_empty() {
            None
        } else {
            Some(recovery_times.iter().sum::<f64>() / recovery_times.len() as f64)
        };
        let p95_recovery_time_ms = if recovery_times.is_empty() {
            None
        } else {
            Some(Data::new(recovery_times).percentile(95))
        };

        let mut by_type = BTreeMap::new();
        for result in &experiments {
            *by_type.entry(result.experiment_type).or_insert(0) += 1;
        }

        let success_rate = bftlab_sim::utils::percentage(successful, total);
        let recovery_rate = bftlab_sim::utils::percentage(recovered, total);

        let mut recommendations = Vec::new();
        if total == 0 {
            recommendations.push("Run chaos experiments to establish a resilience baseline".to_string());
        } else {
            if success_rate < 80.0 {
                recommendations.push(format!(
                    "Only {:.1}% of experiments succeeded; address the recorded violations",
                    success_rate
                ));
            }
            if recovery_rate < 90.0 {
                recommendations.push("Improve automated recovery; some experiments did not recover".to_string());
            }
            if aborted > 0 {
                recommendations.push(format!(
                    "{} experiment(s) hit abort conditions; reduce their blast radius",
                    aborted
                ));
            }
            if p95_recovery_time_ms.is_some_and(|p95| p95 > 60_000.0) {
                recommendations.push("Recovery p95 exceeds one minute; shorten failover paths".to_string());
            }
            if recommendations.is_empty() {
                recommendations.push("Increase experiment severity to probe deeper failure modes".to_string());
            }
        }

        ChaosReport {
            generated_at: Utc::now(),
            time_range,
            total,
            successful,
            failed,
            partial,
            aborted,
            success_rate,
            recovery_rate,
            average_recovery_time_ms,
            p95_recovery_time_ms,
            resilience_score: 0.6 * success_rate + 0.4 * recovery_rate,
            by_type,
            recommendations,
        }
    }
}

fn remedy(finding: &str) -> String {
    let scope = finding.split(": ").nth(1).unwrap_or(finding);
    if scope.contains("within BFT tolerance") || scope.contains("safety violated") {
        "Review quorum and vote validation; the protocol failed inside its tolerance".to_string()
    } else if scope.contains("latency") {
        "Profile message paths and raise timeouts for degraded networks".to_string()
    } else if scope.contains("detection") {
        "Add evidence sources to Byzantine detection".to_string()
    } else if scope.contains("liveness") {
        "Tune view-change and leader-election timeouts".to_string()
    } else {
        format!("Investigate: {}", finding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ActualBehavior;
    use crate::scenario::{PerformanceImpact, SystemResilience};
    use bftlab_sim::{ConsensusStatistics, ProtocolKind};
    use std::time::Duration;

    fn test_result(id: &str, share: f64, safety: bool, liveness: bool, detection: f64) -> ByzantineTestResult {
        let success = safety && liveness;
        ByzantineTestResult {
            scenario_id: id.to_string(),
            protocol: ProtocolKind::Pbft,
            success,
            start_time: Utc::now(),
            end_time: Utc::now(),
            total_nodes: 10,
            byzantine_nodes: vec![0, 1, 2],
            byzantine_percentage: share,
            consensus_results: Vec::new(),
            statistics: ConsensusStatistics::default(),
            system_resilience: SystemResilience {
                safety_maintained: safety,
                liveness_maintained: liveness,
                consensus_achieved: success,
                byzantine_detection_rate: detection,
            },
            performance_impact: PerformanceImpact::default(),
            error: None,
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn test_resilience_rubric() {
        assert_eq!(ResilienceAggregator::resilience_score(&test_result("a", 25.0, true, true, 90.0)), 100.0);
        assert_eq!(ResilienceAggregator::resilience_score(&test_result("b", 25.0, true, true, 50.0)), 75.0);
        assert_eq!(ResilienceAggregator::resilience_score(&test_result("c", 50.0, false, true, 50.0)), 25.0);
    }

    #[test]
    fn test_empty_window() {
        let report = ResilienceAggregator::generate_bft_report(&[], None);
        assert_eq!(report.total_tests, 0);
        assert_eq!(report.average_resilience_score, 0.0);
        assert_eq!(report.tolerance.actual_tolerance_achieved, 0.0);
        assert!(report.recommendations.immediate.is_empty());
        assert!(report.recommendations.short_term.is_empty());
        assert!(!report.recommendations.long_term.is_empty());
    }

    #[test]
    fn test_risk_tiers() {
        let inside = test_result("inside", 25.0, false, true, 90.0);
        assert_eq!(ResilienceAggregator::risk_tier(&inside), Some(RiskLevel::High));

        let beyond = test_result("beyond", 50.0, true, false, 90.0);
        let findings = ResilienceAggregator::risk_findings(&beyond);
        assert!(findings.iter().any(|(l, _)| *l == RiskLevel::Low));
        assert_eq!(ResilienceAggregator::risk_tier(&beyond), Some(RiskLevel::Medium));

        let clean = test_result("clean", 20.0, true, true, 95.0);
        assert_eq!(ResilienceAggregator::risk_tier(&clean), None);
    }

    #[test]
    fn test_tolerance_achieved() {
        let results = vec![
            test_result("a", 25.0, true, true, 90.0),
            test_result("b", 30.0, true, true, 90.0),
            test_result("c", 50.0, false, true, 90.0),
        ];
        let report = ResilienceAggregator::generate_bft_report(&results, None);
        assert_eq!(report.tolerance.max_tested_percentage, 50.0);
        assert_eq!(report.tolerance.actual_tolerance_achieved, 0.0);

        let report = ResilienceAggregator::generate_bft_report(&results[..2], None);
        assert_eq!(report.tolerance.actual_tolerance_achieved, 30.0);
        assert_eq!(report.overall_safety_score, 100.0);
    }

    #[test]
    fn test_window_filters_old_results() {
        let mut old = test_result("old", 25.0, true, true, 90.0);
        old.start_time = Utc::now() - ChronoDuration::hours(48);
        let report = ResilienceAggregator::generate_bft_report(&[old], None);
        assert_eq!(report.total_tests, 0);
    }

    fn experiment(status: ExperimentStatus, recovery_ms: Option<u64>) -> ExperimentResult {
        ExperimentResult {
            experiment_id: "e".to_string(),
            experiment_name: "e".to_string(),
            experiment_type: ExperimentType::NodeFailure,
            status,
            start_time: Utc::now(),
            end_time: Utc::now(),
            actual_behavior: ActualBehavior {
                recovered: recovery_ms.is_some(),
                recovery_time: recovery_ms.map(Duration::from_millis),
                ..ActualBehavior::default()
            },
            metrics: Default::default(),
            faults_injected: Vec::new(),
            violations: Vec::new(),
            lessons_learned: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn test_chaos_report_rollup() {
        let results = vec![
            experiment(ExperimentStatus::Success, Some(1_000)),
            experiment(ExperimentStatus::Success, Some(3_000)),
            experiment(ExperimentStatus::Aborted, None),
            experiment(ExperimentStatus::Failure, None),
        ];
        let report = ResilienceAggregator::generate_chaos_report(&results, None);
        assert_eq!(report.total, 4);
        assert_eq!(report.success_rate, 50.0);
        assert_eq!(report.recovery_rate, 50.0);
        assert_eq!(report.resilience_score, 50.0);
        assert_eq!(report.average_recovery_time_ms, Some(2_000.0));
        assert_eq!(report.by_type.get(&ExperimentType::NodeFailure), Some(&4));
        assert!(report.recommendations.iter().any(|r| r.contains("abort")));
    }
}
