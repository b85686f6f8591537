//! Byzantine scenario and coordinated attack behavior over the shared cluster

use bftlab_harness::integration::{create_fast_harness, init_tracing};
use bftlab_harness::{AttackType, ByzantineScenario, FaultInjection, RiskLevel};
use bftlab_sim::{BehaviorType, ProtocolKind};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_pbft_tolerates_one_of_four() -> anyhow::Result<()> {
    init_tracing();
    let harness = create_fast_harness(7)?;

    let scenario = ByzantineScenario::new("pbft-4-1", 4, 1, ProtocolKind::Pbft)
        .with_behavior(BehaviorType::Equivocating);
    let result = harness.scenarios.execute_fault_injection_scenario(scenario).await;

    assert!(result.success, "recommendations: {:?}", result.recommendations);
    assert!(result.system_resilience.safety_maintained);
    assert!(result.system_resilience.liveness_maintained);
    assert_eq!(result.byzantine_percentage, 25.0);
    assert_eq!(result.consensus_results.len(), 10);
    assert!(result.error.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pbft_fails_with_two_of_four() -> anyhow::Result<()> {
    let harness = create_fast_harness(7)?;

    let scenario = ByzantineScenario::new("pbft-4-2", 4, 2, ProtocolKind::Pbft);
    let result = harness.scenarios.execute_fault_injection_scenario(scenario).await;

    assert!(!result.success);
    assert!(!result.system_resilience.safety_maintained);
    assert!(result
        .consensus_results
        .iter()
        .all(|round| !round.consensus_reached && round.safety_violation));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_coordinated_attack_within_tolerance() -> anyhow::Result<()> {
    let harness = create_fast_harness(11)?;
    harness.scenarios.initialize_cluster(10, ProtocolKind::Pbft).await?;

    let result = harness
        .scenarios
        .simulate_coordinated_attack(vec![0, 1, 2], AttackType::Coordinated, Duration::from_secs(10))
        .await;

    assert_eq!(result.byzantine_percentage, 30.0);
    assert_eq!(result.byzantine_nodes, vec![0, 1, 2]);
    assert!(result.success);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_coordinated_attack_beyond_tolerance() -> anyhow::Result<()> {
    let harness = create_fast_harness(11)?;
    harness.scenarios.initialize_cluster(6, ProtocolKind::Pbft).await?;

    let result = harness
        .scenarios
        .simulate_coordinated_attack(vec![0, 1, 2], AttackType::Lying, Duration::from_secs(10))
        .await;

    assert_eq!(result.byzantine_percentage, 50.0);
    assert!(!result.success);
    assert!(result.recommendations.iter().any(|r| r.contains("Critical")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_coordinated_attack_needs_initialized_cluster() -> anyhow::Result<()> {
    let harness = create_fast_harness(1)?;

    let result = harness
        .scenarios
        .simulate_coordinated_attack(vec![0], AttackType::Delay, Duration::from_secs(10))
        .await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(harness.scenarios.scenario_history().await.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalid_scenario_becomes_failed_result() -> anyhow::Result<()> {
    let harness = create_fast_harness(3)?;

    let result = harness
        .scenarios
        .execute_fault_injection_scenario(ByzantineScenario::new("bad", 4, 9, ProtocolKind::Raft))
        .await;

    assert!(!result.success);
    assert!(!result.system_resilience.safety_maintained);
    assert!(!result.system_resilience.liveness_maintained);
    assert!(!result.system_resilience.consensus_achieved);
    assert!(result.error.unwrap().contains("exceeds"));
    assert!(result.recommendations[0].contains("Investigate"));
    assert_eq!(harness.scenarios.scenario_history().await.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_scenario_latency_fault_breaks_liveness() -> anyhow::Result<()> {
    let harness = create_fast_harness(5)?;

    let scenario = ByzantineScenario::new("slow", 4, 0, ProtocolKind::Pbft)
        .with_faults(vec![FaultInjection::latency("slow-net", 6_000).with_auto_revert(false)]);
    let result = harness.scenarios.execute_fault_injection_scenario(scenario).await;

    assert!(result.system_resilience.safety_maintained);
    assert!(!result.system_resilience.liveness_maintained);
    assert!(!result.success);
    assert!(result.performance_impact.latency_increase > 100.0);
    assert_eq!(harness.injector.active_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_consensus_under_attack_and_restore() -> anyhow::Result<()> {
    let harness = create_fast_harness(9)?;
    harness.scenarios.initialize_cluster(7, ProtocolKind::Pbft).await?;

    let rounds = harness
        .scenarios
        .validate_consensus_under_attack(&[0, 1, 99], 5)
        .await?;
    assert_eq!(rounds.len(), 5);
    assert!(rounds.iter().all(|r| r.consensus_reached && !r.safety_violation));

    let byzantine = harness.scenarios.get_byzantine_node_status().await;
    assert_eq!(byzantine.len(), 2);
    assert!(byzantine.iter().all(|n| n.behavior_type == BehaviorType::Lying));

    let report = harness.scenarios.detect_byzantine_behavior().await;
    assert!(report.suspicious_nodes.contains(&0));
    assert!(report.detection_confidence > 0.0);

    assert!(harness.scenarios.restore_nodes(&[0, 1]).await);
    assert!(harness.scenarios.get_byzantine_node_status().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bft_report_over_scenarios() -> anyhow::Result<()> {
    let harness = create_fast_harness(13)?;

    for (id, byzantine) in [("ok", 1), ("broken", 2)] {
        let scenario = ByzantineScenario::new(id, 4, byzantine, ProtocolKind::Pbft);
        harness.scenarios.execute_fault_injection_scenario(scenario).await;
    }

    let report = harness.scenarios.generate_bft_report(None).await;
    assert_eq!(report.total_tests, 2);
    assert_eq!(report.successful_tests, 1);
    assert_eq!(report.overall_safety_score, 50.0);
    assert_eq!(report.tolerance.max_tested_percentage, 50.0);
    assert_eq!(report.tolerance.actual_tolerance_achieved, 0.0);
    assert!(!report.risks.high.is_empty());
    assert!(!report.risks.low.is_empty());
    assert!(!report.recommendations.immediate.is_empty());

    let history = harness.scenarios.scenario_history().await;
    assert_eq!(
        bftlab_harness::ResilienceAggregator::risk_tier(&history[1]),
        Some(RiskLevel::High)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_scenario_leaves_foreign_faults() -> anyhow::Result<()> {
    let harness = create_fast_harness(17)?;
    harness.scenarios.initialize_cluster(4, ProtocolKind::Pbft).await?;
    assert!(harness.injector.inject_fault(FaultInjection::latency("shared", 300)).await.success);

    let scenario = ByzantineScenario::new("overlap", 4, 0, ProtocolKind::Pbft).with_faults(vec![
        FaultInjection::latency("own", 200),
        FaultInjection::latency("shared", 200),
    ]);
    let result = harness.scenarios.execute_fault_injection_scenario(scenario).await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert!(!harness.injector.is_active("own"));
    assert!(harness.injector.is_active("shared"));
    assert!(harness.cluster.conditions().await.effects.contains_key("shared"));

    assert!(harness.injector.remove_fault("shared").await.success);
    assert!(harness.cluster.conditions().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_latency_impact_uses_configured_baseline() -> anyhow::Result<()> {
    let document = r#"
        round_interval_ms = 10
        baseline_latency_ms = 20000
    "#;
    let harness = bftlab_harness::integration::create_harness_from_toml(document)?;

    let scenario = ByzantineScenario::new("slow-baseline", 4, 0, ProtocolKind::Pbft)
        .with_faults(vec![FaultInjection::latency("slow-net", 6_000).with_auto_revert(false)]);
    let result = harness.scenarios.execute_fault_injection_scenario(scenario).await;

    // Rounds near 6.3 s stay under a 20 s baseline
    assert!(result.statistics.average_consensus_time_ms > 6_000.0);
    assert_eq!(result.performance_impact.latency_increase, 0.0);
    Ok(())
}
