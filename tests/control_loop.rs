mod common;

use common::{camera, camera_id, harness, test_config, CAMERA_IP, CAMERA_MAC};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;
use zsentinel::analyzer::FlowStatsCollector;
use zsentinel::identity::{CredentialStatus, DeviceDirectory, StaticInventory};
use zsentinel::models::{
    priority, AlertKind, AnomalyAlert, BehavioralBaseline, MatchFields, PolicyAction, Severity, TrustLevel,
};
use zsentinel::switch::{FlowAction, MemorySwitch, SwitchControl};

fn camera_flow(port: u16) -> MatchFields {
    MatchFields {
        eth_src: Some(CAMERA_MAC),
        ip_src: Some(CAMERA_IP.parse().unwrap()),
        ip_dst: Some("10.0.1.5".parse().unwrap()),
        ip_proto: Some(6),
        tcp_dst: Some(port),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_rate_spike_raises_dos_alert_and_denies() {
    let dir = tempdir().unwrap();
    let h = harness(test_config(dir.path()), vec![camera(CredentialStatus::Valid)], &["s1"]);
    h.coordinator
        .seed_baseline(BehavioralBaseline::with_rates(camera_id(), 10.0, 1_000_000.0));

    // 1200 paquets sur un premier cycle de 10 s : 120 pps, douze fois la référence
    h.switches[0].add_traffic(camera_flow(443), 1200, 1200 * 100);
    let alerts = h.coordinator.run_collection_cycle().await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Dos);
    assert_eq!(alerts[0].severity, Severity::High);
    assert!((alerts[0].ratio - 12.0).abs() < 0.5);

    let id = camera_id();
    assert_eq!(h.coordinator.trust_score(&id), Some(30));
    assert_eq!(h.coordinator.trust_level(&id), Some(TrustLevel::Suspicious));

    let decision = h.coordinator.current_decision(&id).unwrap();
    assert_eq!(decision.action, PolicyAction::Deny);
    let block = h.switches[0]
        .rules()
        .into_iter()
        .find(|rule| rule.priority == priority::DENY)
        .unwrap();
    assert_eq!(block.action, FlowAction::Drop);
    assert_eq!(block.match_fields.eth_src, Some(CAMERA_MAC));

    // Le profil est mis à jour après la détection
    assert_eq!(h.coordinator.baseline(&id).unwrap().samples, 1);
    assert_eq!(h.coordinator.recent_alerts(10).len(), 1);
}

#[tokio::test]
async fn test_score_at_quarantine_threshold_is_deny() {
    let dir = tempdir().unwrap();
    let h = harness(test_config(dir.path()), vec![camera(CredentialStatus::Valid)], &["s1"]);
    let id = camera_id();

    let score = h.coordinator.report_alert(manual_alert(Severity::High)).await;
    assert_eq!(score, 30);

    let decision = h.coordinator.current_decision(&id).unwrap();
    assert_eq!(decision.action, PolicyAction::Deny);
    assert_eq!(decision.trust_score, 30);
}

#[tokio::test]
async fn test_attestation_failure_quarantines() {
    let dir = tempdir().unwrap();
    let config = zsentinel::Config {
        initial_trust_score: 40,
        ..test_config(dir.path())
    };
    let h = harness(config, vec![camera(CredentialStatus::Revoked)], &["s1"]);
    let id = camera_id();

    let (passed, failed) = h.coordinator.run_attestation_cycle().await;
    assert_eq!((passed, failed), (0, 1));
    assert_eq!(h.coordinator.trust_score(&id), Some(20));

    let decision = h.coordinator.current_decision(&id).unwrap();
    assert_eq!(decision.action, PolicyAction::Quarantine);
    assert!(h.switches[0]
        .rules()
        .iter()
        .any(|rule| rule.priority == priority::QUARANTINE && rule.action == FlowAction::Drop));
    assert_eq!(h.coordinator.attestation_history(&id).len(), 1);
}

#[tokio::test]
async fn test_score_is_clamped_at_zero() {
    let dir = tempdir().unwrap();
    let h = harness(test_config(dir.path()), vec![camera(CredentialStatus::Valid)], &["s1"]);
    let id = camera_id();

    for _ in 0..3 {
        h.coordinator.report_alert(manual_alert(Severity::High)).await;
    }
    assert_eq!(h.coordinator.trust_score(&id), Some(0));

    let history = h.coordinator.trust_history(&id).await;
    assert_eq!(history.last().unwrap().score, 0);
    assert!(history.iter().all(|entry| entry.score <= 100));
    assert_eq!(h.coordinator.current_decision(&id).unwrap().action, PolicyAction::Quarantine);
}

#[tokio::test]
async fn test_counts_are_summed_across_switches() {
    let inventory = Arc::new(StaticInventory::new(vec![camera(CredentialStatus::Valid)]));
    let directory = Arc::new(DeviceDirectory::new(inventory, Duration::from_secs(1)));
    let s1 = Arc::new(MemorySwitch::new("s1"));
    let s2 = Arc::new(MemorySwitch::new("s2"));
    let collector = FlowStatsCollector::new(
        vec![s1.clone() as Arc<dyn SwitchControl>, s2.clone() as Arc<dyn SwitchControl>],
        directory,
        Duration::from_secs(60),
        Duration::from_secs(10),
        Duration::from_secs(1),
    );

    s1.add_traffic(camera_flow(443), 300, 30_000);
    s2.add_traffic(camera_flow(8883), 200, 20_000);
    let windows = collector.collect().await;

    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].device_id, camera_id());
    assert_eq!(windows[0].packet_count, 500);
    assert_eq!(windows[0].byte_count, 50_000);
    assert_eq!(windows[0].ports.len(), 2);
}

#[tokio::test]
async fn test_unreachable_switch_is_skipped() {
    let dir = tempdir().unwrap();
    let h = harness(test_config(dir.path()), vec![camera(CredentialStatus::Valid)], &["s1", "s2"]);
    h.switches[0].set_reachable(false);
    h.switches[1].add_traffic(camera_flow(443), 100, 10_000);

    let alerts = h.coordinator.run_collection_cycle().await;
    assert!(alerts.is_empty());
    // Premier profil construit à partir du commutateur joignable
    let baseline = h.coordinator.baseline(&camera_id()).unwrap();
    assert!((baseline.avg_pps - 10.0).abs() < 0.01);
}

#[tokio::test]
async fn test_good_behavior_rewarded_after_clean_interval() {
    let dir = tempdir().unwrap();
    let config = zsentinel::Config {
        good_behavior_interval_secs: 0,
        ..test_config(dir.path())
    };
    let h = harness(config, vec![camera(CredentialStatus::Valid)], &["s1"]);
    let id = camera_id();
    h.switches[0].add_traffic(camera_flow(443), 100, 10_000);

    // Le premier cycle propre ne fait que démarrer le délai
    assert!(h.coordinator.run_collection_cycle().await.is_empty());
    assert_eq!(h.coordinator.trust_score(&id), None);

    assert!(h.coordinator.run_collection_cycle().await.is_empty());
    assert_eq!(h.coordinator.trust_score(&id), Some(72));
}

fn manual_alert(severity: Severity) -> AnomalyAlert {
    AnomalyAlert {
        device_id: camera_id(),
        kind: AlertKind::Dos,
        severity,
        ratio: 0.0,
        indicators: Vec::new(),
        timestamp: SystemTime::now(),
    }
}
