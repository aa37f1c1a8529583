//! Boucle de retour de l'environnement leurre
//!
//! Lit les nouveaux événements, les rattache aux équipements et transforme les
//! sources confirmées en règles de mitigation.

pub mod intel;
pub mod parser;
pub mod source;

use crate::error::MappingError;
use crate::identity::DeviceDirectory;
use crate::logger::EventJournal;
use crate::models::{DeviceId, MitigationKind, MitigationRule, Severity};
use crate::policy::SdnPolicyTranslator;
use crate::threat::ThreatBoard;
use crate::trust::TrustScoreEngine;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

pub use intel::{IntelStats, SourceThreat, ThreatIntel, UnattributedEvent};
pub use parser::{classify, parse_line, DeceptionEvent, DeceptionEventKind};
pub use source::{DeceptionSource, JsonLogTail};

/// Bilan d'une lecture du journal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub lines: usize,
    pub skipped: usize,
    pub attributed: usize,
    pub unattributed: usize,
    pub rules_installed: usize,
}

fn rank(kind: MitigationKind) -> u8 {
    match kind {
        MitigationKind::Monitor => 0,
        MitigationKind::Redirect => 1,
        MitigationKind::Deny => 2,
    }
}

/// Sévérité de l'alerte de confiance associée à une règle
fn rule_severity(kind: MitigationKind) -> Option<Severity> {
    match kind {
        MitigationKind::Deny => Some(Severity::High),
        MitigationKind::Redirect => Some(Severity::Medium),
        MitigationKind::Monitor => None,
    }
}

pub struct DeceptionFeedbackLoop {
    source: Arc<dyn DeceptionSource>,
    directory: Arc<DeviceDirectory>,
    translator: Arc<SdnPolicyTranslator>,
    trust: Arc<TrustScoreEngine>,
    threats: Arc<ThreatBoard>,
    journal: Arc<EventJournal>,
    intel: ThreatIntel,
    destructive: Vec<String>,
}

impl DeceptionFeedbackLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn DeceptionSource>,
        directory: Arc<DeviceDirectory>,
        translator: Arc<SdnPolicyTranslator>,
        trust: Arc<TrustScoreEngine>,
        threats: Arc<ThreatBoard>,
        journal: Arc<EventJournal>,
        intel: ThreatIntel,
        destructive: Vec<String>,
    ) -> Self {
        Self {
            source,
            directory,
            translator,
            trust,
            threats,
            journal,
            intel,
            destructive,
        }
    }

    pub fn intel(&self) -> &ThreatIntel {
        &self.intel
    }

    /// Traite les événements ajoutés depuis la lecture précédente
    ///
    /// La lecture s'interrompt entre deux lignes dès que `stop` passe à vrai.
    pub async fn scan(&self, stop: &watch::Receiver<bool>) -> ScanSummary {
        let mut summary = ScanSummary::default();
        let lines = match self.source.read_new().await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Lecture du journal leurre impossible: {}", e);
                return summary;
            }
        };

        let total = lines.len();
        for line in lines {
            if *stop.borrow() {
                warn!("Arrêt demandé: {} ligne(s) du journal leurre non traitée(s)", total - summary.lines);
                break;
            }
            summary.lines += 1;
            let event = match parse_line(&line) {
                Ok(event) => event,
                Err(e) => {
                    debug!("Entrée leurre ignorée: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let device_id = self.attribute(&event).await;
            if device_id.is_some() {
                summary.attributed += 1;
            } else {
                summary.unattributed += 1;
            }
            if self.handle(&event, device_id).await {
                summary.rules_installed += 1;
            }
            self.evict_stale().await;
        }

        if summary.lines > 0 {
            info!(
                "Journal leurre: {} ligne(s), {} attribuée(s), {} non attribuée(s), {} ignorée(s), {} règle(s)",
                summary.lines, summary.attributed, summary.unattributed, summary.skipped, summary.rules_installed
            );
        }
        summary
    }

    async fn attribute(&self, event: &DeceptionEvent) -> Option<DeviceId> {
        match self.directory.resolve_ip(event.source).await {
            Ok(id) => Some(id),
            Err(MappingError::Unknown(_)) => None,
            Err(e) => {
                warn!("Impossible de rattacher {} à un équipement: {}", event.source, e);
                None
            }
        }
    }

    /// Renvoie vrai si une règle a été installée ou renforcée
    async fn handle(&self, event: &DeceptionEvent, device_id: Option<DeviceId>) -> bool {
        let severity = classify(event, &self.destructive);
        let state = self.intel.record(event, severity, device_id.as_ref());

        match &device_id {
            Some(id) => {
                let level = self.threats.raise_from_deception(id, severity);
                debug!("Menace de {} portée à {} ({})", id, level, event.describe());
            }
            None => self.journal.log_unattributed(event.source, &event.describe()),
        }

        let kind = self.intel.mitigation_kind(&state);
        let current = state.rule.map(rank);
        if kind == MitigationKind::Monitor && current.is_some() {
            return false;
        }
        if current.map(|rank_now| rank(kind) <= rank_now).unwrap_or(false) {
            return false;
        }

        let rule = self.intel.mitigation_for(&state);
        if let Err(e) = self.translator.install_mitigation(&rule).await {
            error!("Mitigation {} non appliquée: {}", rule.id, e);
            return false;
        }
        self.intel.set_rule(event.source, kind);

        if let Some(previous) = state.rule {
            self.supersede(&rule, previous).await;
        }

        if let (Some(id), Some(alert)) = (&device_id, rule_severity(kind)) {
            self.trust.record_alert(id, alert, "environnement leurre").await;
        }
        kind != MitigationKind::Monitor
    }

    /// Oublie les sources au-delà de la capacité et retire leurs règles
    async fn evict_stale(&self) {
        for threat in self.intel.prune() {
            let Some(kind) = threat.rule else {
                continue;
            };
            if kind != MitigationKind::Monitor {
                warn!("Source {} évincée malgré une règle {:?}", threat.source, kind);
            }
            let rule_id = MitigationRule::new(kind, threat.source, None, String::new()).id;
            self.translator.withdraw_mitigation(&rule_id).await;
        }
    }

    async fn supersede(&self, rule: &MitigationRule, previous: MitigationKind) {
        if previous == rule.kind {
            return;
        }
        let previous_id = MitigationRule::new(previous, rule.source, None, String::new()).id;
        if self.translator.withdraw_mitigation(&previous_id).await {
            info!("Mitigation {} remplacée par {}", previous_id, rule.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::identity::{CredentialStatus, InventoryEntry, StaticInventory};
    use crate::models::{Device, DeviceStatus, ThreatLevel};
    use crate::switch::{MemorySwitch, SwitchControl};
    use crate::trust::{JsonTrustStore, TrustSettings};
    use async_trait::async_trait;
    use pnet::util::MacAddr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Lines(Mutex<Vec<String>>);

    #[async_trait]
    impl DeceptionSource for Lines {
        async fn read_new(&self) -> Result<Vec<String>, SourceError> {
            Ok(std::mem::take(&mut *self.0.lock().unwrap()))
        }
    }

    struct Fixture {
        feedback: DeceptionFeedbackLoop,
        lines: Arc<Lines>,
        switch: Arc<MemorySwitch>,
        trust: Arc<TrustScoreEngine>,
        threats: Arc<ThreatBoard>,
        translator: Arc<SdnPolicyTranslator>,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        fixture_with_capacity(dir, 100)
    }

    fn fixture_with_capacity(dir: &std::path::Path, capacity: usize) -> Fixture {
        let inventory = Arc::new(StaticInventory::new(vec![InventoryEntry {
            device: Device {
                id: DeviceId::from("cam-1"),
                mac: MacAddr::new(0xaa, 0, 0, 0, 0, 1),
                ip: Some("10.0.0.11".parse().unwrap()),
                status: DeviceStatus::Active,
            },
            credential: CredentialStatus::Valid,
        }]));
        let directory = Arc::new(DeviceDirectory::new(inventory, Duration::from_secs(1)));
        let journal = Arc::new(EventJournal::log_only());
        let switch = Arc::new(MemorySwitch::new("s1"));
        let translator = Arc::new(SdnPolicyTranslator::new(
            vec![switch.clone() as Arc<dyn SwitchControl>],
            directory.clone(),
            journal.clone(),
            3,
            Duration::from_secs(1),
            Duration::from_millis(1),
        ));
        let trust = Arc::new(TrustScoreEngine::new(
            TrustSettings::default(),
            Arc::new(JsonTrustStore::new(dir)),
            journal.clone(),
        ));
        let threats = Arc::new(ThreatBoard::new());
        let lines = Arc::new(Lines(Mutex::new(Vec::new())));
        let feedback = DeceptionFeedbackLoop::new(
            lines.clone(),
            directory,
            translator.clone(),
            trust.clone(),
            threats.clone(),
            journal,
            ThreatIntel::new(3, 5, capacity),
            vec!["rm".to_string()],
        );
        Fixture {
            feedback,
            lines,
            switch,
            trust,
            threats,
            translator,
        }
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn push(fixture: &Fixture, lines: &[&str]) {
        fixture.lines.0.lock().unwrap().extend(lines.iter().map(|l| l.to_string()));
    }

    #[tokio::test]
    async fn test_attributed_login_success_denies_and_alerts() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        push(&f, &[r#"{"eventid":"cowrie.login.success","src_ip":"10.0.0.11","username":"root"}"#]);

        let summary = f.feedback.scan(&running()).await;
        assert_eq!(summary.attributed, 1);
        assert_eq!(summary.rules_installed, 1);

        let id = DeviceId::from("cam-1");
        assert_eq!(f.trust.score(&id), Some(30));
        assert_eq!(f.threats.level(&id), ThreatLevel::High);
        let rules = f.translator.mitigation_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].kind, MitigationKind::Deny);
        assert_eq!(rules[0].device_id, Some(id));
        assert_eq!(f.switch.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_unattributed_events_kept_without_trust_effect() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        push(
            &f,
            &[
                r#"{"eventid":"cowrie.login.failed","src_ip":"203.0.113.9","username":"admin"}"#,
                "garbage without address",
            ],
        );

        let summary = f.feedback.scan(&running()).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.unattributed, 1);
        assert_eq!(summary.rules_installed, 0);
        assert_eq!(f.feedback.intel().stats().unattributed_events, 1);
        assert!(f.trust.records().is_empty());
    }

    #[tokio::test]
    async fn test_sustained_commands_redirect_then_deny() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        let ls = r#"{"eventid":"cowrie.command.input","src_ip":"203.0.113.7","input":"ls"}"#;
        push(&f, &[ls, ls, ls]);
        f.feedback.scan(&running()).await;

        let rules = f.translator.mitigation_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].kind, MitigationKind::Redirect);

        push(&f, &[r#"{"eventid":"cowrie.command.input","src_ip":"203.0.113.7","input":"rm -rf /"}"#]);
        f.feedback.scan(&running()).await;
        let rules = f.translator.mitigation_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].kind, MitigationKind::Deny);
        assert_eq!(f.switch.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_source_tracking_is_bounded() {
        let dir = tempdir().unwrap();
        let f = fixture_with_capacity(dir.path(), 2);
        let lines: Vec<String> = (1..=6)
            .map(|i| format!(r#"{{"eventid":"cowrie.login.failed","src_ip":"203.0.113.{}","username":"admin"}}"#, i))
            .collect();
        push(&f, &lines.iter().map(String::as_str).collect::<Vec<_>>());

        let summary = f.feedback.scan(&running()).await;
        assert_eq!(summary.unattributed, 6);
        assert_eq!(f.feedback.intel().stats().sources, 2);
        // Les règles de surveillance des sources oubliées sont retirées
        assert_eq!(f.translator.mitigation_rules().len(), 2);
        assert!(f.feedback.intel().source(&"203.0.113.6".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_scan_stops_between_lines() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        push(&f, &[r#"{"eventid":"cowrie.login.success","src_ip":"10.0.0.11","username":"root"}"#]);

        let (_stop, stopped) = watch::channel(true);
        let summary = f.feedback.scan(&stopped).await;
        assert_eq!(summary.lines, 0);
        assert!(f.translator.mitigation_rules().is_empty());
        assert!(f.trust.records().is_empty());
    }
}
