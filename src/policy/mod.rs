//! Moteur de décision de politique
//!
//! La décision ne dépend que du score de confiance et du niveau de menace.
//! Elle est recalculée à chaque changement de score notable et lors du
//! balayage périodique, puis transmise au traducteur.

pub mod rules;
pub mod translator;

use crate::analyzer::AlertLog;
use crate::config::TrustThresholds;
use crate::logger::EventJournal;
use crate::models::{AnomalyAlert, DeviceId, PolicyAction, PolicyDecision, ThreatLevel};
use crate::threat::ThreatBoard;
use crate::trust::{TrustChange, TrustSubscriber};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub use rules::{least_privilege_rules, PolicyRule, RuleAction};
pub use translator::{EnforcementFailure, RedirectOutcome, RedirectState, SdnPolicyTranslator};

/// Calcule l'action pour un équipement, règles évaluées dans l'ordre
///
/// Les alertes récentes ne modifient pas l'action : leur effet passe déjà par
/// le score de confiance. Elles ne sont comptées que pour l'audit.
pub fn decide(
    trust: u8,
    threat: ThreatLevel,
    _recent_alerts: &[AnomalyAlert],
    thresholds: &TrustThresholds,
) -> (PolicyAction, &'static str) {
    if threat == ThreatLevel::Critical {
        return (PolicyAction::Quarantine, "menace critique");
    }
    if threat == ThreatLevel::High {
        return if trust >= thresholds.restricted {
            (PolicyAction::Redirect, "menace élevée, confiance suffisante pour observation")
        } else {
            (PolicyAction::Quarantine, "menace élevée et confiance insuffisante")
        };
    }
    if trust < thresholds.quarantine {
        return (PolicyAction::Quarantine, "confiance sous le seuil de quarantaine");
    }
    if trust < thresholds.restricted {
        return (PolicyAction::Deny, "confiance sous le seuil restreint");
    }
    if threat == ThreatLevel::Medium {
        return (PolicyAction::Redirect, "menace moyenne");
    }
    if trust < thresholds.trusted {
        return (PolicyAction::Redirect, "confiance sous le seuil de confiance");
    }
    (PolicyAction::Allow, "équipement de confiance")
}

pub struct PolicyEngine {
    threats: Arc<ThreatBoard>,
    alerts: Arc<AlertLog>,
    translator: Arc<SdnPolicyTranslator>,
    thresholds: TrustThresholds,
    journal: Arc<EventJournal>,
    /// Fenêtre des alertes comptées dans une décision
    alert_window: Duration,
    history_limit: usize,
    decisions: DashMap<DeviceId, VecDeque<PolicyDecision>>,
}

impl PolicyEngine {
    pub fn new(
        threats: Arc<ThreatBoard>,
        alerts: Arc<AlertLog>,
        translator: Arc<SdnPolicyTranslator>,
        thresholds: TrustThresholds,
        journal: Arc<EventJournal>,
        alert_window: Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            threats,
            alerts,
            translator,
            thresholds,
            journal,
            alert_window,
            history_limit,
            decisions: DashMap::new(),
        }
    }

    /// Décide et applique l'action pour un équipement
    ///
    /// La décision est toujours enregistrée, même identique à la précédente.
    /// Un échec d'installation est journalisé par le traducteur et ne remet
    /// pas la décision en cause.
    pub async fn evaluate(&self, device_id: &DeviceId, trust_score: u8) -> PolicyDecision {
        let threat = self.threats.level(device_id);
        let since = SystemTime::now()
            .checked_sub(self.alert_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let recent = self.alerts.for_device(device_id, since);
        let (action, reason) = decide(trust_score, threat, &recent, &self.thresholds);

        let decision = PolicyDecision {
            device_id: device_id.clone(),
            action,
            reason: reason.to_string(),
            timestamp: SystemTime::now(),
            trust_score,
            threat_level: threat,
            recent_alerts: recent.len(),
        };
        self.record(&decision);

        if let Err(e) = self.translator.apply_action(device_id, action, reason).await {
            error!("Impossible d'appliquer {} à {}: {}", action, device_id, e);
        }
        decision
    }

    fn record(&self, decision: &PolicyDecision) {
        debug!("Décision pour {}: {}", decision.device_id, decision.action);
        self.journal.log_decision(decision);
        let mut history = self.decisions.entry(decision.device_id.clone()).or_default();
        history.push_back(decision.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    pub fn current_decision(&self, device_id: &DeviceId) -> Option<PolicyDecision> {
        self.decisions
            .get(device_id)
            .and_then(|history| history.back().cloned())
    }

    /// Décisions de l'équipement, de la plus ancienne à la plus récente
    pub fn decision_history(&self, device_id: &DeviceId) -> Vec<PolicyDecision> {
        self.decisions
            .get(device_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn translator(&self) -> &Arc<SdnPolicyTranslator> {
        &self.translator
    }
}

#[async_trait]
impl TrustSubscriber for PolicyEngine {
    async fn on_trust_change(&self, change: &TrustChange) {
        self.evaluate(&change.device_id, change.new_score).await;
    }
}
