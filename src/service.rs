//! Coordinateur des boucles périodiques
//!
//! Chaque boucle est une tâche indépendante qui s'arrête sur le signal
//! d'arrêt partagé. Les boucles ne partagent que les magasins par équipement.

use crate::analyzer::{detect, AlertLog, BaselineStore, FlowStatsCollector};
use crate::config::Config;
use crate::deception::{DeceptionFeedbackLoop, DeceptionSource, IntelStats, ScanSummary, ThreatIntel, UnattributedEvent};
use crate::error::{ConfigError, InstallError};
use crate::identity::{DeviceDirectory, IdentityProvider};
use crate::logger::EventJournal;
use crate::models::{
    AnomalyAlert, BehavioralBaseline, DeviceId, FlowWindowStats, MitigationRule, PolicyDecision, ThreatLevel,
    TrustHistoryEntry, TrustLevel,
};
use crate::policy::{least_privilege_rules, EnforcementFailure, PolicyEngine, RedirectState, SdnPolicyTranslator};
use crate::switch::SwitchControl;
use crate::threat::{FlowFeatures, ThreatBoard, ThreatClassifier};
use crate::trust::{AttestationRecord, AttestationScheduler, TrustScoreEngine, TrustSettings, TrustStore};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Collaborateurs externes du cœur
pub struct Collaborators {
    pub switches: Vec<Arc<dyn SwitchControl>>,
    pub identity: Arc<dyn IdentityProvider>,
    pub deception: Arc<dyn DeceptionSource>,
    pub trust_store: Arc<dyn TrustStore>,
    pub classifier: Option<Arc<dyn ThreatClassifier>>,
}

/// État de santé exposé à la couche de présentation
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub running: bool,
    pub switches: usize,
    pub persistence_degraded: bool,
    pub pending_writes: usize,
    pub standing_alerts: Vec<EnforcementFailure>,
}

pub struct Coordinator {
    config: Config,
    journal: Arc<EventJournal>,
    directory: Arc<DeviceDirectory>,
    collector: FlowStatsCollector,
    baselines: BaselineStore,
    alerts: Arc<AlertLog>,
    trust: Arc<TrustScoreEngine>,
    attestation: AttestationScheduler,
    threats: Arc<ThreatBoard>,
    translator: Arc<SdnPolicyTranslator>,
    policy: Arc<PolicyEngine>,
    deception: DeceptionFeedbackLoop,
    classifier: Option<Arc<dyn ThreatClassifier>>,
    /// Dernier bonus de bon comportement, ou dernière alerte
    last_reward: DashMap<DeviceId, SystemTime>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Coordinator {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let journal = Arc::new(EventJournal::new_with_mode(config.journal_file.clone(), config.log_mode));
        Ok(Self::with_journal(config, collaborators, journal))
    }

    /// Variante sans fichier de journal, les événements passent par `log`
    pub fn new_log_only(config: Config, collaborators: Collaborators) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::with_journal(config, collaborators, Arc::new(EventJournal::log_only())))
    }

    fn with_journal(config: Config, collaborators: Collaborators, journal: Arc<EventJournal>) -> Arc<Self> {
        let call_timeout = config.poll_timeout();
        let directory = Arc::new(DeviceDirectory::new(collaborators.identity, call_timeout));

        let collector = FlowStatsCollector::new(
            collaborators.switches.clone(),
            directory.clone(),
            config.observation_window(),
            config.poll_interval(),
            call_timeout,
        );
        let baselines = BaselineStore::new(config.ema_alpha, config.baseline_top_n);
        let alerts = Arc::new(AlertLog::new(config.recent_alert_capacity));
        let trust = Arc::new(TrustScoreEngine::new(
            TrustSettings::from_config(&config),
            collaborators.trust_store,
            journal.clone(),
        ));
        let attestation = AttestationScheduler::new(
            directory.clone(),
            trust.clone(),
            alerts.clone(),
            config.liveness_grace(),
            call_timeout,
        );
        let threats = Arc::new(ThreatBoard::new());
        let translator = Arc::new(SdnPolicyTranslator::new(
            collaborators.switches,
            directory.clone(),
            journal.clone(),
            config.honeypot_port,
            call_timeout,
            config.install_retry_backoff(),
        ));
        let policy = Arc::new(PolicyEngine::new(
            threats.clone(),
            alerts.clone(),
            translator.clone(),
            config.trust_thresholds,
            journal.clone(),
            config.observation_window(),
            config.decision_history_limit,
        ));
        trust.subscribe(policy.clone());

        let deception = DeceptionFeedbackLoop::new(
            collaborators.deception,
            directory.clone(),
            translator.clone(),
            trust.clone(),
            threats.clone(),
            journal.clone(),
            ThreatIntel::new(
                u64::from(config.sustained_medium_events),
                u64::from(config.event_burst_threshold),
                config.intelligence_capacity,
            ),
            config.destructive_commands.clone(),
        );

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            journal,
            directory,
            collector,
            baselines,
            alerts,
            trust,
            attestation,
            threats,
            translator,
            policy,
            deception,
            classifier: collaborators.classifier,
            last_reward: DashMap::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Démarre toutes les boucles périodiques
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Le coordinateur est déjà en cours d'exécution");
            return;
        }
        self.shutdown.send_replace(false);
        self.trust.restore_all().await;

        let handles = vec![
            self.spawn_loop("collecte", self.config.poll_interval(), |c| async move {
                c.run_collection_cycle().await;
            }),
            self.spawn_loop("attestation", self.config.attestation_interval(), |c| async move {
                c.run_attestation_cycle().await;
            }),
            self.spawn_loop("politique", self.config.policy_sweep_interval(), |c| async move {
                c.run_policy_sweep().await;
            }),
            self.spawn_loop("leurre", self.config.deception_scan_interval(), |c| async move {
                c.run_deception_scan().await;
            }),
            self.spawn_loop("persistance", self.config.persistence_retry_interval(), |c| async move {
                c.run_persistence_retry().await;
            }),
        ];
        self.tasks.lock().await.extend(handles);
        info!(
            "Coordinateur démarré: {} commutateur(s), collecte toutes les {}s",
            self.collector.switch_count(),
            self.config.poll_interval_secs
        );
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, cycle: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let coordinator = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                cycle(coordinator.clone()).await;
            }
            debug!("Boucle {} arrêtée", name);
        })
    }

    /// Arrête les boucles et attend la fin des cycles en cours
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Une boucle s'est terminée anormalement: {}", e);
            }
        }

        let remaining = self.trust.retry_pending().await;
        if remaining > 0 {
            warn!("{} score(s) de confiance non persisté(s) à l'arrêt", remaining);
        }
        info!("Coordinateur arrêté");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Vrai dès que l'arrêt est demandé ; les cycles par équipement s'interrompent
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Collecte, détection et bonus de bon comportement
    pub async fn run_collection_cycle(&self) -> Vec<AnomalyAlert> {
        let windows = self.collector.collect().await;
        let mut raised = Vec::new();

        for stats in windows {
            if self.stopping() {
                debug!("Arrêt demandé, fin anticipée de la collecte");
                break;
            }
            let alert = self
                .baselines
                .get(&stats.device_id)
                .and_then(|baseline| detect(&stats, &baseline));
            self.baselines.observe(&stats);

            if let Some(classifier) = &self.classifier {
                self.classify(classifier.as_ref(), &stats).await;
            }

            match alert {
                Some(alert) => {
                    self.report_alert(alert.clone()).await;
                    raised.push(alert);
                }
                None => self.reward(&stats.device_id).await,
            }
        }
        raised
    }

    async fn classify(&self, classifier: &dyn ThreatClassifier, stats: &FlowWindowStats) {
        let features = FlowFeatures::from(stats);
        let verdict = match timeout(self.config.poll_timeout(), classifier.classify(&features)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!("Classificateur indisponible pour {}: {}", stats.device_id, e);
                return;
            }
            Err(_) => {
                warn!("Délai dépassé lors de la classification de {}", stats.device_id);
                return;
            }
        };

        let before = self.threats.level(&stats.device_id);
        let after = self.threats.record_classification(&stats.device_id, &verdict);
        if after != before {
            info!(
                "Menace de {} passée de {} à {} ({})",
                stats.device_id, before, after, verdict.attack_type
            );
            self.trust.reevaluate(&stats.device_id).await;
        }
    }

    /// Bonus accordé après un intervalle complet sans alerte
    async fn reward(&self, device_id: &DeviceId) {
        let now = SystemTime::now();
        let last = self.last_reward.get(device_id).map(|at| *at);
        let due = match last {
            Some(at) => now
                .duration_since(at)
                .map(|age| age >= self.config.good_behavior_interval())
                .unwrap_or(false),
            None => {
                self.last_reward.insert(device_id.clone(), now);
                false
            }
        };
        if due {
            self.last_reward.insert(device_id.clone(), now);
            self.trust.record_good_behavior(device_id).await;
        }
    }

    pub async fn run_attestation_cycle(&self) -> (usize, usize) {
        self.attestation.run_cycle(&self.shutdown.subscribe()).await
    }

    /// Réévalue la politique de chaque équipement enrôlé
    pub async fn run_policy_sweep(&self) -> usize {
        let roster = self.directory.roster().await;
        let mut swept = 0;
        for device_id in &roster {
            if self.stopping() {
                debug!("Arrêt demandé, balayage interrompu après {} équipement(s)", swept);
                break;
            }
            self.trust.reevaluate(device_id).await;
            swept += 1;

            if self.config.enforce_least_privilege {
                if let Err(e) = self.install_least_privilege(device_id).await {
                    warn!("Politique de moindre privilège non appliquée à {}: {}", device_id, e);
                }
            }
        }
        debug!("Balayage de politique terminé: {} équipement(s)", swept);
        swept
    }

    pub async fn run_deception_scan(&self) -> ScanSummary {
        self.deception.scan(&self.shutdown.subscribe()).await
    }

    async fn run_persistence_retry(&self) {
        if self.trust.pending_count() == 0 {
            return;
        }
        let remaining = self.trust.retry_pending().await;
        if remaining > 0 {
            warn!("{} score(s) de confiance toujours en attente d'écriture", remaining);
        }
    }

    /// Signale une alerte, détectée ou manuelle
    pub async fn report_alert(&self, alert: AnomalyAlert) -> u8 {
        self.journal.log_alert(&alert);
        self.alerts.push(alert.clone());
        self.last_reward.insert(alert.device_id.clone(), SystemTime::now());
        self.trust
            .record_alert(&alert.device_id, alert.severity, alert.kind.as_str())
            .await
    }

    /// Retire la redirection d'un équipement
    pub async fn clear_redirect(&self, device_id: &DeviceId) {
        self.translator.clear_redirect(device_id).await;
    }

    /// Installe la politique de moindre privilège, `None` sans profil de référence
    pub async fn install_least_privilege(&self, device_id: &DeviceId) -> Result<Option<usize>, InstallError> {
        let Some(baseline) = self.baselines.get(device_id) else {
            return Ok(None);
        };
        let rules = least_privilege_rules(&baseline);
        self.translator.install_policy(device_id, &rules).await.map(Some)
    }

    /// Menace traitée par un opérateur, la politique est recalculée
    pub async fn resolve_threat(&self, device_id: &DeviceId) -> Option<PolicyDecision> {
        self.threats.resolve(device_id);
        self.trust.reevaluate(device_id).await;
        self.policy.current_decision(device_id)
    }

    /// Profil de référence fourni à l'enrôlement
    pub fn seed_baseline(&self, baseline: BehavioralBaseline) {
        self.baselines.seed(baseline);
    }

    pub fn trust_score(&self, device_id: &DeviceId) -> Option<u8> {
        self.trust.score(device_id)
    }

    pub fn trust_level(&self, device_id: &DeviceId) -> Option<TrustLevel> {
        self.trust.level(device_id)
    }

    pub async fn trust_history(&self, device_id: &DeviceId) -> Vec<TrustHistoryEntry> {
        self.trust.history(device_id).await
    }

    pub fn current_decision(&self, device_id: &DeviceId) -> Option<PolicyDecision> {
        self.policy.current_decision(device_id)
    }

    pub fn decision_history(&self, device_id: &DeviceId) -> Vec<PolicyDecision> {
        self.policy.decision_history(device_id)
    }

    pub fn threat_level(&self, device_id: &DeviceId) -> ThreatLevel {
        self.threats.level(device_id)
    }

    /// Équipements dont le niveau de menace n'est pas nul
    pub fn active_threats(&self) -> Vec<(DeviceId, ThreatLevel)> {
        self.threats.active()
    }

    pub fn baseline(&self, device_id: &DeviceId) -> Option<BehavioralBaseline> {
        self.baselines.get(device_id)
    }

    pub fn active_redirects(&self) -> Vec<RedirectState> {
        self.translator.active_redirects()
    }

    pub fn recent_alerts(&self, count: usize) -> Vec<AnomalyAlert> {
        self.alerts.recent(count)
    }

    pub fn mitigation_rules(&self) -> Vec<MitigationRule> {
        self.translator.mitigation_rules()
    }

    pub fn attestation_history(&self, device_id: &DeviceId) -> Vec<AttestationRecord> {
        self.attestation.history(device_id)
    }

    pub fn intel_stats(&self) -> IntelStats {
        self.deception.intel().stats()
    }

    pub fn unattributed_events(&self, limit: usize) -> Vec<UnattributedEvent> {
        self.deception.intel().unattributed(limit)
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            running: self.is_running(),
            switches: self.collector.switch_count(),
            persistence_degraded: self.trust.is_degraded(),
            pending_writes: self.trust.pending_count(),
            standing_alerts: self.translator.standing_alerts(),
        }
    }
}
